//! Forward Event System
//!
//! Per-connection failures never leave the forwarding layer as errors. They
//! are reported through an optional sink so the owner can surface them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Forward event types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ForwardEvent {
    /// The jump host refused or failed a direct-tcpip open
    ChannelOpenFailed {
        local_port: u16,
        remote: String,
        error: String,
    },
}

type EventSink = Arc<dyn Fn(ForwardEvent) + Send + Sync>;

/// Event emitter for the forwarding module
///
/// Can be a no-op for tests or when events are not needed.
#[derive(Clone)]
pub struct ForwardEventEmitter {
    sink: Option<EventSink>,
}

impl ForwardEventEmitter {
    pub fn new(sink: impl Fn(ForwardEvent) + Send + Sync + 'static) -> Self {
        Self {
            sink: Some(Arc::new(sink)),
        }
    }

    /// Create a no-op emitter
    pub fn noop() -> Self {
        Self { sink: None }
    }

    pub fn emit(&self, event: ForwardEvent) {
        if let Some(ref sink) = self.sink {
            sink(event);
        }
    }

    pub fn emit_channel_open_failed(&self, local_port: u16, remote: String, error: String) {
        self.emit(ForwardEvent::ChannelOpenFailed {
            local_port,
            remote,
            error,
        });
    }
}

impl std::fmt::Debug for ForwardEventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardEventEmitter")
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}
