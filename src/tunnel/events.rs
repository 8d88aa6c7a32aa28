//! Tunnel status events
//!
//! Broadcast to every `TunnelController::subscribe` receiver.

use serde::{Deserialize, Serialize};

use super::state::TunnelState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TunnelEvent {
    StateChanged {
        state: TunnelState,
    },
    /// The transport died while running; teardown follows
    ConnectionLost {
        reason: String,
    },
    StartFailed {
        error: String,
    },
    /// One forwarded connection was dropped, the tunnel keeps running
    ChannelOpenFailed {
        local_port: u16,
        remote: String,
    },
}
