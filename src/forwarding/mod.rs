//! Port Forwarding Module
//!
//! Local port forwarding only: each mapping listens on a local port and
//! relays every accepted connection through its own direct-tcpip channel.

mod events;
mod local;
pub mod manager;
mod relay;

pub use events::{ForwardEvent, ForwardEventEmitter};
pub use local::{bind_listener, ForwardError, ForwardStats};
pub use manager::{ForwardOptions, ForwardingManager, ListenerStatus, DEFAULT_BIND_ADDRESS};
pub use relay::{ForwardChannel, RelayEnd};
