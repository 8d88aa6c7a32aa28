//! jumpforward - multiplexed local port forwarding over one SSH jump host
//!
//! A single authenticated SSH connection carries any number of
//! `local_port -> remote_host:remote_port` forwardings. The
//! [`tunnel::TunnelController`] starts and stops the whole set as one unit.

pub mod auth;
pub mod config;
pub mod forwarding;
pub mod ssh;
pub mod tunnel;

pub use config::{ForwardMapping, TunnelConfig};
pub use tunnel::{ControllerOptions, TunnelController, TunnelError, TunnelEvent, TunnelState};
