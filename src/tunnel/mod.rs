//! Tunnel lifecycle: one jump host connection plus its forwarded ports,
//! started and stopped as a unit.

mod controller;
mod error;
mod events;
mod state;

pub use controller::{ControllerOptions, TunnelController};
pub use error::TunnelError;
pub use events::TunnelEvent;
pub use state::TunnelState;
