//! Tunnel lifecycle states

use serde::{Deserialize, Serialize};

/// `Idle -> Starting -> Running -> Stopping -> Idle`
///
/// `Failed` is entered from `Starting` and always cleaned up back to `Idle`.
/// Listeners and the transport exist only while `Running` or `Stopping`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl TunnelState {
    pub fn is_active(self) -> bool {
        matches!(self, TunnelState::Running | TunnelState::Stopping)
    }
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TunnelState::Idle => "idle",
            TunnelState::Starting => "starting",
            TunnelState::Running => "running",
            TunnelState::Stopping => "stopping",
            TunnelState::Failed => "failed",
        };
        f.write_str(name)
    }
}
