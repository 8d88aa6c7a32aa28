//! SSH transport configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The jump host a transport connects to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JumpTarget {
    /// Jump host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,
}

impl JumpTarget {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
        }
    }

    /// `host:port`, used in logs and errors
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Transport tuning knobs
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// TCP connect + handshake timeout
    pub connect_timeout: Duration,

    /// Interval between SSH keepalives
    pub keepalive_interval: Duration,

    /// Missed keepalives before russh drops the session
    pub keepalive_max: usize,

    /// Reject unknown host keys instead of learning them
    pub strict_host_key_checking: bool,

    /// known_hosts file, `~/.ssh/known_hosts` if unset
    pub known_hosts_path: Option<PathBuf>,
}

fn default_port() -> u16 {
    22
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            keepalive_interval: Duration::from_secs(15),
            keepalive_max: 3,
            strict_host_key_checking: false,
            known_hosts_path: None,
        }
    }
}
