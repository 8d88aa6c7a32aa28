//! SSH Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection to {target} failed: {reason}")]
    ConnectionFailed { target: String, reason: String },

    #[error("Authentication failed for {username}@{target}: {reason}")]
    AuthenticationFailed {
        username: String,
        target: String,
        reason: String,
    },

    #[error("Host key verification failed for {target}: {reason}")]
    HostKeyRejected { target: String, reason: String },

    #[error("Failed to open channel to {host}:{port}: {reason}")]
    ChannelOpenFailed {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Transport is not connected")]
    NotConnected,

    #[error("Transport is already connected")]
    AlreadyConnected,

    #[error("Disconnected")]
    Disconnected,
}

impl SshError {
    pub(crate) fn connection(target: impl Into<String>, reason: impl ToString) -> Self {
        SshError::ConnectionFailed {
            target: target.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::Disconnect => SshError::Disconnected,
            other => SshError::ProtocolError(other.to_string()),
        }
    }
}
