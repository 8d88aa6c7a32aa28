//! Tunnel controller errors

use std::path::PathBuf;

use thiserror::Error;

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::forwarding::ForwardError;
use crate::ssh::SshError;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Key file {} could not be loaded: {reason}", path.display())]
    KeyNotFound { path: PathBuf, reason: String },

    #[error("Invalid key format in {}: {reason}", path.display())]
    InvalidKeyFormat { path: PathBuf, reason: String },

    #[error("Passphrase entry for {} was cancelled", path.display())]
    UserAborted { path: PathBuf },

    #[error("No valid passphrase for {} after {attempts} attempts", path.display())]
    AuthExhausted { path: PathBuf, attempts: u32 },

    #[error("Could not connect to jump host: {0}")]
    ConnectError(#[from] SshError),

    #[error("Could not listen on port {port}: {reason}")]
    BindError { port: u16, reason: String },

    #[error("Tunnel is already running")]
    AlreadyRunning,

    #[error("Credential resolution failed: {0}")]
    Internal(String),
}

impl From<AuthError> for TunnelError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::KeyNotFound { path, reason } => TunnelError::KeyNotFound { path, reason },
            AuthError::InvalidKeyFormat { path, reason } => {
                TunnelError::InvalidKeyFormat { path, reason }
            }
            AuthError::UserAborted { path } => TunnelError::UserAborted { path },
            AuthError::AuthExhausted { path, attempts } => {
                TunnelError::AuthExhausted { path, attempts }
            }
        }
    }
}

impl From<ForwardError> for TunnelError {
    fn from(err: ForwardError) -> Self {
        match err {
            ForwardError::Bind { port, reason } => TunnelError::BindError { port, reason },
        }
    }
}
