//! russh client handler

use russh::client;
use russh::keys::PublicKey;
use tracing::{info, warn};

use super::error::SshError;
use super::known_hosts::{HostKeyVerification, KnownHosts};

/// Client handler for russh callbacks
///
/// Only host key verification is handled here; the tunnel never accepts
/// server-initiated channels.
pub struct ClientHandler {
    /// Target host for key verification
    host: String,
    /// Target port
    port: u16,
    /// - true: reject unknown keys
    /// - false: learn unknown keys (still reject changed)
    strict: bool,
    known_hosts: KnownHosts,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, strict: bool, known_hosts: KnownHosts) -> Self {
        Self {
            host,
            port,
            strict,
            known_hosts,
        }
    }

    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match self
            .known_hosts
            .verify(&self.host, self.port, server_public_key)
        {
            HostKeyVerification::Verified => {
                info!("Host key verified for {}", self.target());
                Ok(true)
            }
            HostKeyVerification::Unknown { fingerprint } => {
                if self.strict {
                    warn!(
                        "Unknown host key for {} (fingerprint: {}). Strict mode enabled, rejecting.",
                        self.target(),
                        fingerprint
                    );
                    return Err(SshError::HostKeyRejected {
                        target: self.target(),
                        reason: format!(
                            "unknown host key {}, add it to {} or disable strict checking",
                            fingerprint,
                            self.known_hosts.path().display()
                        ),
                    });
                }

                info!(
                    "New host {}, adding to known_hosts (fingerprint: {})",
                    self.target(),
                    fingerprint
                );
                if let Err(e) = self
                    .known_hosts
                    .learn(&self.host, self.port, server_public_key)
                {
                    warn!("Failed to save host key: {}", e);
                }
                Ok(true)
            }
            HostKeyVerification::Changed { line, fingerprint } => {
                warn!(
                    "HOST KEY CHANGED for {}! Got {}. POSSIBLE MITM ATTACK!",
                    self.target(),
                    fingerprint
                );
                Err(SshError::HostKeyRejected {
                    target: self.target(),
                    reason: format!(
                        "key changed to {} (mismatch with {} line {})",
                        fingerprint,
                        self.known_hosts.path().display(),
                        line
                    ),
                })
            }
            HostKeyVerification::Unreadable { reason, fingerprint } => {
                warn!(
                    "Cannot check host key {} for {}: {}",
                    fingerprint,
                    self.target(),
                    reason
                );
                Err(SshError::HostKeyRejected {
                    target: self.target(),
                    reason: format!(
                        "could not read {}: {}",
                        self.known_hosts.path().display(),
                        reason
                    ),
                })
            }
        }
    }
}
