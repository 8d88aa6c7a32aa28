//! Known hosts check for the jump host key
//!
//! Wraps russh::keys known_hosts functions with the trust-on-first-use policy
//! the tunnel applies.

use std::path::{Path, PathBuf};

use russh::keys::known_hosts::{check_known_hosts_path, learn_known_hosts_path};
use russh::keys::{HashAlg, PublicKey};
use tracing::{debug, info, warn};

use super::error::SshError;

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches a known_hosts entry
    Verified,
    /// Host not in known_hosts (first connection)
    Unknown { fingerprint: String },
    /// Key differs from the known_hosts entry on `line`
    Changed { line: usize, fingerprint: String },
    /// The file exists but could not be checked
    Unreadable { reason: String, fingerprint: String },
}

/// A known_hosts file
#[derive(Debug, Clone)]
pub struct KnownHosts {
    path: PathBuf,
}

impl KnownHosts {
    /// `~/.ssh/known_hosts`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from(".ssh/known_hosts"))
    }

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// SHA256 fingerprint in OpenSSH notation
    pub fn fingerprint(key: &PublicKey) -> String {
        key.fingerprint(HashAlg::Sha256).to_string()
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let fingerprint = Self::fingerprint(key);
        match check_known_hosts_path(host, port, key, &self.path) {
            Ok(true) => {
                debug!("Host key for {}:{} matches {}", host, port, self.path.display());
                HostKeyVerification::Verified
            }
            Ok(false) => HostKeyVerification::Unknown { fingerprint },
            Err(russh::keys::Error::KeyChanged { line }) => {
                warn!(
                    "HOST KEY CHANGED for {}:{} (known_hosts line {}), got {}",
                    host, port, line, fingerprint
                );
                HostKeyVerification::Changed { line, fingerprint }
            }
            Err(e) => {
                warn!("Failed to read {}: {}", self.path.display(), e);
                HostKeyVerification::Unreadable {
                    reason: e.to_string(),
                    fingerprint,
                }
            }
        }
    }

    /// Append the key to the file
    pub fn learn(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        learn_known_hosts_path(host, port, key, &self.path)
            .map_err(|e| SshError::ProtocolError(format!("Failed to save host key: {}", e)))?;
        info!(
            "Added host key for {}:{} to {}",
            host,
            port,
            self.path.display()
        );
        Ok(())
    }
}
