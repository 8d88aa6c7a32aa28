//! SSH private key loading
//!
//! Handles loading and classifying private keys:
//! - OpenSSH format (ed25519, ecdsa, rsa)
//! - Legacy PEM and PKCS#8
//! - Encrypted keys with passphrase

use std::path::{Path, PathBuf};

use russh::keys::PrivateKey;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur during key loading
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Key file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to read key file {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid key format in {}: {reason}", path.display())]
    InvalidFormat { path: PathBuf, reason: String },

    #[error("Encrypted key requires passphrase")]
    PassphraseRequired,

    #[error("Invalid passphrase")]
    WrongPassphrase,
}

/// Decode a private key file.
///
/// Blocking (file I/O and, for encrypted keys, bcrypt KDF); callers in async
/// context go through `spawn_blocking`.
pub fn load_private_key(path: &Path, passphrase: Option<&str>) -> Result<PrivateKey, KeyError> {
    let key_data = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => KeyError::NotFound(path.to_path_buf()),
        _ => KeyError::Unreadable {
            path: path.to_path_buf(),
            source: e,
        },
    })?;

    debug!("Decoding key from {:?} (passphrase: {})", path, passphrase.is_some());

    match passphrase {
        None => russh::keys::decode_secret_key(&key_data, None).map_err(|e| match e {
            russh::keys::Error::KeyIsEncrypted => KeyError::PassphraseRequired,
            // Legacy PEM reports encryption only through its headers
            _ if key_data.contains("ENCRYPTED") => KeyError::PassphraseRequired,
            other => KeyError::InvalidFormat {
                path: path.to_path_buf(),
                reason: other.to_string(),
            },
        }),
        Some(pass) => russh::keys::decode_secret_key(&key_data, Some(pass)).map_err(|e| {
            if is_decryption_failure(&e) {
                KeyError::WrongPassphrase
            } else {
                KeyError::InvalidFormat {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }
            }
        }),
    }
}

/// Whether a decode error means the passphrase did not decrypt the key, as
/// opposed to a key we cannot handle at all
fn is_decryption_failure(err: &russh::keys::Error) -> bool {
    use russh::keys::{ssh_key, Error};

    match err {
        // OpenSSH format: checkint mismatch
        Error::SshKey(ssh_key::Error::Crypto) => true,
        // Legacy PEM: bad padding after AES-CBC
        Error::Unpad(_) => true,
        Error::Pkcs8(e) => e.to_string().contains("decryption failed"),
        _ => false,
    }
}

/// Default SSH key paths, most preferred first
pub fn default_key_paths() -> Vec<PathBuf> {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let ssh_dir = home.join(".ssh");

    vec![
        ssh_dir.join("id_ed25519"),
        ssh_dir.join("id_ecdsa"),
        ssh_dir.join("id_rsa"),
    ]
}

/// First default key that exists on disk
pub fn first_default_key() -> Option<PathBuf> {
    default_key_paths().into_iter().find(|p| p.exists())
}

/// Expand ~ to home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path_str == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }

    path.to_path_buf()
}
