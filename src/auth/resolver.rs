//! Credential resolution for the jump host key
//!
//! Order: unencrypted load, cached passphrase from the secret store, then up
//! to three interactive prompts.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::keys::PrivateKey;
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::keys::{load_private_key, KeyError};
use crate::config::SecretStore;

/// Prompt budget for interactive passphrase entry
pub const MAX_PROMPT_ATTEMPTS: u32 = 3;

/// Where a credential's passphrase (if any) came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Unencrypted,
    Keyring,
    Interactive,
}

/// A decoded private key, held only for the handshake
#[derive(Clone)]
pub struct Credential {
    pub key: Arc<PrivateKey>,
    pub source: CredentialSource,
    pub key_path: PathBuf,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("key_path", &self.key_path)
            .field("source", &self.source)
            .field("algorithm", &self.key.algorithm().as_str())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Key file {} could not be loaded: {reason}", path.display())]
    KeyNotFound { path: PathBuf, reason: String },

    #[error("Invalid key format in {}: {reason}", path.display())]
    InvalidKeyFormat { path: PathBuf, reason: String },

    #[error("Passphrase entry for {} was cancelled", path.display())]
    UserAborted { path: PathBuf },

    #[error("No valid passphrase for {} after {attempts} attempts", path.display())]
    AuthExhausted { path: PathBuf, attempts: u32 },
}

/// Answer from a passphrase prompt
pub enum PromptResponse {
    Passphrase(Zeroizing<String>),
    Abort,
}

impl PromptResponse {
    pub fn passphrase(value: impl Into<String>) -> Self {
        PromptResponse::Passphrase(Zeroizing::new(value.into()))
    }
}

/// Blocking passphrase prompt. `attempt` starts at 1.
pub trait PassphrasePrompt: Send + Sync {
    fn prompt(&self, key_path: &Path, attempt: u32) -> PromptResponse;
}

impl<F> PassphrasePrompt for F
where
    F: Fn(&Path, u32) -> PromptResponse + Send + Sync,
{
    fn prompt(&self, key_path: &Path, attempt: u32) -> PromptResponse {
        self(key_path, attempt)
    }
}

/// Resolves a usable credential for a key file
#[derive(Clone)]
pub struct AuthResolver {
    secrets: Arc<dyn SecretStore>,
    service: String,
}

impl AuthResolver {
    pub fn new(secrets: Arc<dyn SecretStore>, service: impl Into<String>) -> Self {
        Self {
            secrets,
            service: service.into(),
        }
    }

    pub fn resolve(
        &self,
        key_path: &Path,
        prompt: &dyn PassphrasePrompt,
    ) -> Result<Credential, AuthError> {
        let credential = |key: PrivateKey, source: CredentialSource| Credential {
            key: Arc::new(key),
            source,
            key_path: key_path.to_path_buf(),
        };

        match load_private_key(key_path, None) {
            Ok(key) => {
                debug!("Key {:?} is not encrypted", key_path);
                return Ok(credential(key, CredentialSource::Unencrypted));
            }
            Err(KeyError::PassphraseRequired) => {}
            Err(e) => return Err(terminal_error(key_path, e)),
        }

        let secret_key = key_path.to_string_lossy();

        match self.secrets.get(&self.service, &secret_key) {
            Ok(Some(cached)) => {
                let cached = Zeroizing::new(cached);
                match load_private_key(key_path, Some(cached.as_str())) {
                    Ok(key) => {
                        info!("Unlocked {:?} with cached passphrase", key_path);
                        return Ok(credential(key, CredentialSource::Keyring));
                    }
                    Err(KeyError::WrongPassphrase) => {
                        warn!("Cached passphrase for {:?} is stale", key_path);
                    }
                    Err(e) => return Err(terminal_error(key_path, e)),
                }
            }
            Ok(None) => debug!("No cached passphrase for {:?}", key_path),
            Err(e) => warn!("Secret store lookup failed, falling back to prompt: {}", e),
        }

        for attempt in 1..=MAX_PROMPT_ATTEMPTS {
            let passphrase = match prompt.prompt(key_path, attempt) {
                PromptResponse::Passphrase(p) => p,
                PromptResponse::Abort => {
                    info!("Passphrase prompt for {:?} aborted", key_path);
                    return Err(AuthError::UserAborted {
                        path: key_path.to_path_buf(),
                    });
                }
            };

            match load_private_key(key_path, Some(passphrase.as_str())) {
                Ok(key) => {
                    if let Err(e) = self.secrets.set(&self.service, &secret_key, &passphrase) {
                        warn!("Could not cache passphrase for {:?}: {}", key_path, e);
                    }
                    info!("Unlocked {:?} on attempt {}", key_path, attempt);
                    return Ok(credential(key, CredentialSource::Interactive));
                }
                Err(KeyError::WrongPassphrase) => {
                    warn!(
                        "Wrong passphrase for {:?} ({}/{})",
                        key_path, attempt, MAX_PROMPT_ATTEMPTS
                    );
                }
                Err(e) => return Err(terminal_error(key_path, e)),
            }
        }

        Err(AuthError::AuthExhausted {
            path: key_path.to_path_buf(),
            attempts: MAX_PROMPT_ATTEMPTS,
        })
    }
}

fn terminal_error(path: &Path, err: KeyError) -> AuthError {
    match err {
        KeyError::InvalidFormat { reason, .. } => AuthError::InvalidKeyFormat {
            path: path.to_path_buf(),
            reason,
        },
        other => AuthError::KeyNotFound {
            path: path.to_path_buf(),
            reason: other.to_string(),
        },
    }
}
