//! Secret storage
//!
//! Passphrases for encrypted keys are cached in the system keychain through
//! the `keyring` crate. The tunnel treats the store as best effort: callers
//! log failures and carry on.

use std::collections::HashMap;

use keyring::Entry;
use parking_lot::RwLock;

/// Default service name for keychain entries
pub const SERVICE_NAME: &str = "jumpforward";

/// Keychain errors
#[derive(Debug, thiserror::Error)]
pub enum KeychainError {
    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Secret store unavailable: {0}")]
    Unavailable(String),
}

/// Key/value secret storage keyed by `(service, key)`
pub trait SecretStore: Send + Sync {
    /// `Ok(None)` when nothing is stored under the key
    fn get(&self, service: &str, key: &str) -> Result<Option<String>, KeychainError>;

    fn set(&self, service: &str, key: &str, value: &str) -> Result<(), KeychainError>;
}

/// System keychain backed store
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyringStore;

impl KeyringStore {
    pub fn new() -> Self {
        Self
    }

    fn entry(service: &str, key: &str) -> Result<Entry, KeychainError> {
        // Explicit username keeps the keychain identity stable on macOS
        let username = whoami::username();
        Ok(Entry::new(service, &format!("{}@{}", username, key))?)
    }
}

impl SecretStore for KeyringStore {
    fn get(&self, service: &str, key: &str) -> Result<Option<String>, KeychainError> {
        tracing::debug!("Keychain get: service={}, key={}", service, key);
        match Self::entry(service, key)?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(KeychainError::Keyring(e)),
        }
    }

    fn set(&self, service: &str, key: &str, value: &str) -> Result<(), KeychainError> {
        tracing::debug!("Keychain store: service={}, key={}", service, key);
        Self::entry(service, key)?.set_password(value)?;
        Ok(())
    }
}

/// Process-local store, used with `--no-keyring` and in tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    secrets: RwLock<HashMap<(String, String), String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.secrets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.read().is_empty()
    }
}

impl SecretStore for MemoryStore {
    fn get(&self, service: &str, key: &str) -> Result<Option<String>, KeychainError> {
        Ok(self
            .secrets
            .read()
            .get(&(service.to_string(), key.to_string()))
            .cloned())
    }

    fn set(&self, service: &str, key: &str, value: &str) -> Result<(), KeychainError> {
        self.secrets
            .write()
            .insert((service.to_string(), key.to_string()), value.to_string());
        Ok(())
    }
}
