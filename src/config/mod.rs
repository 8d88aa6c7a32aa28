//! Configuration Management Module
//!
//! Tunnel configuration types, JSON persistence of the last-used
//! configuration, the equivalent OpenSSH command line, and secure
//! passphrase storage via the system keychain.

pub mod command;
pub mod keychain;
pub mod storage;
pub mod types;

pub use command::{command_args, export_batch, parse_command, render_command, CommandError};
pub use keychain::{KeychainError, KeyringStore, MemoryStore, SecretStore, SERVICE_NAME};
pub use storage::{config_dir, default_config_path, ConfigStorage, StorageError};
pub use types::{ConfigError, ForwardMapping, TunnelConfig};
