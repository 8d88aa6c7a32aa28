//! Tunnel configuration types and validation

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::expand_tilde;
use crate::ssh::JumpTarget;

static IPV4_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.(\d{1,3})").expect("static regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must not be empty")]
    EmptyHost { field: &'static str },

    #[error("{value:?} is not a valid IPv4 address")]
    InvalidIpv4 { value: String },

    #[error("{0:?} is not a valid username")]
    InvalidUsername(String),

    #[error("Label {0:?} must be printable")]
    UnprintableLabel(String),

    #[error("Local port {0} is used by more than one forwarding")]
    DuplicateLocalPort(u16),
}

/// One tunnel leg: `local_port` -> `remote_host:remote_port`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ForwardMapping {
    pub local_port: u16,

    /// Destination as resolved by the jump host
    #[serde(rename = "hostname")]
    pub remote_host: String,

    pub remote_port: u16,

    /// Cosmetic only
    #[serde(default)]
    pub label: String,
}

impl ForwardMapping {
    pub fn new(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            local_port,
            remote_host: remote_host.into(),
            remote_port,
            label: String::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_host("Remote hostname", &self.remote_host)?;
        if self.label.chars().any(char::is_control) {
            return Err(ConfigError::UnprintableLabel(self.label.clone()));
        }
        Ok(())
    }
}

impl std::fmt::Display for ForwardMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.local_port, self.remote_host, self.remote_port)
    }
}

/// Whole-tunnel configuration, the JSON document the front end edits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub jump_host: String,

    #[serde(default)]
    pub username: String,

    #[serde(default = "default_jump_port")]
    pub jump_port: u16,

    /// Private key path; default key locations are tried when unset
    #[serde(default, alias = "key")]
    pub key_path: Option<String>,

    #[serde(default)]
    pub forwardings: Vec<ForwardMapping>,
}

fn default_jump_port() -> u16 {
    22
}

impl TunnelConfig {
    pub fn new(jump_host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            jump_host: jump_host.into(),
            username: username.into(),
            jump_port: default_jump_port(),
            key_path: None,
            forwardings: Vec::new(),
        }
    }

    /// Checks everything that can be checked without touching the network or
    /// binding a socket.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_host("Jump host", &self.jump_host)?;

        if !self
            .username
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_'))
        {
            return Err(ConfigError::InvalidUsername(self.username.clone()));
        }

        let mut seen = HashSet::with_capacity(self.forwardings.len());
        for mapping in &self.forwardings {
            mapping.validate()?;
            if !seen.insert(mapping.local_port) {
                return Err(ConfigError::DuplicateLocalPort(mapping.local_port));
            }
        }
        Ok(())
    }

    pub fn target(&self) -> JumpTarget {
        JumpTarget::new(&self.jump_host, self.jump_port, &self.username)
    }

    /// Key path with `~` expanded
    pub fn expanded_key_path(&self) -> Option<PathBuf> {
        self.key_path
            .as_deref()
            .map(|p| expand_tilde(std::path::Path::new(p)))
    }
}

fn validate_host(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::EmptyHost { field });
    }

    // Anything that looks like a dotted quad must be a valid one
    if IPV4_PATTERN.is_match(value) {
        let valid = IPV4_PATTERN
            .captures(value)
            .filter(|caps| caps.get(0).map(|m| m.as_str()) == Some(value))
            .map(|caps| {
                (1..=4).all(|i| {
                    caps.get(i)
                        .and_then(|m| m.as_str().parse::<u16>().ok())
                        .is_some_and(|octet| octet <= 255)
                })
            })
            .unwrap_or(false);
        if !valid {
            return Err(ConfigError::InvalidIpv4 {
                value: value.to_string(),
            });
        }
    }
    Ok(())
}
