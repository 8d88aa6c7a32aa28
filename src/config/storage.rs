//! Configuration Storage
//!
//! Reads and writes tunnel configurations as JSON.
//! The last-used file lives under the per-user config directory
//! (`~/.config/jumpforward` on Linux, `%APPDATA%\jumpforward` on Windows).

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::types::{ConfigError, TunnelConfig};

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("Could not access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Error while parsing {} (line {line}): {reason}", path.display())]
    Corrupted {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Invalid configuration in {}: {source}", path.display())]
    Invalid {
        path: PathBuf,
        #[source]
        source: ConfigError,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Get the jumpforward configuration directory
pub fn config_dir() -> Result<PathBuf, StorageError> {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .map(|dir| dir.join("jumpforward"))
        .ok_or(StorageError::NoConfigDir)
}

/// Where the last successfully started configuration is remembered
pub fn default_config_path() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("lastused.json"))
}

/// JSON file holding one `TunnelConfig`
#[derive(Debug, Clone)]
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.clone(),
            source,
        }
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_err(e))?;
        }
        Ok(())
    }

    /// Load and validate the configuration.
    ///
    /// Returns `Ok(None)` if the file does not exist. A file that fails to
    /// parse is backed up next to the original before the error is returned.
    pub async fn load(&self) -> Result<Option<TunnelConfig>, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_err(e)),
        };

        let config: TunnelConfig = match serde_json::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Config file {:?} corrupted: {}", self.path, e);
                match self.backup().await {
                    Ok(backup_path) => {
                        tracing::warn!("Corrupted config backed up to {:?}", backup_path)
                    }
                    Err(backup_err) => {
                        tracing::error!("Failed to backup corrupted config: {}", backup_err)
                    }
                }
                return Err(StorageError::Corrupted {
                    path: self.path.clone(),
                    line: e.line(),
                    reason: e.to_string(),
                });
            }
        };

        config.validate().map_err(|source| StorageError::Invalid {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(config))
    }

    /// Save configuration to disk (temp file + rename)
    pub async fn save(&self, config: &TunnelConfig) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(config)?;

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| self.io_err(e))?;
        file.write_all(json.as_bytes())
            .await
            .map_err(|e| self.io_err(e))?;
        file.sync_all().await.map_err(|e| self.io_err(e))?;

        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| self.io_err(e))?;

        Ok(())
    }

    /// Copy the current file to a timestamped backup
    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));

        if fs::metadata(&self.path).await.is_ok() {
            fs::copy(&self.path, &backup_path)
                .await
                .map_err(|e| self.io_err(e))?;
        }

        Ok(backup_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForwardMapping;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_nonexistent() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("test.json"));

        assert!(storage.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("nested").join("test.json"));

        let mut config = TunnelConfig::new("jump.example.com", "alice");
        config
            .forwardings
            .push(ForwardMapping::new(5432, "db.internal", 5432).with_label("postgres"));

        storage.save(&config).await.unwrap();

        let loaded = storage.load().await.unwrap().unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_corrupted_file_is_backed_up() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("broken.json");
        std::fs::write(&path, "{\n  \"jump_host\": ").unwrap();
        let storage = ConfigStorage::with_path(&path);

        match storage.load().await {
            Err(StorageError::Corrupted { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected corrupted error, got {:?}", other),
        }

        let backups = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains("backup"))
            .count();
        assert_eq!(backups, 1);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("dup.json");
        std::fs::write(
            &path,
            r#"{"jump_host": "h", "forwardings": [
                {"local_port": 1, "hostname": "a", "remote_port": 1},
                {"local_port": 1, "hostname": "b", "remote_port": 2}
            ]}"#,
        )
        .unwrap();

        let err = ConfigStorage::with_path(&path).load().await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::Invalid {
                source: ConfigError::DuplicateLocalPort(1),
                ..
            }
        ));
    }
}
