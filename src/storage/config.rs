use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{kv, StorageError};

/// App-wide settings stored in `config.json` at the store root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Worker count assumed for sessions that were never registered
    pub default_workers: u32,
    /// Session used when neither `--session` nor an active session is set
    pub default_session: String,
    /// Default timeout for `wait` and `trigger await`
    pub await_timeout_secs: u64,
    /// Longest task message `send` and `broadcast` accept
    pub max_message_length: usize,
    /// tmux window holding the worker panes
    pub tmux_window: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_workers: 6,
            default_session: "swarm".to_string(),
            await_timeout_secs: 300,
            max_message_length: 50_000,
            tmux_window: "main".to_string(),
        }
    }
}

impl AppConfig {
    /// Load the config, writing defaults first if the file does not exist
    pub(super) fn load_or_init(path: &Path) -> Result<Self, StorageError> {
        let json = match fs::read_to_string(path) {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let config = Self::default();
                config.save(path)?;
                return Ok(config);
            }
            Err(e) => return Err(e.into()),
        };

        let mut config: AppConfig = serde_json::from_str(&json)?;
        if config.default_workers == 0 {
            // a zero-worker session would satisfy the all-done barrier vacuously
            tracing::warn!(
                "Ignoring default_workers = 0 in {}, using {}",
                path.display(),
                Self::default().default_workers
            );
            config.default_workers = Self::default().default_workers;
        }
        Ok(config)
    }

    pub(super) fn save(&self, path: &Path) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(self)?;
        kv::write_atomic(path, json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_keys_fall_back_to_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(&path, r#"{ "default_workers": 3 }"#).unwrap();

        let config = AppConfig::load_or_init(&path).unwrap();
        assert_eq!(config.default_workers, 3);
        assert_eq!(config.default_session, "swarm");
        assert_eq!(config.await_timeout_secs, 300);
    }

    #[test]
    fn test_load_or_init_writes_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");

        let config = AppConfig::load_or_init(&path).unwrap();
        assert_eq!(config, AppConfig::default());

        let written: AppConfig = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, config);
    }

    #[test]
    fn test_zero_default_workers_falls_back() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(&path, r#"{ "default_workers": 0, "await_timeout_secs": 10 }"#).unwrap();

        let config = AppConfig::load_or_init(&path).unwrap();
        assert_eq!(config.default_workers, 6);
        assert_eq!(config.await_timeout_secs, 10);
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(&path, "not json").unwrap();

        assert!(matches!(
            AppConfig::load_or_init(&path),
            Err(StorageError::Json(_))
        ));
    }
}
