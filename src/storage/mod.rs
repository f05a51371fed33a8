mod config;
mod flock;
mod kv;
mod namespace;

pub use config::AppConfig;
pub use flock::ExclusiveFileLock;
pub use kv::DirStore;
pub use namespace::SessionNamespace;

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest accepted session name
pub const MAX_SESSION_NAME_LEN: usize = 64;

/// Environment variable overriding the store root
pub const HOME_ENV: &str = "HIVE_SWARM_HOME";

const ACTIVE_SESSION_FILE: &str = "active_session";

/// Protocols shipped with the binary, installed into `protocols/` on first use
const BUILTIN_PROTOCOLS: &[(&str, &str)] = &[
    ("parallel", include_str!("protocols/parallel.md")),
    ("pipeline", include_str!("protocols/pipeline.md")),
];
const SESSION_METADATA_FILE: &str = "session.json";

/// Regex for validating session names - only alphanumeric, dash, and underscore allowed
static SESSION_NAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9_-]+$").expect("Invalid session name validation regex")
});

/// Validate a session name before it is used as a directory name.
/// Names must be 1-64 characters of alphanumerics, dashes, and underscores.
pub fn validate_session_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty() {
        return Err(StorageError::InvalidSessionName(
            "Session name cannot be empty".to_string(),
        ));
    }

    if name.len() > MAX_SESSION_NAME_LEN {
        return Err(StorageError::InvalidSessionName(format!(
            "Session name '{}' is longer than {} characters",
            name, MAX_SESSION_NAME_LEN
        )));
    }

    if !SESSION_NAME_REGEX.is_match(name) {
        return Err(StorageError::InvalidSessionName(format!(
            "Session name '{}' must contain only alphanumeric characters, dashes, and underscores",
            name
        )));
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid session name: {0}")]
    InvalidSessionName(String),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Invalid worker ID {worker_id}: session has {worker_count} workers")]
    WorkerOutOfRange { worker_id: u32, worker_count: u32 },
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("Invalid worker count: a session needs at least one worker")]
    InvalidWorkerCount,
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("Home directory not found: {0}")]
    HomeNotFound(String),
}

/// Persisted session metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub name: String,
    pub workspace: PathBuf,
    pub worker_count: u32,
    pub created_at: DateTime<Utc>,
    pub tmux_session: String,
    pub tmux_window: String,
}

/// Root of the coordination store: registry, config, and per-session namespaces
pub struct SwarmStorage {
    base_dir: PathBuf,
    config: AppConfig,
}

impl SwarmStorage {
    /// Open the store at the default location, initializing it if needed
    pub fn new() -> Result<Self, StorageError> {
        let base_dir = Self::get_app_data_dir()?;
        Self::new_with_base(base_dir)
    }

    /// Open the store at a custom base directory (for `--home` and tests)
    pub fn new_with_base(base_dir: PathBuf) -> Result<Self, StorageError> {
        fs::create_dir_all(&base_dir)?;
        fs::create_dir_all(base_dir.join("sessions"))?;
        fs::create_dir_all(base_dir.join("protocols"))?;

        let config = AppConfig::load_or_init(&base_dir.join("config.json"))?;

        let storage = Self { base_dir, config };
        storage.install_default_protocols()?;
        Ok(storage)
    }

    /// Get the app data directory path
    fn get_app_data_dir() -> Result<PathBuf, StorageError> {
        if let Ok(home) = std::env::var(HOME_ENV) {
            if !home.is_empty() {
                return Ok(PathBuf::from(home));
            }
        }

        #[cfg(windows)]
        {
            std::env::var("APPDATA")
                .map(|p| PathBuf::from(p).join("hive-swarm"))
                .map_err(|_| StorageError::HomeNotFound("APPDATA not set".to_string()))
        }
        #[cfg(not(windows))]
        {
            std::env::var("HOME")
                .map(|p| PathBuf::from(p).join(".config").join("hive-swarm"))
                .map_err(|_| StorageError::HomeNotFound("HOME not set".to_string()))
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Get the config file path
    pub fn config_path(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Get path to sessions directory
    pub fn sessions_dir(&self) -> PathBuf {
        self.base_dir.join("sessions")
    }

    /// Get path to protocols directory
    pub fn protocols_dir(&self) -> PathBuf {
        self.base_dir.join("protocols")
    }

    /// Get path to a session directory with validation
    pub fn session_dir(&self, name: &str) -> Result<PathBuf, StorageError> {
        validate_session_name(name)?;
        Ok(self.sessions_dir().join(name))
    }

    fn active_pointer_path(&self) -> PathBuf {
        self.base_dir.join(ACTIVE_SESSION_FILE)
    }

    // ---------------------------------------------------------------------
    // Session registry
    // ---------------------------------------------------------------------

    /// Register a session, create its namespace, and make it active.
    /// Any previous registration under the same name is overwritten.
    pub fn register(
        &self,
        name: &str,
        workspace: &Path,
        worker_count: u32,
    ) -> Result<SessionInfo, StorageError> {
        validate_session_name(name)?;
        if worker_count == 0 {
            return Err(StorageError::InvalidWorkerCount);
        }

        let info = SessionInfo {
            name: name.to_string(),
            workspace: workspace.to_path_buf(),
            worker_count,
            created_at: Utc::now(),
            tmux_session: name.to_string(),
            tmux_window: self.config.tmux_window.clone(),
        };

        let namespace = SessionNamespace::new(name, self.session_dir(name)?, worker_count);
        namespace.ensure()?;

        let json = serde_json::to_string_pretty(&info)?;
        kv::write_atomic(&namespace.root().join(SESSION_METADATA_FILE), json.as_bytes())?;

        self.set_active(name)?;

        tracing::info!(
            "Registered session {} ({} workers, workspace {})",
            name,
            worker_count,
            workspace.display()
        );
        Ok(info)
    }

    /// Remove a session and all of its state. Returns false if it did not exist.
    pub fn unregister(&self, name: &str) -> Result<bool, StorageError> {
        let session_dir = self.session_dir(name)?;

        let removed = match fs::remove_dir_all(&session_dir) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        if self.read_active_pointer().as_deref() == Some(name) {
            self.clear_active()?;
        }

        if removed {
            tracing::info!("Unregistered session {}", name);
        }
        Ok(removed)
    }

    /// Load session metadata. Missing or unreadable metadata is `None`.
    pub fn get_info(&self, name: &str) -> Result<Option<SessionInfo>, StorageError> {
        let path = self.session_dir(name)?.join(SESSION_METADATA_FILE);

        let json = match fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<SessionInfo>(&json) {
            Ok(info) => Ok(Some(info)),
            Err(e) => {
                tracing::warn!("Ignoring corrupt metadata for session {}: {}", name, e);
                Ok(None)
            }
        }
    }

    /// List all registered sessions, newest first
    pub fn list(&self) -> Result<Vec<SessionInfo>, StorageError> {
        let sessions_dir = self.sessions_dir();
        let mut sessions = Vec::new();

        let entries = match fs::read_dir(&sessions_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(sessions),
            Err(e) => return Err(e.into()),
        };

        for entry in entries.flatten() {
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if let Ok(Some(info)) = self.get_info(&name) {
                sessions.push(info);
            }
        }

        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(sessions)
    }

    fn read_active_pointer(&self) -> Option<String> {
        let name = fs::read_to_string(self.active_pointer_path()).ok()?;
        let name = name.trim();
        if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        }
    }

    /// Get the active session, ignoring a pointer to a session that no longer exists
    pub fn get_active(&self) -> Option<String> {
        let name = self.read_active_pointer()?;
        match self.get_info(&name) {
            Ok(Some(_)) => Some(name),
            _ => {
                tracing::debug!("Active session pointer names missing session {}", name);
                None
            }
        }
    }

    /// Point the active session at `name` without checking it is registered
    pub fn set_active(&self, name: &str) -> Result<(), StorageError> {
        validate_session_name(name)?;
        kv::write_atomic(&self.active_pointer_path(), name.as_bytes())?;
        Ok(())
    }

    /// Clear the active session pointer
    pub fn clear_active(&self) -> Result<(), StorageError> {
        match fs::remove_file(self.active_pointer_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Pick the session a command operates on: explicit name, then the
    /// active session, then the configured default.
    pub fn resolve_session(&self, explicit: Option<&str>) -> Result<String, StorageError> {
        let name = match explicit {
            Some(name) => name.to_string(),
            None => self
                .get_active()
                .unwrap_or_else(|| self.config.default_session.clone()),
        };
        validate_session_name(&name)?;
        Ok(name)
    }

    /// Worker count for a session, falling back to the configured default
    /// when the session is not registered
    pub fn worker_count(&self, name: &str) -> u32 {
        match self.get_info(name) {
            Ok(Some(info)) => info.worker_count,
            _ => self.config.default_workers,
        }
    }

    /// Resolve the state namespace for a session. Directories are created
    /// lazily by the stores that write into them.
    pub fn namespace(&self, name: &str) -> Result<SessionNamespace, StorageError> {
        let root = self.session_dir(name)?;
        Ok(SessionNamespace::new(name, root, self.worker_count(name)))
    }

    // ---------------------------------------------------------------------
    // Protocol library
    // ---------------------------------------------------------------------

    /// Copy the built-in protocols into the protocols directory. Existing
    /// files are never overwritten, so local edits survive upgrades.
    pub fn install_default_protocols(&self) -> Result<usize, StorageError> {
        let mut installed = 0;
        for (name, body) in BUILTIN_PROTOCOLS {
            let path = self.protocols_dir().join(format!("{}.md", name));
            if path.exists() {
                continue;
            }
            kv::write_atomic(&path, body.as_bytes())?;
            installed += 1;
        }

        if installed > 0 {
            tracing::info!("Installed {} built-in protocol(s)", installed);
        }
        Ok(installed)
    }

    /// List the protocol names available in the protocols directory
    pub fn list_protocols(&self) -> Result<Vec<String>, StorageError> {
        let dir = DirStore::new(self.protocols_dir(), Some("md"));
        let mut names = dir.keys()?;
        names.sort();
        Ok(names)
    }

    /// Read a protocol document. Returns `None` if not found.
    pub fn read_protocol(&self, name: &str) -> Result<Option<String>, StorageError> {
        DirStore::new(self.protocols_dir(), Some("md")).get(name)
    }

    /// Make `name` the session's protocol. Returns false if no such protocol exists.
    pub fn activate_protocol(
        &self,
        namespace: &SessionNamespace,
        name: &str,
    ) -> Result<bool, StorageError> {
        if self.read_protocol(name)?.is_none() {
            return Ok(false);
        }
        namespace.set_protocol(name)?;
        Ok(true)
    }

    /// Check a task message before it is handed to a worker
    pub fn validate_message(&self, message: &str) -> Result<(), StorageError> {
        if message.trim().is_empty() {
            return Err(StorageError::InvalidMessage("Message cannot be empty".to_string()));
        }

        let max = self.config.max_message_length;
        let len = message.chars().count();
        if len > max {
            return Err(StorageError::InvalidMessage(format!(
                "Message is {} characters, limit is {}",
                len, max
            )));
        }

        Ok(())
    }
}
