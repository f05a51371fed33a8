use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{kv, StorageError};

/// Directory layout of one session's coordination state
#[derive(Debug, Clone)]
pub struct SessionNamespace {
    name: String,
    root: PathBuf,
    worker_count: u32,
}

impl SessionNamespace {
    pub(crate) fn new(name: &str, root: PathBuf, worker_count: u32) -> Self {
        Self {
            name: name.to_string(),
            root,
            worker_count,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Registered worker count, or the configured default for unregistered sessions
    pub fn worker_count(&self) -> u32 {
        self.worker_count
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn workers_dir(&self) -> PathBuf {
        self.state_dir().join("workers")
    }

    pub fn triggers_dir(&self) -> PathBuf {
        self.root.join("triggers")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root.join("results")
    }

    pub fn master_lock_path(&self) -> PathBuf {
        self.locks_dir().join(".master.lock")
    }

    fn protocol_file(&self) -> PathBuf {
        self.state_dir().join("protocol")
    }

    fn phase_file(&self) -> PathBuf {
        self.state_dir().join("phase")
    }

    /// Create every directory of the namespace. Called before each write, since
    /// a worker may be the first process to touch a freshly registered session.
    pub fn ensure(&self) -> Result<(), StorageError> {
        fs::create_dir_all(self.workers_dir())?;
        fs::create_dir_all(self.triggers_dir())?;
        fs::create_dir_all(self.locks_dir())?;
        fs::create_dir_all(self.results_dir())?;
        Ok(())
    }

    /// Reject worker ids outside `0..worker_count`
    pub fn check_worker(&self, worker_id: u32) -> Result<(), StorageError> {
        if worker_id >= self.worker_count {
            return Err(StorageError::WorkerOutOfRange {
                worker_id,
                worker_count: self.worker_count,
            });
        }
        Ok(())
    }

    pub fn worker_ids(&self) -> std::ops::Range<u32> {
        0..self.worker_count
    }

    fn read_value(path: &Path) -> Option<String> {
        let value = fs::read_to_string(path).ok()?;
        let value = value.trim();
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }

    fn write_value(&self, path: &Path, value: &str) -> Result<(), StorageError> {
        self.ensure()?;
        kv::write_atomic(path, value.as_bytes())?;
        Ok(())
    }

    fn remove_value(path: &Path) -> Result<(), StorageError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn protocol(&self) -> Option<String> {
        Self::read_value(&self.protocol_file())
    }

    pub fn set_protocol(&self, name: &str) -> Result<(), StorageError> {
        self.write_value(&self.protocol_file(), name)?;
        tracing::info!("Session {} protocol set to {}", self.name, name);
        Ok(())
    }

    pub fn phase(&self) -> Option<String> {
        Self::read_value(&self.phase_file())
    }

    pub fn set_phase(&self, phase: &str) -> Result<(), StorageError> {
        self.write_value(&self.phase_file(), phase)?;
        tracing::info!("Session {} phase set to {}", self.name, phase);
        Ok(())
    }

    /// Forget the active protocol and phase
    pub fn clear_protocol_and_phase(&self) -> Result<(), StorageError> {
        Self::remove_value(&self.protocol_file())?;
        Self::remove_value(&self.phase_file())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_namespace() -> (SessionNamespace, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let ns = SessionNamespace::new("swarm", temp_dir.path().join("swarm"), 3);
        (ns, temp_dir)
    }

    #[test]
    fn test_ensure_creates_layout() {
        let (ns, _temp_dir) = create_test_namespace();
        assert!(!ns.root().exists());

        ns.ensure().unwrap();
        ns.ensure().unwrap();

        assert!(ns.workers_dir().is_dir());
        assert!(ns.triggers_dir().is_dir());
        assert!(ns.locks_dir().is_dir());
        assert!(ns.results_dir().is_dir());
        assert_eq!(ns.master_lock_path(), ns.root().join("locks").join(".master.lock"));
    }

    #[test]
    fn test_check_worker_range() {
        let (ns, _temp_dir) = create_test_namespace();

        assert!(ns.check_worker(0).is_ok());
        assert!(ns.check_worker(2).is_ok());
        assert!(matches!(
            ns.check_worker(3),
            Err(StorageError::WorkerOutOfRange { worker_id: 3, worker_count: 3 })
        ));
        assert_eq!(ns.worker_ids().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_protocol_and_phase_values() {
        let (ns, _temp_dir) = create_test_namespace();

        assert_eq!(ns.protocol(), None);
        assert_eq!(ns.phase(), None);

        ns.set_protocol("review").unwrap();
        ns.set_phase("explore").unwrap();
        assert_eq!(ns.protocol(), Some("review".to_string()));
        assert_eq!(ns.phase(), Some("explore".to_string()));
        assert_eq!(
            fs::read_to_string(ns.state_dir().join("phase")).unwrap(),
            "explore"
        );

        ns.clear_protocol_and_phase().unwrap();
        ns.clear_protocol_and_phase().unwrap();
        assert_eq!(ns.protocol(), None);
        assert_eq!(ns.phase(), None);
    }
}
