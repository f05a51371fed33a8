use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::Serialize;

use crate::storage::{DirStore, ExclusiveFileLock, SessionNamespace, StorageError};

/// A requested path that another worker already holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockConflict {
    /// Holder of the path, as `worker-{id}`
    pub owner: String,
    pub path: String,
}

impl fmt::Display for LockConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.path, self.owner)
    }
}

/// Outcome of [`LockStore::acquire`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAcquisition {
    Granted,
    /// Nothing was written; every colliding (owner, path) pair is listed
    Conflicted(Vec<LockConflict>),
}

impl LockAcquisition {
    pub fn is_granted(&self) -> bool {
        matches!(self, LockAcquisition::Granted)
    }

    pub fn conflicts(&self) -> &[LockConflict] {
        match self {
            LockAcquisition::Granted => &[],
            LockAcquisition::Conflicted(conflicts) => conflicts,
        }
    }
}

fn owner_key(worker_id: u32) -> String {
    format!("worker-{}", worker_id)
}

/// A path must fit on one line of the lock record
fn validate_path(path: &str) -> Result<(), StorageError> {
    if path.is_empty() {
        return Err(StorageError::InvalidPath("Path cannot be empty".to_string()));
    }
    if path.contains(['\n', '\r']) {
        return Err(StorageError::InvalidPath(format!(
            "Path cannot contain line breaks: {:?}",
            path
        )));
    }
    Ok(())
}

fn parse_owner_key(key: &str) -> Option<u32> {
    key.strip_prefix("worker-")?.parse().ok()
}

/// Stored paths compare byte for byte with requested ones, so lines are not trimmed
fn parse_paths(contents: &str) -> Vec<String> {
    contents
        .split('\n')
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Advisory claims on file paths, one record per worker (`locks/worker-{id}.lock`)
pub struct LockStore {
    namespace: SessionNamespace,
    records: DirStore,
}

impl LockStore {
    pub fn new(namespace: &SessionNamespace) -> Self {
        Self {
            records: DirStore::new(namespace.locks_dir(), Some("lock")),
            namespace: namespace.clone(),
        }
    }

    /// Claim `files` for `worker_id`, replacing whatever it claimed before.
    ///
    /// The conflict scan and the write both happen under the session's master
    /// lock, so two workers racing for the same path cannot both win. The
    /// worker's own previous claim never conflicts with itself.
    pub fn acquire(
        &self,
        worker_id: u32,
        files: &[String],
    ) -> Result<LockAcquisition, StorageError> {
        self.namespace.check_worker(worker_id)?;
        for file in files {
            validate_path(file)?;
        }
        self.namespace.ensure()?;

        let own_key = owner_key(worker_id);
        let _master = ExclusiveFileLock::acquire(&self.namespace.master_lock_path())?;

        let mut conflicts = Vec::new();
        for key in self.records.keys()? {
            if key == own_key {
                continue;
            }
            let held: HashSet<String> = match self.records.get(&key) {
                Ok(Some(contents)) => parse_paths(&contents).into_iter().collect(),
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Skipping unreadable lock record {}: {}", key, e);
                    continue;
                }
            };
            conflicts.extend(files.iter().filter(|f| held.contains(*f)).map(|f| LockConflict {
                owner: key.clone(),
                path: f.clone(),
            }));
        }

        if !conflicts.is_empty() {
            tracing::info!(
                "Worker {} lock request in session {} conflicts on {} path(s)",
                worker_id,
                self.namespace.name(),
                conflicts.len()
            );
            return Ok(LockAcquisition::Conflicted(conflicts));
        }

        self.records.put(&own_key, &files.join("\n"))?;
        tracing::info!(
            "Worker {} locked {} file(s) in session {}",
            worker_id,
            files.len(),
            self.namespace.name()
        );
        Ok(LockAcquisition::Granted)
    }

    /// Drop a worker's claim. Returns false if it held nothing.
    pub fn release(&self, worker_id: u32) -> Result<bool, StorageError> {
        let released = self.records.delete(&owner_key(worker_id))?;
        if released {
            tracing::info!(
                "Worker {} released its locks in session {}",
                worker_id,
                self.namespace.name()
            );
        }
        Ok(released)
    }

    /// Release a worker's claim under the master lock and return the paths
    /// it actually held
    pub fn take(&self, worker_id: u32) -> Result<Vec<String>, StorageError> {
        self.namespace.check_worker(worker_id)?;
        self.namespace.ensure()?;

        let key = owner_key(worker_id);
        let _master = ExclusiveFileLock::acquire(&self.namespace.master_lock_path())?;

        let held = self.records.get(&key)?.map(|c| parse_paths(&c)).unwrap_or_default();
        if self.records.delete(&key)? {
            tracing::info!(
                "Worker {} released {} lock(s) in session {}",
                worker_id,
                held.len(),
                self.namespace.name()
            );
        }
        Ok(held)
    }

    /// Drop every claim in the session
    pub fn release_all(&self) -> Result<usize, StorageError> {
        self.records.clear()
    }

    /// Paths currently claimed by a worker
    pub fn held_by(&self, worker_id: u32) -> Vec<String> {
        match self.records.get(&owner_key(worker_id)) {
            Ok(Some(contents)) => parse_paths(&contents),
            _ => Vec::new(),
        }
    }

    /// Every claim in the session, keyed by worker id. Records that vanish or
    /// fail to read mid-scan are skipped.
    pub fn list_all(&self) -> BTreeMap<u32, Vec<String>> {
        let keys = match self.records.keys() {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(
                    "Failed to list locks in session {}: {}",
                    self.namespace.name(),
                    e
                );
                return BTreeMap::new();
            }
        };

        keys.into_iter()
            .filter_map(|key| {
                let worker_id = parse_owner_key(&key)?;
                let contents = self.records.get(&key).ok()??;
                Some((worker_id, parse_paths(&contents)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SwarmStorage;
    use std::fs;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    fn create_test_store(worker_count: u32) -> (LockStore, SessionNamespace, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = SwarmStorage::new_with_base(temp_dir.path().to_path_buf()).unwrap();
        storage.register("test-session", temp_dir.path(), worker_count).unwrap();
        let ns = storage.namespace("test-session").unwrap();
        (LockStore::new(&ns), ns, temp_dir)
    }

    fn paths(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_conflict_then_release() {
        let (store, _ns, _temp_dir) = create_test_store(3);

        assert!(store.acquire(1, &paths(&["a.py"])).unwrap().is_granted());

        let second = store.acquire(2, &paths(&["a.py"])).unwrap();
        assert_eq!(
            second,
            LockAcquisition::Conflicted(vec![LockConflict {
                owner: "worker-1".to_string(),
                path: "a.py".to_string(),
            }])
        );
        assert!(store.held_by(2).is_empty());

        assert!(store.release(1).unwrap());
        assert!(store.acquire(2, &paths(&["a.py"])).unwrap().is_granted());
        assert_eq!(store.held_by(2), paths(&["a.py"]));
    }

    #[test]
    fn test_reacquire_replaces_previous_claim() {
        let (store, _ns, _temp_dir) = create_test_store(3);

        assert!(store.acquire(0, &paths(&["a.py", "b.py"])).unwrap().is_granted());
        assert!(store.acquire(0, &paths(&["c.py"])).unwrap().is_granted());
        assert_eq!(store.held_by(0), paths(&["c.py"]));

        assert!(store.acquire(1, &paths(&["a.py"])).unwrap().is_granted());
    }

    #[test]
    fn test_own_claim_never_conflicts() {
        let (store, _ns, _temp_dir) = create_test_store(2);

        assert!(store.acquire(0, &paths(&["a.py"])).unwrap().is_granted());
        assert!(store.acquire(0, &paths(&["a.py", "b.py"])).unwrap().is_granted());
        assert_eq!(store.held_by(0), paths(&["a.py", "b.py"]));
    }

    #[test]
    fn test_reports_every_conflict() {
        let (store, _ns, _temp_dir) = create_test_store(3);

        store.acquire(0, &paths(&["a.py", "b.py"])).unwrap();
        store.acquire(1, &paths(&["c.py"])).unwrap();

        let result = store.acquire(2, &paths(&["c.py", "d.py", "a.py"])).unwrap();
        assert!(!result.is_granted());
        let rendered: Vec<String> = result.conflicts().iter().map(|c| c.to_string()).collect();
        assert_eq!(
            rendered,
            vec!["a.py -> worker-0".to_string(), "c.py -> worker-1".to_string()]
        );
    }

    #[test]
    fn test_release_without_locks() {
        let (store, _ns, _temp_dir) = create_test_store(2);
        assert!(!store.release(0).unwrap());
        assert!(!store.release(99).unwrap());
    }

    #[test]
    fn test_acquire_rejects_out_of_range_worker() {
        let (store, _ns, _temp_dir) = create_test_store(2);
        assert!(matches!(
            store.acquire(5, &paths(&["a.py"])),
            Err(StorageError::WorkerOutOfRange { .. })
        ));
    }

    #[test]
    fn test_list_all_ignores_master_lock_and_strays() {
        let (store, ns, _temp_dir) = create_test_store(3);

        store.acquire(2, &paths(&["x.rs"])).unwrap();
        store.acquire(0, &paths(&["y.rs", "z.rs"])).unwrap();
        assert!(ns.master_lock_path().exists());
        fs::write(ns.locks_dir().join("manager.lock"), "w.rs").unwrap();

        let all = store.list_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[&0], paths(&["y.rs", "z.rs"]));
        assert_eq!(all[&2], paths(&["x.rs"]));
    }

    #[test]
    fn test_lock_record_is_newline_separated() {
        let (store, ns, _temp_dir) = create_test_store(2);

        store.acquire(1, &paths(&["src/a.rs", "src/b.rs"])).unwrap();
        assert_eq!(
            fs::read_to_string(ns.locks_dir().join("worker-1.lock")).unwrap(),
            "src/a.rs\nsrc/b.rs"
        );
    }

    #[test]
    fn test_whitespace_paths_compare_exactly() {
        let (store, _ns, _temp_dir) = create_test_store(2);

        assert!(store.acquire(0, &paths(&["my file.py "])).unwrap().is_granted());
        assert_eq!(store.held_by(0), paths(&["my file.py "]));

        let second = store.acquire(1, &paths(&["my file.py "])).unwrap();
        assert_eq!(
            second.conflicts(),
            &[LockConflict {
                owner: "worker-0".to_string(),
                path: "my file.py ".to_string(),
            }]
        );
        assert!(store.acquire(1, &paths(&["my file.py"])).unwrap().is_granted());
    }

    #[test]
    fn test_rejects_empty_and_multiline_paths() {
        let (store, _ns, _temp_dir) = create_test_store(2);

        for bad in ["", "a\nb", "a\r"] {
            assert!(matches!(
                store.acquire(0, &paths(&["ok.rs", bad])),
                Err(StorageError::InvalidPath(_))
            ));
        }
        assert!(store.list_all().is_empty());
        assert!(store.acquire(1, &paths(&["a"])).unwrap().is_granted());
    }

    #[test]
    fn test_take_returns_released_paths() {
        let (store, _ns, _temp_dir) = create_test_store(2);

        store.acquire(0, &paths(&["a.py", "b.py"])).unwrap();
        assert_eq!(store.take(0).unwrap(), paths(&["a.py", "b.py"]));
        assert!(store.take(0).unwrap().is_empty());
        assert!(store.list_all().is_empty());
        assert!(store.take(7).is_err());
    }

    #[test]
    fn test_concurrent_acquire_has_single_winner() {
        let (_store, ns, _temp_dir) = create_test_store(8);
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8u32)
            .map(|worker_id| {
                let ns = ns.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    LockStore::new(&ns)
                        .acquire(worker_id, &["shared.rs".to_string()])
                        .unwrap()
                        .is_granted()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|granted| *granted)
            .count();
        assert_eq!(winners, 1);

        let all = LockStore::new(&ns).list_all();
        assert_eq!(all.len(), 1);
    }
}
