use std::time::Duration;

use tokio::time::Instant;

use crate::storage::{DirStore, SessionNamespace, StorageError};

/// Barrier trigger fired once every worker has signalled completion
pub const ALL_DONE_TRIGGER: &str = "all-done";

/// How often [`TriggerStore::wait_for`] checks for the marker
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Name of the trigger a worker fires when its task is finished
pub fn worker_done_trigger(worker_id: u32) -> String {
    format!("worker-{}-done", worker_id)
}

/// One-shot event markers. A trigger has fired iff its file exists.
pub struct TriggerStore {
    namespace: SessionNamespace,
    markers: DirStore,
}

impl TriggerStore {
    pub fn new(namespace: &SessionNamespace) -> Self {
        Self {
            markers: DirStore::new(namespace.triggers_dir(), None),
            namespace: namespace.clone(),
        }
    }

    /// Fire a trigger. Firing one that already exists is a no-op.
    pub fn create(&self, name: &str) -> Result<(), StorageError> {
        DirStore::validate_key(name)?;
        self.namespace.ensure()?;
        self.markers.touch(name)?;
        tracing::info!("Trigger {} fired in session {}", name, self.namespace.name());
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.markers.contains(name)
    }

    /// Remove a trigger. Returns false if it was not set.
    pub fn clear(&self, name: &str) -> Result<bool, StorageError> {
        let removed = self.markers.delete(name)?;
        if removed {
            tracing::debug!("Trigger {} cleared in session {}", name, self.namespace.name());
        }
        Ok(removed)
    }

    pub fn clear_all(&self) -> Result<usize, StorageError> {
        self.markers.clear()
    }

    /// Names of the triggers currently set
    pub fn list(&self) -> Vec<String> {
        self.markers.keys().unwrap_or_else(|e| {
            tracing::warn!(
                "Failed to list triggers in session {}: {}",
                self.namespace.name(),
                e
            );
            Vec::new()
        })
    }

    /// Poll until the trigger exists or `timeout` has passed since the call.
    /// Returns false on timeout and leaves the trigger untouched either way.
    pub async fn wait_for(&self, name: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.exists(name) {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!("Timed out after {:?} waiting for trigger {}", timeout, name);
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Recompute the barrier: true iff `worker-{i}-done` exists for every worker,
    /// in which case `all-done` is fired as well.
    pub fn check_all_workers_done(&self) -> Result<bool, StorageError> {
        let all_done = self
            .namespace
            .worker_ids()
            .all(|id| self.exists(&worker_done_trigger(id)));

        if all_done {
            self.create(ALL_DONE_TRIGGER)?;
        }
        Ok(all_done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SwarmStorage;
    use std::fs;
    use tempfile::TempDir;

    fn create_test_store(worker_count: u32) -> (TriggerStore, SessionNamespace, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = SwarmStorage::new_with_base(temp_dir.path().to_path_buf()).unwrap();
        storage.register("test-session", temp_dir.path(), worker_count).unwrap();
        let ns = storage.namespace("test-session").unwrap();
        (TriggerStore::new(&ns), ns, temp_dir)
    }

    #[test]
    fn test_create_and_clear_are_idempotent() {
        let (store, ns, _temp_dir) = create_test_store(2);

        store.create("x").unwrap();
        store.create("x").unwrap();
        assert!(store.exists("x"));
        assert_eq!(fs::metadata(ns.triggers_dir().join("x")).unwrap().len(), 0);

        assert!(store.clear("x").unwrap());
        assert!(!store.clear("x").unwrap());
        assert!(!store.exists("x"));
    }

    #[test]
    fn test_invalid_trigger_name() {
        let (store, _ns, _temp_dir) = create_test_store(2);

        assert!(matches!(
            store.create("../escape"),
            Err(StorageError::InvalidKey(_))
        ));
        assert!(!store.exists("../escape"));
    }

    #[test]
    fn test_create_recreates_namespace() {
        let (store, ns, _temp_dir) = create_test_store(2);
        fs::remove_dir_all(ns.root()).unwrap();

        store.create(&worker_done_trigger(1)).unwrap();
        assert!(ns.triggers_dir().join("worker-1-done").is_file());
    }

    #[test]
    fn test_barrier_fires_only_when_every_worker_is_done() {
        let (store, _ns, _temp_dir) = create_test_store(3);

        store.create(&worker_done_trigger(0)).unwrap();
        store.create(&worker_done_trigger(1)).unwrap();
        assert!(!store.check_all_workers_done().unwrap());
        assert!(!store.exists(ALL_DONE_TRIGGER));

        store.create(&worker_done_trigger(2)).unwrap();
        assert!(store.check_all_workers_done().unwrap());
        assert!(store.exists(ALL_DONE_TRIGGER));

        // recomputed, not latched
        assert!(store.check_all_workers_done().unwrap());
    }

    #[test]
    fn test_clear_all_and_list() {
        let (store, _ns, _temp_dir) = create_test_store(2);

        store.create(&worker_done_trigger(0)).unwrap();
        store.create(ALL_DONE_TRIGGER).unwrap();
        assert_eq!(
            store.list(),
            vec!["all-done".to_string(), "worker-0-done".to_string()]
        );

        assert_eq!(store.clear_all().unwrap(), 2);
        assert!(store.list().is_empty());
        assert!(!store.check_all_workers_done().unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let (store, _ns, _temp_dir) = create_test_store(2);

        let start = std::time::Instant::now();
        let found = store.wait_for(ALL_DONE_TRIGGER, Duration::from_secs(1)).await;
        let elapsed = start.elapsed();

        assert!(!found);
        assert!(elapsed >= Duration::from_secs(1), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "{:?}", elapsed);
    }

    #[tokio::test]
    async fn test_wait_for_sees_trigger_fired_later() {
        let (store, ns, _temp_dir) = create_test_store(2);

        let writer_ns = ns.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            TriggerStore::new(&writer_ns).create("go").unwrap();
        });

        assert!(store.wait_for("go", Duration::from_secs(5)).await);
        writer.await.unwrap();

        // waiting does not consume the trigger
        assert!(store.exists("go"));
        assert!(store.wait_for("go", Duration::from_millis(10)).await);
    }
}
