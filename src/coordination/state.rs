use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::storage::{DirStore, SessionNamespace, StorageError};

use super::{WorkerState, WorkerStateUpdate};

/// Per-worker status records and their plain-text result files
pub struct WorkerStateStore {
    namespace: SessionNamespace,
    records: DirStore,
    results: DirStore,
}

fn result_key(worker_id: u32) -> String {
    format!("worker-{}", worker_id)
}

impl WorkerStateStore {
    pub fn new(namespace: &SessionNamespace) -> Self {
        Self {
            records: DirStore::new(namespace.workers_dir(), Some("json")),
            results: DirStore::new(namespace.results_dir(), Some("txt")),
            namespace: namespace.clone(),
        }
    }

    /// Read a worker's state. Missing, unreadable, or half-written records
    /// all read as `{status: ready}`.
    pub fn get(&self, worker_id: u32) -> WorkerState {
        let json = match self.records.get(&worker_id.to_string()) {
            Ok(Some(json)) => json,
            Ok(None) => return WorkerState::default(),
            Err(e) => {
                tracing::warn!(
                    "Failed to read state of worker {} in session {}: {}",
                    worker_id,
                    self.namespace.name(),
                    e
                );
                return WorkerState::default();
            }
        };

        match serde_json::from_str(&json) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(
                    "Ignoring corrupt state of worker {} in session {}: {}",
                    worker_id,
                    self.namespace.name(),
                    e
                );
                WorkerState::default()
            }
        }
    }

    /// Write a worker's state.
    ///
    /// With `reset` the record starts over from `{status: ready}` before
    /// `update` is applied, dropping whatever the previous task left behind.
    /// Without it `update` is merged onto the current record.
    pub fn set(
        &self,
        worker_id: u32,
        reset: bool,
        update: WorkerStateUpdate,
    ) -> Result<WorkerState, StorageError> {
        self.namespace.check_worker(worker_id)?;
        self.namespace.ensure()?;

        let mut state = if reset {
            WorkerState::default()
        } else {
            self.get(worker_id)
        };
        state.apply(update);

        let json = serde_json::to_string_pretty(&state)?;
        self.records.put(&worker_id.to_string(), &json)?;

        tracing::info!(
            "Worker {} in session {} is now {}{}",
            worker_id,
            self.namespace.name(),
            state.status,
            if reset { " (reset)" } else { "" }
        );
        Ok(state)
    }

    /// States of workers `0..worker_count`
    pub fn get_all(&self) -> BTreeMap<u32, WorkerState> {
        self.namespace
            .worker_ids()
            .map(|id| (id, self.get(id)))
            .collect()
    }

    /// Delete every worker record. Records removed concurrently by another
    /// process are not an error.
    pub fn clear_all(&self) -> Result<usize, StorageError> {
        self.records.clear()
    }

    /// Write `results/worker-{id}.txt`, the plain-text copy of a finished state
    pub fn write_result(
        &self,
        worker_id: u32,
        state: &WorkerState,
        task: Option<&str>,
    ) -> Result<PathBuf, StorageError> {
        self.namespace.check_worker(worker_id)?;
        self.namespace.ensure()?;

        let key = result_key(worker_id);
        self.results.put(&key, &format_result(state, task))?;
        self.results.path_for(&key)
    }

    pub fn read_result(&self, worker_id: u32) -> Option<String> {
        self.results.get(&result_key(worker_id)).ok().flatten()
    }
}

fn format_result(state: &WorkerState, task: Option<&str>) -> String {
    let task = task
        .or(state.assignment.as_deref())
        .unwrap_or("Not specified");

    let mut content = format!(
        "STATUS: {}\nTASK: {}\n",
        state.status.as_str().to_uppercase(),
        task
    );

    if let Some(ref branch) = state.branch {
        content.push_str(&format!("BRANCH: {}\n", branch));
    }

    content.push_str("RESULT:\n");
    content.push_str(state.result.as_deref().unwrap_or("(no result reported)"));
    content.push('\n');

    if let Some(ref error) = state.error {
        content.push_str("ERROR:\n");
        content.push_str(error);
        content.push('\n');
    }

    content.push_str("FILES_MODIFIED:\n");
    if state.files_modified.is_empty() {
        content.push_str("(none reported)\n");
    } else {
        for file in &state.files_modified {
            content.push_str(file);
            content.push('\n');
        }
    }

    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::WorkerStatus;
    use crate::storage::SwarmStorage;
    use std::fs;
    use tempfile::TempDir;

    fn create_test_store(worker_count: u32) -> (WorkerStateStore, SessionNamespace, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = SwarmStorage::new_with_base(temp_dir.path().to_path_buf()).unwrap();
        storage.register("test-session", temp_dir.path(), worker_count).unwrap();
        let ns = storage.namespace("test-session").unwrap();
        (WorkerStateStore::new(&ns), ns, temp_dir)
    }

    #[test]
    fn test_get_missing_is_ready() {
        let (store, _ns, _temp_dir) = create_test_store(2);
        assert_eq!(store.get(0), WorkerState::default());
        assert_eq!(store.get(0).status, WorkerStatus::Ready);
    }

    #[test]
    fn test_reset_set_returns_exactly_the_given_status() {
        let (store, _ns, _temp_dir) = create_test_store(3);

        store
            .set(
                1,
                true,
                WorkerStateUpdate::status(WorkerStatus::Error)
                    .with_assignment("old task")
                    .with_result("old result")
                    .with_error("boom")
                    .with_branch("feature/x")
                    .with_files_modified(vec!["a.py".to_string()]),
            )
            .unwrap();

        for status in [
            WorkerStatus::Ready,
            WorkerStatus::Working,
            WorkerStatus::Complete,
            WorkerStatus::Error,
        ] {
            store.set(1, true, WorkerStateUpdate::status(status)).unwrap();
            assert_eq!(
                store.get(1),
                WorkerState {
                    status,
                    ..WorkerState::default()
                }
            );
        }
    }

    #[test]
    fn test_merge_preserves_existing_fields() {
        let (store, _ns, _temp_dir) = create_test_store(3);

        store
            .set(
                2,
                true,
                WorkerStateUpdate::status(WorkerStatus::Working).with_assignment("a"),
            )
            .unwrap();
        let merged = store
            .set(2, false, WorkerStateUpdate::default().with_result("r"))
            .unwrap();

        let expected = WorkerState {
            status: WorkerStatus::Working,
            assignment: Some("a".to_string()),
            result: Some("r".to_string()),
            ..WorkerState::default()
        };
        assert_eq!(merged, expected);
        assert_eq!(store.get(2), expected);
    }

    #[test]
    fn test_corrupt_record_reads_as_ready_and_merge_recovers() {
        let (store, ns, _temp_dir) = create_test_store(2);
        ns.ensure().unwrap();
        fs::write(ns.workers_dir().join("0.json"), "{\"status\": \"work").unwrap();

        assert_eq!(store.get(0), WorkerState::default());

        let state = store
            .set(0, false, WorkerStateUpdate::default().with_result("r"))
            .unwrap();
        assert_eq!(state.status, WorkerStatus::Ready);
        assert_eq!(state.result.as_deref(), Some("r"));
    }

    #[test]
    fn test_set_rejects_out_of_range_worker() {
        let (store, ns, _temp_dir) = create_test_store(2);

        let result = store.set(2, true, WorkerStateUpdate::status(WorkerStatus::Working));
        assert!(matches!(
            result,
            Err(StorageError::WorkerOutOfRange { worker_id: 2, worker_count: 2 })
        ));
        assert!(!ns.workers_dir().join("2.json").exists());
    }

    #[test]
    fn test_set_recreates_missing_namespace() {
        let (store, ns, _temp_dir) = create_test_store(2);
        fs::remove_dir_all(ns.root()).unwrap();

        store
            .set(0, true, WorkerStateUpdate::status(WorkerStatus::Working))
            .unwrap();
        assert!(ns.workers_dir().join("0.json").is_file());
        assert!(ns.triggers_dir().is_dir());
    }

    #[test]
    fn test_get_all_and_clear_all() {
        let (store, _ns, _temp_dir) = create_test_store(3);

        store.set(0, true, WorkerStateUpdate::status(WorkerStatus::Working)).unwrap();
        store.set(2, true, WorkerStateUpdate::status(WorkerStatus::Complete)).unwrap();

        let all = store.get_all();
        assert_eq!(all.len(), 3);
        assert_eq!(all[&0].status, WorkerStatus::Working);
        assert_eq!(all[&1].status, WorkerStatus::Ready);
        assert_eq!(all[&2].status, WorkerStatus::Complete);

        assert_eq!(store.clear_all().unwrap(), 2);
        assert_eq!(store.clear_all().unwrap(), 0);
        assert!(store.get_all().values().all(|s| s.status == WorkerStatus::Ready));
    }

    #[test]
    fn test_write_result_file() {
        let (store, ns, _temp_dir) = create_test_store(2);

        let state = store
            .set(
                1,
                true,
                WorkerStateUpdate::status(WorkerStatus::Complete)
                    .with_assignment("Count TODOs")
                    .with_result("Found 5 TODO comments")
                    .with_files_modified(vec!["src/a.rs".to_string(), "src/b.rs".to_string()]),
            )
            .unwrap();

        let path = store.write_result(1, &state, None).unwrap();
        assert_eq!(path, ns.results_dir().join("worker-1.txt"));

        let content = store.read_result(1).unwrap();
        assert_eq!(
            content,
            "STATUS: COMPLETE\nTASK: Count TODOs\nRESULT:\nFound 5 TODO comments\n\
             FILES_MODIFIED:\nsrc/a.rs\nsrc/b.rs\n"
        );
        assert_eq!(store.read_result(0), None);
    }

    #[test]
    fn test_format_result_with_error_and_no_files() {
        let state = WorkerState {
            status: WorkerStatus::Error,
            error: Some("tests failed".to_string()),
            branch: Some("worker-0".to_string()),
            ..WorkerState::default()
        };

        let content = format_result(&state, Some("Run tests"));
        assert_eq!(
            content,
            "STATUS: ERROR\nTASK: Run tests\nBRANCH: worker-0\nRESULT:\n(no result reported)\n\
             ERROR:\ntests failed\nFILES_MODIFIED:\n(none reported)\n"
        );
    }
}
