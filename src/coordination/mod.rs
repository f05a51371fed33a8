mod locks;
mod state;
mod triggers;

pub use locks::*;
pub use state::*;
pub use triggers::*;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::storage::{SessionNamespace, StorageError};

/// Lifecycle status of a worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    #[default]
    Ready,
    Working,
    Complete,
    Error,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Ready => "ready",
            WorkerStatus::Working => "working",
            WorkerStatus::Complete => "complete",
            WorkerStatus::Error => "error",
        }
    }

    /// Whether the worker has finished its current assignment
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerStatus::Complete | WorkerStatus::Error)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields that have their own slot in [`WorkerState`] and cannot be used as metadata keys
const RESERVED_FIELDS: &[&str] = &[
    "status",
    "assignment",
    "result",
    "error",
    "branch",
    "files_modified",
];

/// Persisted status record for one worker (`state/workers/{id}.json`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    pub status: WorkerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_modified: Vec<String>,
    /// Any other keys a caller attached to the record
    #[serde(flatten)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl WorkerState {
    /// Overwrite the fields present in `update`, leaving the rest untouched
    pub fn apply(&mut self, update: WorkerStateUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(assignment) = update.assignment {
            self.assignment = Some(assignment);
        }
        if let Some(result) = update.result {
            self.result = Some(result);
        }
        if let Some(error) = update.error {
            self.error = Some(error);
        }
        if let Some(branch) = update.branch {
            self.branch = Some(branch);
        }
        if let Some(files) = update.files_modified {
            self.files_modified = files;
        }
        for (key, value) in update.metadata {
            if RESERVED_FIELDS.contains(&key.as_str()) {
                tracing::warn!("Ignoring metadata key '{}' that shadows a state field", key);
                continue;
            }
            self.metadata.insert(key, value);
        }
    }
}

/// Set of fields to write onto a [`WorkerState`]; `None` means "leave as is"
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerStateUpdate {
    pub status: Option<WorkerStatus>,
    pub assignment: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub branch: Option<String>,
    pub files_modified: Option<Vec<String>>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl WorkerStateUpdate {
    pub fn status(status: WorkerStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_assignment(mut self, assignment: impl Into<String>) -> Self {
        self.assignment = Some(assignment.into());
        self
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_files_modified(mut self, files: Vec<String>) -> Self {
        self.files_modified = Some(files);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Reset a session for a new round: worker states, triggers, protocol and phase.
/// File locks are left alone unless `include_locks` is set.
pub fn reset_swarm_state(
    namespace: &SessionNamespace,
    include_locks: bool,
) -> Result<(), StorageError> {
    let states = WorkerStateStore::new(namespace).clear_all()?;
    let triggers = TriggerStore::new(namespace).clear_all()?;
    namespace.clear_protocol_and_phase()?;

    let locks = if include_locks {
        LockStore::new(namespace).release_all()?
    } else {
        0
    };

    tracing::info!(
        "Reset session {}: cleared {} worker states, {} triggers, {} locks",
        namespace.name(),
        states,
        triggers,
        locks
    );
    Ok(())
}
