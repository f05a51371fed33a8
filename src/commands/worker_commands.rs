use std::path::PathBuf;

use crate::coordination::{
    worker_done_trigger, LockAcquisition, LockStore, TriggerStore, WorkerState, WorkerStateStore,
    WorkerStateUpdate, WorkerStatus,
};

use super::{CommandContext, CommandError};

/// What a worker reports when it finishes a task
#[derive(Debug, Clone, Default)]
pub struct DoneReport {
    pub status: WorkerStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub branch: Option<String>,
    pub files_modified: Vec<String>,
}

impl DoneReport {
    pub fn complete(result: impl Into<String>) -> Self {
        Self {
            status: WorkerStatus::Complete,
            result: Some(result.into()),
            ..Self::default()
        }
    }

    fn into_update(self) -> WorkerStateUpdate {
        let mut update = WorkerStateUpdate::status(self.status);
        update.result = self.result;
        update.error = self.error;
        update.branch = self.branch;
        if !self.files_modified.is_empty() {
            update.files_modified = Some(self.files_modified);
        }
        update
    }
}

#[derive(Debug, Clone)]
pub struct DoneOutcome {
    pub state: WorkerState,
    pub result_path: PathBuf,
    /// Whether this completion closed the barrier
    pub all_done: bool,
}

/// Record a finished task and signal completion.
///
/// The report is merged into the worker's record so the assignment written by
/// `send` survives. The result file is written before `worker-{id}-done` is
/// fired, so a manager woken by the trigger always finds the result.
pub fn mark_done(
    ctx: &CommandContext,
    worker_id: u32,
    report: DoneReport,
) -> Result<DoneOutcome, CommandError> {
    let namespace = ctx.namespace()?;
    let states = WorkerStateStore::new(&namespace);

    let state = states.set(worker_id, false, report.into_update())?;
    let result_path = states.write_result(worker_id, &state, None)?;

    let triggers = TriggerStore::new(&namespace);
    triggers.create(&worker_done_trigger(worker_id))?;
    let all_done = triggers.check_all_workers_done()?;

    if all_done {
        tracing::info!("All workers in session {} are done", namespace.name());
    }

    Ok(DoneOutcome {
        state,
        result_path,
        all_done,
    })
}

/// Write a result without touching any trigger
pub fn report_result(
    ctx: &CommandContext,
    worker_id: u32,
    result: &str,
    status: WorkerStatus,
    task: Option<&str>,
) -> Result<PathBuf, CommandError> {
    let namespace = ctx.namespace()?;
    let states = WorkerStateStore::new(&namespace);

    let state = states.set(
        worker_id,
        false,
        WorkerStateUpdate::status(status).with_result(result),
    )?;
    Ok(states.write_result(worker_id, &state, task)?)
}

/// Claim `files` for a worker; fails with every conflicting claim listed
pub fn lock_files(
    ctx: &CommandContext,
    worker_id: u32,
    files: &[String],
) -> Result<(), CommandError> {
    let namespace = ctx.namespace()?;
    match LockStore::new(&namespace).acquire(worker_id, files)? {
        LockAcquisition::Granted => Ok(()),
        LockAcquisition::Conflicted(conflicts) => Err(CommandError::LockConflict(conflicts)),
    }
}

/// Release a worker's claim, returning the paths it held
pub fn unlock_files(ctx: &CommandContext, worker_id: u32) -> Result<Vec<String>, CommandError> {
    let namespace = ctx.namespace()?;
    Ok(LockStore::new(&namespace).take(worker_id)?)
}
