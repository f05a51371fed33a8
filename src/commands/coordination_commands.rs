use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::coordination::{
    reset_swarm_state, worker_done_trigger, LockStore, TriggerStore, WorkerState,
    WorkerStateStore, WorkerStateUpdate, WorkerStatus, ALL_DONE_TRIGGER,
};
use crate::dispatch::TaskDelivery;
use crate::storage::SessionInfo;
use crate::templates::worker_preamble;

use super::{CommandContext, CommandError};

/// Snapshot of a session for `status`
#[derive(Debug, Clone, Serialize)]
pub struct SwarmStatus {
    pub session: String,
    pub info: Option<SessionInfo>,
    pub protocol: Option<String>,
    pub phase: Option<String>,
    pub workers: BTreeMap<u32, WorkerState>,
    pub triggers: Vec<String>,
    pub locks: BTreeMap<u32, Vec<String>>,
}

impl fmt::Display for SwarmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.info {
            Some(ref info) => writeln!(
                f,
                "Session: {} ({} workers, {})",
                self.session,
                info.worker_count,
                info.workspace.display()
            )?,
            None => writeln!(f, "Session: {} (not registered)", self.session)?,
        }
        writeln!(f, "Protocol: {}", self.protocol.as_deref().unwrap_or("(none)"))?;
        writeln!(f, "Phase: {}", self.phase.as_deref().unwrap_or("(none)"))?;

        let finished = self.workers.values().filter(|s| s.status.is_terminal()).count();
        writeln!(f, "Workers ({}/{} finished):", finished, self.workers.len())?;
        for (id, state) in &self.workers {
            write!(f, "  {}: {}", id, state.status)?;
            if let Some(ref assignment) = state.assignment {
                write!(f, " - {}", first_line(assignment))?;
            }
            writeln!(f)?;
        }

        if self.triggers.is_empty() {
            writeln!(f, "Triggers: (none)")?;
        } else {
            writeln!(f, "Triggers: {}", self.triggers.join(", "))?;
        }

        if self.locks.is_empty() {
            write!(f, "Locks: (none)")
        } else {
            write!(f, "Locks:")?;
            for (id, files) in &self.locks {
                write!(f, "\n  worker-{}: {}", id, files.join(", "))?;
            }
            Ok(())
        }
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

/// Assign a task to a worker and deliver it.
///
/// The worker's record is reset so nothing from its previous task survives,
/// and its completion trigger plus the barrier are cleared so a stale round
/// cannot satisfy the next `wait`.
pub async fn send_task<D: TaskDelivery>(
    ctx: &CommandContext,
    delivery: &D,
    worker_id: u32,
    task: &str,
) -> Result<WorkerState, CommandError> {
    ctx.storage.validate_message(task)?;
    let namespace = ctx.namespace()?;
    namespace.check_worker(worker_id)?;

    let triggers = TriggerStore::new(&namespace);
    triggers.clear(&worker_done_trigger(worker_id))?;
    triggers.clear(ALL_DONE_TRIGGER)?;

    let state = WorkerStateStore::new(&namespace).set(
        worker_id,
        true,
        WorkerStateUpdate::status(WorkerStatus::Working).with_assignment(task),
    )?;

    delivery
        .deliver(worker_id, &worker_preamble(worker_id, task))
        .await?;

    Ok(state)
}

/// Send the same task to every worker. Returns the number of workers reached.
pub async fn broadcast_task<D: TaskDelivery>(
    ctx: &CommandContext,
    delivery: &D,
    task: &str,
) -> Result<u32, CommandError> {
    ctx.storage.validate_message(task)?;
    let namespace = ctx.namespace()?;

    for worker_id in namespace.worker_ids() {
        send_task(ctx, delivery, worker_id, task).await?;
    }
    Ok(namespace.worker_count())
}

pub fn swarm_status(ctx: &CommandContext) -> Result<SwarmStatus, CommandError> {
    let namespace = ctx.namespace()?;

    Ok(SwarmStatus {
        session: ctx.session.clone(),
        info: ctx.storage.get_info(&ctx.session)?,
        protocol: namespace.protocol(),
        phase: namespace.phase(),
        workers: WorkerStateStore::new(&namespace).get_all(),
        triggers: TriggerStore::new(&namespace).list(),
        locks: LockStore::new(&namespace).list_all(),
    })
}

fn timeout_or_default(ctx: &CommandContext, timeout_secs: Option<u64>) -> u64 {
    timeout_secs.unwrap_or(ctx.storage.config().await_timeout_secs)
}

/// Block until `name` is set or the timeout passes
pub async fn await_trigger(
    ctx: &CommandContext,
    name: &str,
    timeout_secs: Option<u64>,
) -> Result<(), CommandError> {
    let secs = timeout_or_default(ctx, timeout_secs);
    let namespace = ctx.namespace()?;

    if TriggerStore::new(&namespace)
        .wait_for(name, Duration::from_secs(secs))
        .await
    {
        Ok(())
    } else {
        Err(CommandError::TimedOut {
            trigger: name.to_string(),
            secs,
        })
    }
}

/// Wait for the all-done barrier. The barrier is recomputed first so a
/// session whose workers all finished before anyone checked is not missed.
pub async fn wait_all_done(
    ctx: &CommandContext,
    timeout_secs: Option<u64>,
) -> Result<(), CommandError> {
    let namespace = ctx.namespace()?;
    if TriggerStore::new(&namespace).check_all_workers_done()? {
        return Ok(());
    }
    await_trigger(ctx, ALL_DONE_TRIGGER, timeout_secs).await
}

/// Contents of a worker's result file, if it has written one
pub fn worker_result(ctx: &CommandContext, worker_id: u32) -> Result<Option<String>, CommandError> {
    let namespace = ctx.namespace()?;
    namespace.check_worker(worker_id)?;
    Ok(WorkerStateStore::new(&namespace).read_result(worker_id))
}

/// Result file of every worker in the session, `None` where nothing was written yet
pub fn all_results(ctx: &CommandContext) -> Result<BTreeMap<u32, Option<String>>, CommandError> {
    let namespace = ctx.namespace()?;
    let states = WorkerStateStore::new(&namespace);
    Ok(namespace
        .worker_ids()
        .map(|id| (id, states.read_result(id)))
        .collect())
}

/// First lines of a result file for the `results` overview
pub fn result_preview(contents: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = contents.trim().lines().collect();
    let mut preview = lines
        .iter()
        .take(max_lines)
        .map(|line| format!("    {}", line))
        .collect::<Vec<_>>()
        .join("\n");
    if lines.len() > max_lines {
        preview.push_str("\n    ... (truncated)");
    }
    preview
}

pub fn reset_session(ctx: &CommandContext, include_locks: bool) -> Result<(), CommandError> {
    let namespace = ctx.namespace()?;
    reset_swarm_state(&namespace, include_locks)?;
    Ok(())
}

pub fn set_protocol(ctx: &CommandContext, name: &str) -> Result<(), CommandError> {
    let namespace = ctx.namespace()?;
    if !ctx.storage.activate_protocol(&namespace, name)? {
        return Err(CommandError::ProtocolNotFound(name.to_string()));
    }
    Ok(())
}
