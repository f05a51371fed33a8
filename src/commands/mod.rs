mod coordination_commands;
mod session_commands;
mod worker_commands;

pub use coordination_commands::*;
pub use session_commands::*;
pub use worker_commands::*;

use std::path::PathBuf;

use thiserror::Error;

use crate::cli::{
    Cli, Command, PhaseCommand, ProtocolCommand, SessionCommand, TriggerCommand, WORKER_ID_ENV,
};
use crate::coordination::{LockConflict, LockStore, TriggerStore};
use crate::dispatch::{DeliveryError, RecordOnly, TmuxDelivery};
use crate::storage::{SessionNamespace, StorageError, SwarmStorage};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Worker ID required. Use --worker N or set {}", WORKER_ID_ENV)]
    MissingWorkerId,
    #[error("Files are locked by other workers:\n{}", format_conflicts(.0))]
    LockConflict(Vec<LockConflict>),
    #[error("Timed out after {secs}s waiting for trigger {trigger}")]
    TimedOut { trigger: String, secs: u64 },
    #[error("Trigger {0} is not set")]
    TriggerNotSet(String),
    #[error("Protocol not found: {0}")]
    ProtocolNotFound(String),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Task delivery failed: {0}")]
    Delivery(#[from] DeliveryError),
}

fn format_conflicts(conflicts: &[LockConflict]) -> String {
    conflicts
        .iter()
        .map(|c| format!("  {}", c))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Store handle plus the session this invocation operates on
pub struct CommandContext {
    pub storage: SwarmStorage,
    pub session: String,
}

impl CommandContext {
    /// Resolve the session once for the lifetime of the process
    pub fn resolve(storage: SwarmStorage, explicit: Option<&str>) -> Result<Self, CommandError> {
        let session = storage.resolve_session(explicit)?;
        tracing::debug!("Operating on session {}", session);
        Ok(Self { storage, session })
    }

    pub fn namespace(&self) -> Result<SessionNamespace, CommandError> {
        Ok(self.storage.namespace(&self.session)?)
    }

    /// tmux target for this session; unregistered sessions use the session
    /// name and the configured window
    fn tmux_delivery(&self) -> Result<TmuxDelivery, CommandError> {
        Ok(match self.storage.get_info(&self.session)? {
            Some(info) => TmuxDelivery::for_session(&info),
            None => TmuxDelivery::new(self.session.clone(), self.storage.config().tmux_window.clone()),
        })
    }
}

pub fn resolve_worker(id: Option<u32>) -> Result<u32, CommandError> {
    id.ok_or(CommandError::MissingWorkerId)
}

fn open_storage(home: Option<PathBuf>) -> Result<SwarmStorage, CommandError> {
    Ok(match home {
        Some(home) => SwarmStorage::new_with_base(home)?,
        None => SwarmStorage::new()?,
    })
}

/// Run one parsed command line against the store
pub async fn execute(cli: Cli) -> Result<(), CommandError> {
    let storage = open_storage(cli.home)?;

    match cli.command {
        Command::Session(command) => execute_session(&storage, command, cli.session.as_deref()),
        command => {
            let ctx = CommandContext::resolve(storage, cli.session.as_deref())?;
            execute_in_session(&ctx, command).await
        }
    }
}

async fn execute_in_session(ctx: &CommandContext, command: Command) -> Result<(), CommandError> {
    match command {
        Command::Session(command) => execute_session(&ctx.storage, command, Some(ctx.session.as_str()))?,

        Command::Send {
            worker,
            task,
            no_deliver,
        } => {
            if no_deliver {
                send_task(ctx, &RecordOnly, worker, &task).await?;
            } else {
                send_task(ctx, &ctx.tmux_delivery()?, worker, &task).await?;
            }
            println!("Sent task to worker {} in session {}", worker, ctx.session);
        }

        Command::Broadcast { task, no_deliver } => {
            let count = if no_deliver {
                broadcast_task(ctx, &RecordOnly, &task).await?
            } else {
                broadcast_task(ctx, &ctx.tmux_delivery()?, &task).await?
            };
            println!("Sent task to {} workers in session {}", count, ctx.session);
        }

        Command::Status => println!("{}", swarm_status(ctx)?),

        Command::WorkerResult { worker } => match worker_result(ctx, worker)? {
            Some(contents) => print!("{}", contents),
            None => println!("Worker {} has not reported a result", worker),
        },

        Command::Results => {
            println!("Worker results ({})", ctx.session);
            for (id, contents) in all_results(ctx)? {
                match contents {
                    Some(contents) => println!("Worker {}:\n{}", id, result_preview(&contents, 5)),
                    None => println!("Worker {}: no results yet", id),
                }
            }
        }

        Command::Wait { timeout } => {
            wait_all_done(ctx, timeout).await?;
            println!("All workers done");
        }

        Command::Reset { include_locks } => {
            reset_session(ctx, include_locks)?;
            println!("Reset session {}", ctx.session);
        }

        Command::Protocol(command) => execute_protocol(ctx, command)?,
        Command::Phase(command) => execute_phase(ctx, command)?,
        Command::Trigger(command) => execute_trigger(ctx, command).await?,

        Command::Done {
            worker,
            result,
            status,
            error,
            branch,
            files,
        } => {
            let worker_id = resolve_worker(worker.id)?;
            let outcome = mark_done(
                ctx,
                worker_id,
                DoneReport {
                    status,
                    result,
                    error,
                    branch,
                    files_modified: files,
                },
            )?;
            println!(
                "Worker {} marked {} (result: {})",
                worker_id,
                outcome.state.status,
                outcome.result_path.display()
            );
            if outcome.all_done {
                println!("All workers done");
            }
        }

        Command::Report {
            result,
            worker,
            status,
            task,
        } => {
            let worker_id = resolve_worker(worker.id)?;
            let path = report_result(ctx, worker_id, &result, status, task.as_deref())?;
            println!("Result written to {}", path.display());
        }

        Command::Lock { files, worker } => {
            let worker_id = resolve_worker(worker.id)?;
            lock_files(ctx, worker_id, &files)?;
            println!("Worker {} locked {} file(s)", worker_id, files.len());
        }

        Command::Unlock { worker } => {
            let worker_id = resolve_worker(worker.id)?;
            let released = unlock_files(ctx, worker_id)?;
            if released.is_empty() {
                println!("Worker {} held no locks", worker_id);
            } else {
                println!("Worker {} released: {}", worker_id, released.join(", "));
            }
        }

        Command::Locks => {
            let locks = LockStore::new(&ctx.namespace()?).list_all();
            if locks.is_empty() {
                println!("No active locks");
            }
            for (id, files) in locks {
                for file in files {
                    println!("{} -> worker-{}", file, id);
                }
            }
        }
    }

    Ok(())
}

fn execute_session(
    storage: &SwarmStorage,
    command: SessionCommand,
    explicit: Option<&str>,
) -> Result<(), CommandError> {
    match command {
        SessionCommand::Register {
            name,
            workspace,
            workers,
        } => {
            let info = register_session(storage, &name, workspace, workers)?;
            println!("Registered {}", format_session(&info, true));
        }
        SessionCommand::Unregister { name } => {
            if storage.unregister(&name)? {
                println!("Unregistered session {}", name);
            } else {
                println!("Session {} was not registered", name);
            }
        }
        SessionCommand::List => {
            let active = storage.get_active();
            let sessions = storage.list()?;
            if sessions.is_empty() {
                println!("No sessions registered");
            }
            for info in sessions {
                let is_active = active.as_deref() == Some(info.name.as_str());
                println!("{}", format_session(&info, is_active));
            }
        }
        SessionCommand::Info { name } => {
            let name = match name {
                Some(name) => name,
                None => storage.resolve_session(explicit)?,
            };
            let info = session_info(storage, &name)?;
            let is_active = storage.get_active().as_deref() == Some(name.as_str());
            println!("{}", format_session(&info, is_active));
        }
        SessionCommand::Activate { name } => {
            activate_session(storage, &name)?;
            println!("Active session: {}", name);
        }
        SessionCommand::Active => match storage.get_active() {
            Some(name) => println!("{}", name),
            None => println!("No active session"),
        },
    }
    Ok(())
}

fn execute_protocol(ctx: &CommandContext, command: ProtocolCommand) -> Result<(), CommandError> {
    match command {
        ProtocolCommand::List => {
            let active = ctx.namespace()?.protocol();
            let protocols = ctx.storage.list_protocols()?;
            if protocols.is_empty() {
                println!(
                    "No protocols installed in {}",
                    ctx.storage.protocols_dir().display()
                );
            }
            for name in protocols {
                let marker = if active.as_deref() == Some(name.as_str()) { " (active)" } else { "" };
                println!("{}{}", name, marker);
            }
        }
        ProtocolCommand::Set { name } => {
            set_protocol(ctx, &name)?;
            println!("Protocol set to {}", name);
        }
        ProtocolCommand::Show => match ctx.namespace()?.protocol() {
            Some(name) => {
                println!("{}", name);
                if let Some(body) = ctx.storage.read_protocol(&name)? {
                    println!("\n{}", body.trim_end());
                }
            }
            None => println!("No protocol set"),
        },
    }
    Ok(())
}

fn execute_phase(ctx: &CommandContext, command: PhaseCommand) -> Result<(), CommandError> {
    let namespace = ctx.namespace()?;
    match command {
        PhaseCommand::Set { phase } => {
            namespace.set_phase(&phase)?;
            println!("Phase set to {}", phase);
        }
        PhaseCommand::Show => println!("{}", namespace.phase().as_deref().unwrap_or("(none)")),
    }
    Ok(())
}

async fn execute_trigger(ctx: &CommandContext, command: TriggerCommand) -> Result<(), CommandError> {
    let namespace = ctx.namespace()?;
    let triggers = TriggerStore::new(&namespace);

    match command {
        TriggerCommand::Fire { name } => {
            triggers.create(&name)?;
            println!("Fired {}", name);
        }
        TriggerCommand::Clear { name } => {
            triggers.clear(&name)?;
            println!("Cleared {}", name);
        }
        TriggerCommand::ClearAll => {
            let count = triggers.clear_all()?;
            println!("Cleared {} trigger(s)", count);
        }
        TriggerCommand::Check { name } => {
            if !triggers.exists(&name) {
                return Err(CommandError::TriggerNotSet(name));
            }
            println!("{} is set", name);
        }
        TriggerCommand::Await { name, timeout } => {
            await_trigger(ctx, &name, timeout).await?;
            println!("{} is set", name);
        }
        TriggerCommand::List => {
            for name in triggers.list() {
                println!("{}", name);
            }
        }
    }
    Ok(())
}
