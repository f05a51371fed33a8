use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::coordination::WorkerStatus;

/// Environment variable carrying a worker's id inside its pane
pub const WORKER_ID_ENV: &str = "HIVE_SWARM_WORKER_ID";

/// hive-swarm - coordinate a manager and N workers through a shared store.
///
/// Every invocation is a short-lived process: it resolves the session, runs
/// one store operation, and exits.
#[derive(Debug, Parser)]
#[command(name = "hive-swarm", version)]
pub struct Cli {
    /// Session to operate on (defaults to the active session)
    #[arg(long, short = 's', global = true, env = "HIVE_SWARM_SESSION")]
    pub session: Option<String>,

    /// Store root (defaults to ~/.config/hive-swarm)
    #[arg(long, global = true, env = "HIVE_SWARM_HOME")]
    pub home: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct WorkerArg {
    /// Worker ID (auto-detected from HIVE_SWARM_WORKER_ID)
    #[arg(long = "worker", short = 'w', env = WORKER_ID_ENV)]
    pub id: Option<u32>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Register, inspect, and remove sessions
    #[command(subcommand)]
    Session(SessionCommand),

    /// Send a task to one worker
    Send {
        worker: u32,
        task: String,
        /// Record the assignment without typing it into the worker pane
        #[arg(long)]
        no_deliver: bool,
    },

    /// Send the same task to every worker
    Broadcast {
        task: String,
        #[arg(long)]
        no_deliver: bool,
    },

    /// Show worker states, triggers, and locks
    Status,

    /// Print the result file a worker wrote
    #[command(name = "result")]
    WorkerResult { worker: u32 },

    /// Show the latest result of every worker
    Results,

    /// Wait until every worker has reported done
    Wait {
        /// Max seconds to wait (defaults to the configured timeout)
        #[arg(long, short = 't')]
        timeout: Option<u64>,
    },

    /// Clear worker states, triggers, protocol, and phase
    Reset {
        /// Release every file lock as well
        #[arg(long)]
        include_locks: bool,
    },

    /// Select the protocol the swarm follows
    #[command(subcommand)]
    Protocol(ProtocolCommand),

    /// Track the current phase of the protocol
    #[command(subcommand)]
    Phase(PhaseCommand),

    /// Fire, clear, and wait on triggers
    #[command(subcommand)]
    Trigger(TriggerCommand),

    /// Report the current task finished and signal completion
    Done {
        #[command(flatten)]
        worker: WorkerArg,
        /// Result summary
        #[arg(long, short = 'r')]
        result: Option<String>,
        #[arg(long, value_enum, default_value_t = WorkerStatus::Complete)]
        status: WorkerStatus,
        /// Error message when the task failed
        #[arg(long)]
        error: Option<String>,
        /// Branch holding the worker's changes
        #[arg(long)]
        branch: Option<String>,
        /// Files modified by the task
        #[arg(long, num_args = 1..)]
        files: Vec<String>,
    },

    /// Write a result without signalling completion
    Report {
        result: String,
        #[command(flatten)]
        worker: WorkerArg,
        #[arg(long, value_enum, default_value_t = WorkerStatus::Complete)]
        status: WorkerStatus,
        /// Task description for the result file
        #[arg(long, short = 't')]
        task: Option<String>,
    },

    /// Claim files before editing them
    Lock {
        #[arg(required = true)]
        files: Vec<String>,
        #[command(flatten)]
        worker: WorkerArg,
    },

    /// Release every file this worker has claimed
    Unlock {
        #[command(flatten)]
        worker: WorkerArg,
    },

    /// Show all active file locks
    Locks,
}

#[derive(Debug, Subcommand)]
pub enum SessionCommand {
    /// Register a session and make it active
    Register {
        name: String,
        /// Workspace directory (default: current)
        #[arg(long, short = 'd')]
        workspace: Option<PathBuf>,
        /// Number of workers (default: from config)
        #[arg(long, short = 'w')]
        workers: Option<u32>,
    },
    /// Remove a session and all of its state
    Unregister { name: String },
    /// List registered sessions
    List,
    /// Show one session (default: the resolved session)
    Info { name: Option<String> },
    /// Make a session the default for later commands
    Activate { name: String },
    /// Print the active session
    Active,
}

#[derive(Debug, Subcommand)]
pub enum ProtocolCommand {
    /// List installed protocols
    List,
    /// Activate a protocol for the session
    Set { name: String },
    /// Print the active protocol
    Show,
}

#[derive(Debug, Subcommand)]
pub enum PhaseCommand {
    Set { phase: String },
    Show,
}

#[derive(Debug, Subcommand)]
pub enum TriggerCommand {
    /// Fire a trigger
    Fire { name: String },
    /// Clear a trigger
    Clear { name: String },
    /// Clear every trigger in the session
    ClearAll,
    /// Exit successfully iff the trigger is set
    Check { name: String },
    /// Block until the trigger is set
    Await {
        name: String,
        #[arg(long, short = 't')]
        timeout: Option<u64>,
    },
    /// List triggers that are set
    List,
}
