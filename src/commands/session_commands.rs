use std::path::PathBuf;

use crate::storage::{SessionInfo, SwarmStorage};

use super::CommandError;

/// Register a session, defaulting the workspace to the current directory and
/// the worker count to the configured default
pub fn register_session(
    storage: &SwarmStorage,
    name: &str,
    workspace: Option<PathBuf>,
    workers: Option<u32>,
) -> Result<SessionInfo, CommandError> {
    let workspace = match workspace {
        Some(path) => path,
        None => std::env::current_dir().map_err(crate::storage::StorageError::from)?,
    };
    let workers = workers.unwrap_or(storage.config().default_workers);

    Ok(storage.register(name, &workspace, workers)?)
}

/// Metadata of a registered session
pub fn session_info(storage: &SwarmStorage, name: &str) -> Result<SessionInfo, CommandError> {
    storage
        .get_info(name)?
        .ok_or_else(|| CommandError::SessionNotFound(name.to_string()))
}

/// Make `name` the active session. Unlike the raw pointer update this
/// refuses sessions that were never registered.
pub fn activate_session(storage: &SwarmStorage, name: &str) -> Result<(), CommandError> {
    session_info(storage, name)?;
    storage.set_active(name)?;
    Ok(())
}

pub fn format_session(info: &SessionInfo, active: bool) -> String {
    format!(
        "{}{} - {} workers, workspace {}, created {}",
        info.name,
        if active { " (active)" } else { "" },
        info.worker_count,
        info.workspace.display(),
        info.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    )
}
