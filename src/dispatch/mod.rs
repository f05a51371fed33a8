use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;

use crate::storage::SessionInfo;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Failed to run tmux: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("tmux {action} for pane {target} failed: {stderr}")]
    Tmux {
        action: String,
        target: String,
        stderr: String,
    },
}

/// Hands a rendered task message to a worker's terminal
#[allow(async_fn_in_trait)]
pub trait TaskDelivery {
    async fn deliver(&self, worker_id: u32, message: &str) -> Result<(), DeliveryError>;
}

/// Delivery that only records state; used with `--no-deliver`
pub struct RecordOnly;

impl TaskDelivery for RecordOnly {
    async fn deliver(&self, worker_id: u32, _message: &str) -> Result<(), DeliveryError> {
        tracing::debug!("Skipping delivery to worker {}", worker_id);
        Ok(())
    }
}

/// Types the message into the worker's tmux pane and submits it
pub struct TmuxDelivery {
    session: String,
    window: String,
}

impl TmuxDelivery {
    pub fn new(session: impl Into<String>, window: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            window: window.into(),
        }
    }

    pub fn for_session(info: &SessionInfo) -> Self {
        Self::new(info.tmux_session.clone(), info.tmux_window.clone())
    }

    /// Worker panes are numbered by worker id
    pub fn pane_target(&self, worker_id: u32) -> String {
        format!("{}:{}.{}", self.session, self.window, worker_id)
    }

    async fn send_keys(&self, target: &str, keys: &str, literal: bool) -> Result<(), DeliveryError> {
        let mut command = Command::new("tmux");
        command.args(["send-keys", "-t", target]);
        if literal {
            command.arg("-l");
        }
        let output = command.arg(keys).output().await?;

        if !output.status.success() {
            return Err(DeliveryError::Tmux {
                action: "send-keys".to_string(),
                target: target.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

impl TaskDelivery for TmuxDelivery {
    async fn deliver(&self, worker_id: u32, message: &str) -> Result<(), DeliveryError> {
        let target = self.pane_target(worker_id);

        // Multi-line text puts the agent CLI into paste mode; give it time to
        // settle, leave the mode with Escape, then submit.
        self.send_keys(&target, message, true).await?;
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.send_keys(&target, "Escape", false).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.send_keys(&target, "Enter", false).await?;

        tracing::info!("Delivered task to worker {} ({})", worker_id, target);
        Ok(())
    }
}
