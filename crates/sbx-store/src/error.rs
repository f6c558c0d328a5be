use thiserror::Error;
use uuid::Uuid;

use crate::sandbox::SandboxState;

/// Error kinds surfaced by the sandbox store and its state machine.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sandbox {0} is already being started")]
    AlreadyBeingStarted(String),
    #[error("team {team_id} reached its concurrent sandbox limit")]
    LimitExceeded { team_id: Uuid },
    #[error("sandbox {0} not found")]
    NotFound(String),
    #[error("transition from {from} to {to} is not allowed")]
    InvalidTransition {
        from: SandboxState,
        to: SandboxState,
    },
    #[error("transition failed: {0}")]
    TransitionFailed(String),
    #[error("invalid sandbox record: {0}")]
    InvalidSandbox(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl From<crate::latch::WaitError> for StoreError {
    fn from(error: crate::latch::WaitError) -> Self {
        match error {
            crate::latch::WaitError::Failed(cause) => StoreError::TransitionFailed(cause.to_string()),
            crate::latch::WaitError::Cancelled => StoreError::Cancelled,
        }
    }
}
