use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// One-shot result cell shared between a single resolver and any number of
/// waiters. Terminal states are a value or an error; whichever lands first
/// wins and every later observer sees the same resolution.
pub struct SetOnce<T: Clone> {
    cell: Mutex<Option<Result<T, Arc<anyhow::Error>>>>,
    notify: Notify,
}

#[derive(Debug, Error, Clone)]
pub enum WaitError {
    #[error("{0}")]
    Failed(Arc<anyhow::Error>),
    #[error("wait cancelled")]
    Cancelled,
}

impl<T: Clone> SetOnce<T> {
    pub fn new() -> Self {
        Self {
            cell: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Resolves with a value. Returns false when the cell was already resolved.
    pub fn set_value(&self, value: T) -> bool {
        self.resolve(Ok(value))
    }

    /// Resolves with an error. Returns false when the cell was already resolved.
    pub fn set_error(&self, error: anyhow::Error) -> bool {
        self.resolve(Err(Arc::new(error)))
    }

    fn resolve(&self, result: Result<T, Arc<anyhow::Error>>) -> bool {
        {
            let mut cell = self.cell.lock();
            if cell.is_some() {
                return false;
            }
            *cell = Some(result);
        }
        self.notify.notify_waiters();
        true
    }

    /// Current resolution without blocking.
    pub fn peek(&self) -> Option<Result<T, Arc<anyhow::Error>>> {
        self.cell.lock().clone()
    }

    /// Blocks until the cell resolves or `cancel` fires.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<T, WaitError> {
        loop {
            // Register for the wakeup before checking the cell so a resolve
            // racing between the check and the await is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.cell.lock().clone() {
                return result.map_err(WaitError::Failed);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(WaitError::Cancelled),
                _ = notified.as_mut() => {}
            }
        }
    }
}

impl<T: Clone> Default for SetOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}
