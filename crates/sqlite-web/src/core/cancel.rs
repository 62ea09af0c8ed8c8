use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{AppError, AppResult};

/// Cooperative cancellation plus an optional deadline, polled between row
/// fetches.
#[derive(Debug, Clone)]
pub struct CancelToken {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing token, e.g. a child of a per-request registry entry.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// A deadline too far out to represent means no deadline.
    pub fn expiring_in(mut self, timeout: Duration) -> Self {
        self.deadline = Instant::now().checked_add(timeout);
        self
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn check(&self) -> AppResult<()> {
        if self.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Err(AppError::Timeout),
            _ => Ok(()),
        }
    }
}
