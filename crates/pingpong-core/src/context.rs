//! Per-call deadline and cancellation scope.
//!
//! A [`CallContext`] is created right before an outbound call and cancels itself
//! when dropped, so whatever path the calling code takes out of its scope the
//! call's resources are released.

use crate::cancel::CancellationToken;
use crate::error::{ChannelError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Lifecycle of a single outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Created,
    Sent,
    Completed,
    TimedOut,
    Failed,
}

impl CallState {
    /// Terminal state for a call that ended with `result`.
    pub fn from_outcome<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => CallState::Completed,
            Err(ChannelError::Timeout(_)) => CallState::TimedOut,
            Err(_) => CallState::Failed,
        }
    }
}

/// Deadline and cancellation token for one outbound call.
#[derive(Debug)]
pub struct CallContext {
    deadline: Instant,
    timeout: Duration,
    token: CancellationToken,
}

impl CallContext {
    /// Context whose deadline is `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            timeout,
            token: CancellationToken::new(),
        }
    }

    /// Context with an absolute deadline, which may already be in the past.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline,
            timeout: deadline.saturating_duration_since(Instant::now()),
            token: CancellationToken::new(),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// The duration this context was created with, reported in `Timeout` errors.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// A handle that can cancel this context from elsewhere.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fail fast if the context can no longer carry a call.
    pub fn check(&self) -> Result<()> {
        self.token.check()?;
        if self.is_expired() {
            return Err(ChannelError::Timeout(self.timeout));
        }
        Ok(())
    }

    /// Run `fut` bounded by this context.
    ///
    /// Cancellation wins over the deadline, the deadline over completion. When
    /// either fires, `fut` is dropped in place along with whatever it holds.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(ChannelError::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => Err(ChannelError::Timeout(self.timeout)),
            result = fut => result,
        }
    }
}

impl Drop for CallContext {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
