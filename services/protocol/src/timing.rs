//! Cancellable timed waits.
//!
//! Every fixed delay in the system (sensor cadence, servo steps, camera
//! warm-up, retry spacing) goes through [`Pause::wait`] so the waiting side can
//! be interrupted by a [`CancellationToken`] instead of sleeping blindly.

use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// The wait was interrupted by cancellation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("wait interrupted by cancellation")]
pub struct Interrupted;

/// Timed waits bound to a cancellation token.
#[derive(Debug, Clone, Default)]
pub struct Pause {
    token: CancellationToken,
}

impl Pause {
    /// A pause that is never cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// A pause interrupted when `token` is cancelled.
    pub fn with_token(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for `duration` unless cancelled first.
    pub async fn wait(&self, duration: Duration) -> Result<(), Interrupted> {
        if self.token.is_cancelled() {
            return Err(Interrupted);
        }
        if duration.is_zero() {
            return Ok(());
        }

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Interrupted),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
