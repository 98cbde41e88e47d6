//! Retry policies.
//!
//! A policy only decides the schedule; [`attempt`] decides what is worth
//! retrying, using [`ClientError::is_retryable`].

use crate::error::ClientError;
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Delay schedule between attempts of one operation.
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    /// Called after attempt number `attempt` (starting at 1) failed with a
    /// retryable error. Returns the delay before the next attempt, or `None`
    /// to give up.
    fn backoff(&self, attempt: u32) -> Option<Duration>;
}

/// Retries immediately, up to a fixed number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedRetry {
    pub attempts: u32,
}

impl Default for FixedRetry {
    fn default() -> Self {
        Self { attempts: 3 }
    }
}

impl RetryPolicy for FixedRetry {
    fn backoff(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.attempts).then_some(Duration::ZERO)
    }
}

/// Doubling delays from `low`, capped at `high`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub low: Duration,
    pub high: Duration,
    pub attempts: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            low: Duration::from_millis(1),
            high: Duration::from_millis(32),
            attempts: 5,
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn backoff(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        Some(self.low.saturating_mul(factor).min(self.high))
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy gives up. The last error is returned.
pub async fn attempt<T, F, Fut>(policy: &dyn RetryPolicy, mut op: F) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let mut attempt = 1;
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !err.is_retryable() {
            return Err(err);
        }
        let Some(delay) = policy.backoff(attempt) else {
            tracing::debug!(attempt, error = %err, "giving up");
            return Err(err);
        };

        tracing::debug!(attempt, ?delay, error = %err, "retrying");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
    }
}
