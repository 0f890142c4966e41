//! Cancellable retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Backoff policy for transient failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the second attempt, in milliseconds.
    pub initial_backoff_ms: u64,

    /// Upper bound for any single delay, in milliseconds.
    pub max_backoff_ms: u64,

    /// Factor applied to the delay after every failed attempt.
    pub multiplier: f64,

    /// Total attempts before giving up; `None` retries until cancelled.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        #[expect(clippy::cast_precision_loss)]
        let scaled = self.initial_backoff_ms as f64 * factor;
        #[expect(clippy::cast_precision_loss)]
        let capped = scaled.min(self.max_backoff_ms as f64).max(0.0);
        #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = capped.round() as u64;
        Duration::from_millis(millis)
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

/// Run `op` until it succeeds, fails permanently, or `cancel` fires.
///
/// Only transient errors (see [`Error::is_transient`]) are retried. The
/// token is checked before every attempt and raced against each backoff.
pub async fn retry<T, F, Fut>(
    cancel: &CancellationToken,
    policy: &RetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        attempt = attempt.saturating_add(1);

        let result = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            result = op() => result,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() || policy.exhausted(attempt) => return Err(err),
            Err(err) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    op = op_name,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Request failed: {err}, retrying"
                );
                tokio::select! {
                    () = cancel.cancelled() => return Err(Error::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
