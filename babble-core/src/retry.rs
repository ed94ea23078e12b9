//! Bounded retry with exponential backoff and a per-attempt timeout.

use crate::error::{BabbleError, BabbleResult, RemoteError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Retry configuration for remote operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f32,
    /// Upper bound on a single attempt.
    pub attempt_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 2_000,
            backoff_multiplier: 2.0,
            attempt_timeout_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries once with the given timeout.
    pub fn no_retry(attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            attempt_timeout_ms: attempt_timeout.as_millis() as u64,
            ..Self::default()
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Backoff to wait after the given (1-based) failed attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let factor = f64::from(self.backoff_multiplier).powi(exponent);
        let millis = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(millis.max(0.0) as u64)
    }
}

/// Run `operation` until it succeeds, fails with a non-transient error, or
/// the policy's attempts are exhausted.
///
/// Each attempt is raced against `attempt_timeout`; a timeout counts as a
/// transient [`RemoteError::Timeout`]. The last error is returned.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut attempt_fn: F,
) -> BabbleResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = BabbleResult<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let timeout = policy.attempt_timeout();
    let mut last_error = None;

    for attempt in 1..=attempts {
        let outcome = match tokio::time::timeout(timeout, attempt_fn(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(BabbleError::Remote(RemoteError::timeout(operation, timeout))),
        };

        match outcome {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(operation, attempt, "Remote operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if !err.is_transient() => {
                tracing::warn!(operation, attempt, error = %err, "Remote operation failed permanently");
                return Err(err);
            }
            Err(err) => {
                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts = attempts,
                    error = %err,
                    "Remote operation failed"
                );
                last_error = Some(err);
                if attempt < attempts {
                    tokio::time::sleep(policy.backoff_for(attempt)).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        BabbleError::Remote(RemoteError::unavailable(operation, "no attempts made"))
    }))
}
