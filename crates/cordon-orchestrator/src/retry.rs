//! Fixed-delay retry for provider calls.
//!
//! Two named policies cover every retried call in the orchestrator:
//!
//! * [`RetryPolicy::consistency`] rides out eventual-consistency windows
//!   where a freshly created resource is not yet visible to follow-up
//!   calls. Generous attempt count, fixed delay.
//! * [`RetryPolicy::idempotent`] re-fires fire-and-forget calls (deletes,
//!   tag writes) a small number of times.
//!
//! Delays are deliberately constant. The provider windows these policies
//! absorb are short and bounded, so exponential growth only delays the
//! point where the orchestrator gives up and reports the failure.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::error::Result;

/// A fixed-delay retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Pause between consecutive attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Build a policy from raw parts.
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Policy for calls racing the provider's eventual consistency.
    pub const fn consistency() -> Self {
        Self::new(30, Duration::from_secs(2))
    }

    /// Policy for idempotent fire-and-forget calls.
    pub const fn idempotent() -> Self {
        Self::new(3, Duration::from_secs(2))
    }

    /// Same schedule with a different delay. Used by tests and by
    /// configurations that tune provider pacing.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Run `operation` under `policy`, retrying retryable failures.
///
/// Non-retryable errors (validation, conflict, not-found, cancellation)
/// are returned immediately without consuming further attempts.
pub async fn retry<F, Fut, T>(policy: RetryPolicy, operation_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        operation = operation_name,
                        attempt, "operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) if attempt >= policy.max_attempts => {
                error!(
                    operation = operation_name,
                    attempts = attempt,
                    error = %err,
                    "operation failed, retries exhausted"
                );
                return Err(err);
            }
            Err(err) => {
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    "operation failed, retrying"
                );
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}
