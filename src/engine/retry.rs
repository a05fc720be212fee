//! Retry with linear backoff and cancellation.
//!
//! One [`RetryExecutor`] is configured per call site: the request path
//! retries `Internal` failures, the reconciler retries `BalanceChanged`
//! collisions, the scoring poller retries transient scoring failures.
//! The executor holds no state between invocations.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::context::Context;
use crate::types::{ErrorKind, Result, ServiceError};

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Backoff shape shared by every retrying call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    /// Wait before the second attempt (ms).
    #[serde(default = "default_first_delay_ms")]
    pub first_delay_ms: u64,
    /// Added to the wait for each further attempt (ms).
    #[serde(default = "default_delay_increment_ms")]
    pub delay_increment_ms: u64,
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_first_delay_ms() -> u64 {
    1000
}

fn default_delay_increment_ms() -> u64 {
    2000
}

fn default_max_attempts() -> u32 {
    4
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            first_delay_ms: default_first_delay_ms(),
            delay_increment_ms: default_delay_increment_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl RetryPolicy {
    pub fn new(first_delay: Duration, delay_increment: Duration, max_attempts: u32) -> Self {
        Self {
            first_delay_ms: first_delay.as_millis() as u64,
            delay_increment_ms: delay_increment.as_millis() as u64,
            max_attempts,
        }
    }

    /// Wait after failed attempt `attempt` (1-based):
    /// `first_delay + (attempt - 1) * delay_increment`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let steps = u64::from(attempt.saturating_sub(1));
        Duration::from_millis(
            self.first_delay_ms
                .saturating_add(steps.saturating_mul(self.delay_increment_ms)),
        )
    }

    /// Upper bound on the total time spent waiting when every attempt fails.
    pub fn total_wait(&self) -> Duration {
        (1..self.max_attempts).map(|a| self.delay_after(a)).sum()
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Maps every failure before the retriability check.
pub type ErrorNormalizer = Arc<dyn Fn(ServiceError) -> ServiceError + Send + Sync>;

#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    retriable: ErrorKind,
    normalize: Option<ErrorNormalizer>,
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .field("retriable", &self.retriable)
            .field("normalize", &self.normalize.is_some())
            .finish()
    }
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, retriable: ErrorKind) -> Self {
        Self {
            policy,
            retriable,
            normalize: None,
        }
    }

    pub fn with_normalizer<F>(mut self, normalize: F) -> Self
    where
        F: Fn(ServiceError) -> ServiceError + Send + Sync + 'static,
    {
        self.normalize = Some(Arc::new(normalize));
        self
    }

    /// Run `operation` until it succeeds, fails with a non-retriable error,
    /// or runs out of attempts. The last error is returned unchanged
    /// (after normalisation). Cancelling `ctx` during a backoff wait aborts
    /// with [`ServiceError::Cancelled`].
    pub async fn invoke<T, F, Fut>(&self, ctx: &Context, mut operation: F) -> Result<T>
    where
        F: FnMut(Context) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 1;

        loop {
            debug!(request_id = %ctx.request_id(), attempt, "Invoking operation");

            let err = match operation(ctx.clone()).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(request_id = %ctx.request_id(), attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            let err = match &self.normalize {
                Some(normalize) => normalize(err),
                None => err,
            };

            if err.kind() != self.retriable || attempt >= self.policy.max_attempts {
                debug!(
                    request_id = %ctx.request_id(),
                    attempt,
                    error = %err,
                    "Operation failed, not retrying"
                );
                return Err(err);
            }

            let delay = self.policy.delay_after(attempt);
            info!(
                request_id = %ctx.request_id(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retriable failure, backing off"
            );

            tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    info!(request_id = %ctx.request_id(), attempt, "Retry wait cancelled");
                    return Err(ServiceError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
