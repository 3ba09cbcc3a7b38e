//! Bounded retry of remote and cache operations
//!
//! Every attempt is separated by a fixed delay; once the wall-clock budget is
//! spent the executor gives up with [`EnvError::TimedOut`]. Which failures
//! count as retryable is decided per call site: remote reads retry transient
//! I/O only, while reads that cross the tailer boundary also retry `NotFound`
//! because the record may simply not be materialized yet.

use crate::error::{EnvError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default wall-clock budget for one retried operation
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(180);

/// Default delay between attempts
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Whether repeating an operation is safe
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Idempotency {
    /// Repeating the call has the same effect as calling it once
    Idempotent,
    /// Repeating the call may duplicate its effect; attempted once
    NonIdempotent,
}

/// Which failures are worth another attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryOn {
    /// Transient I/O failures only; `NotFound` is authoritative
    Transient,
    /// Transient failures and `NotFound` (not yet visible)
    TransientOrMissing,
}

impl RetryOn {
    fn covers(self, err: &EnvError) -> bool {
        match self {
            RetryOn::Transient => err.is_transient(),
            RetryOn::TransientOrMissing => err.is_transient() || err.is_not_found(),
        }
    }
}

/// Fixed-interval retry with a wall-clock budget
#[derive(Clone, Debug)]
pub struct RetryExecutor {
    timeout: Duration,
    interval: Duration,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_TIMEOUT, DEFAULT_RETRY_INTERVAL)
    }
}

impl RetryExecutor {
    /// Create an executor with the given budget and inter-attempt delay
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Total budget per operation
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Delay between attempts
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run `op` until it succeeds, fails permanently, or the budget is spent
    ///
    /// Non-idempotent operations and latched fatal errors are never retried.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        idempotency: Idempotency,
        retry_on: RetryOn,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if idempotency == Idempotency::NonIdempotent
                || err.is_fatal()
                || !retry_on.covers(&err)
            {
                return Err(err);
            }

            let waited = start.elapsed();
            if waited + self.interval > self.timeout {
                warn!(
                    operation = %operation,
                    attempts = attempt,
                    error = %err,
                    "Retry budget exhausted"
                );
                return Err(EnvError::TimedOut {
                    operation: operation.to_string(),
                    waited,
                });
            }

            debug!(operation = %operation, attempt, error = %err, "Retrying");
            tokio::time::sleep(self.interval).await;
        }
    }

    /// Retry an idempotent remote call on transient failures
    pub async fn remote<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(operation, Idempotency::Idempotent, RetryOn::Transient, op)
            .await
    }
}
