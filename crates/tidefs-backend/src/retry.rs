//! Retry with exponential backoff for backend operations.
//!
//! Only transient errors ([`BackendError::is_transient`]) are retried;
//! permanent errors surface immediately. The flusher and fetcher layers wrap
//! every backend call in an executor configured from the mount.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BackendError, Result};

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try.
    pub max_retries: u32,
    /// Initial backoff duration.
    pub initial_backoff: Duration,
    /// Cap on the backoff duration.
    pub max_backoff: Duration,
    /// Multiplier applied per attempt.
    pub backoff_multiplier: f64,
    /// Whether to add random jitter to each sleep.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Outcome of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// Operation succeeded.
    Success(T),
    /// Retries exhausted or a permanent error was hit.
    Exhausted {
        /// The last error observed.
        last_error: BackendError,
        /// Total number of attempts made.
        attempts: u32,
    },
}

impl<T> RetryOutcome<T> {
    /// Collapses the outcome into a plain `Result`.
    pub fn into_result(self) -> Result<T> {
        match self {
            RetryOutcome::Success(v) => Ok(v),
            RetryOutcome::Exhausted { last_error, .. } => Err(last_error),
        }
    }
}

/// Executor applying one retry policy to many operations.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Creates an executor with the given configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Runs `operation`, retrying transient failures with backoff.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> RetryOutcome<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return RetryOutcome::Success(value),
                Err(e) => {
                    if !e.is_transient() || attempt > self.config.max_retries {
                        return RetryOutcome::Exhausted {
                            last_error: e,
                            attempts: attempt,
                        };
                    }
                    let backoff = self.compute_backoff(attempt - 1);
                    debug!(
                        "transient backend error on attempt {}: {} (backing off {:?})",
                        attempt, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    fn compute_backoff(&self, prior_attempts: u32) -> Duration {
        let base = self.config.initial_backoff.as_millis() as f64
            * self.config.backoff_multiplier.powi(prior_attempts as i32);
        let capped = base.min(self.config.max_backoff.as_millis() as f64);
        let with_jitter = if self.config.jitter {
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            capped * factor
        } else {
            capped
        };
        Duration::from_millis(with_jitter.min(self.config.max_backoff.as_millis() as f64) as u64)
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
