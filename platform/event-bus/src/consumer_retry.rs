//! Consumer retry logic with exponential backoff
//!
//! Consumers retry transient handler failures in-process before giving the
//! message up. Errors the caller classifies as permanent stop immediately.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles on each further retry
    pub initial_backoff: Duration,
    /// Upper bound on a single backoff
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Backoff to wait after the given failed attempt (1-based)
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

/// Retry a fallible async operation with exponential backoff
///
/// Every error is treated as retriable.
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    config: &RetryConfig,
    context: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + Send,
{
    retry_with_backoff_if(operation, config, context, |_| true).await
}

/// Retry a fallible async operation while `is_retriable` accepts the error
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    operation: F,
    config: &RetryConfig,
    context: &str,
    is_retriable: P,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + Send,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(context = %context, attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if !is_retriable(&e) => {
                warn!(context = %context, attempt, error = %e, "Operation failed with non-retriable error");
                return Err(e);
            }
            Err(e) => {
                if attempt >= config.max_attempts {
                    warn!(
                        context = %context,
                        attempts = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let backoff = config.backoff_after(attempt);
                warn!(
                    context = %context,
                    attempt,
                    max_attempts = config.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying with backoff"
                );

                sleep(backoff).await;
            }
        }
    }
}
