//! Retry and timeout utilities.
//!
//! Hosts use these to re-run a failed install phase: a failed install leaves
//! no partial generation behind, so running it again is always safe.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (1 = no retries).
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier (e.g., 2.0 for exponential).
    pub backoff_multiplier: f64,
    /// Add jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a config for no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a config with the given attempt count and default backoff.
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// Calculate delay for a given attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let base_delay =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi((attempt - 2) as i32);

        let delay = Duration::from_secs_f64(base_delay.min(self.max_delay.as_secs_f64()));

        if self.jitter {
            // Up to 25% on top.
            let jitter = delay.as_secs_f64() * (rand_jitter() * 0.25);
            delay + Duration::from_secs_f64(jitter)
        } else {
            delay
        }
    }
}

/// Pseudo-random jitter in `0.0..=1.0` from the clock's subsecond nanos.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos as f64) / (u32::MAX as f64)
}

/// Retry a fallible async operation with exponential backoff.
pub async fn retry_with_backoff<T, E, F, Fut>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_when(config, operation, |_| true).await
}

/// Retry with backoff, giving up early when `should_retry` rejects an error.
pub async fn retry_when<T, E, F, Fut, P>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        if attempt > 1 {
            let delay = config.delay_for_attempt(attempt);
            debug!(attempt, ?delay, "Retrying after delay");
            sleep(delay).await;
        }

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after retries");
                }
                return Ok(value);
            }
            Err(e) => {
                warn!(attempt, max_attempts, error = %e, "Operation failed");
                if attempt >= max_attempts || !should_retry(&e) {
                    return Err(e);
                }
            }
        }

        attempt += 1;
    }
}

/// Run an operation with a timeout.
pub async fn with_timeout<T, F, Fut>(timeout: Duration, operation: F) -> crate::Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, operation())
        .await
        .map_err(|_| crate::Error::Timeout(timeout))
}
