//! Retry with exponential backoff for transient failures.
//!
//! Used when connecting to the source and target at startup. Only errors
//! whose [`is_retryable()`](crate::ReplicationError::is_retryable) is true
//! are retried; anything else fails immediately.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> doc_replication_engine::Result<()> {
//! use doc_replication_engine::resilience::{retry_with_backoff, RetryConfig};
//!
//! let value = retry_with_backoff("ping", &RetryConfig::startup(), || async { Ok(42) }).await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use crate::error::{ReplicationError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for connection retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: usize,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for exponential backoff.
    pub max_delay: Duration,

    /// Delay multiplier per attempt.
    pub backoff_factor: f64,

    /// Timeout for each individual attempt.
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Startup connections: fail after roughly a minute so a wrong URI is
    /// reported instead of hanging.
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        500ms
    /// 2        750ms
    /// 3        1.12s
    /// ...
    /// 20       30s (cap)
    /// ```
    pub fn startup() -> Self {
        Self {
            max_attempts: 20,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 1.5,
            connection_timeout: Duration::from_secs(10),
        }
    }

    /// Retry forever, capped at five minutes between attempts.
    pub fn daemon() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(30),
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_millis(500),
        }
    }

    /// Delay after the given attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let delay_secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempts run out. Each attempt is bounded by `connection_timeout`.
pub async fn retry_with_backoff<T, F, Fut>(operation: &str, config: &RetryConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        let outcome = match tokio::time::timeout(config.connection_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(ReplicationError::connection(
                operation,
                format!("timed out after {:?}", config.connection_timeout),
            )),
        };

        match outcome {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_presets() {
        let daemon = RetryConfig::daemon();
        assert_eq!(daemon.max_attempts, usize::MAX);
        assert_eq!(daemon.max_delay, Duration::from_secs(300));

        let startup = RetryConfig::startup();
        assert_eq!(startup.max_attempts, 20);
        assert_eq!(startup.initial_delay, Duration::from_millis(500));

        let testing = RetryConfig::testing();
        assert_eq!(testing.max_attempts, 3);
        assert_eq!(testing.connection_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_delay_for_attempt() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            ..Default::default()
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(16));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
        // no overflow on absurd attempt counts
        assert_eq!(config.delay_for_attempt(usize::MAX), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let calls = AtomicUsize::new(0);
        let result = retry_with_backoff("connect", &RetryConfig::testing(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(ReplicationError::connection("postgres", "refused"))
                } else {
                    Ok("connected")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "connected");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_with_backoff("connect", &RetryConfig::testing(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ReplicationError::connection("mongo", "refused")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_does_not_retry_config_errors() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_with_backoff("connect", &RetryConfig::testing(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ReplicationError::Config("bad uri".into())) }
        })
        .await;

        assert!(matches!(result, Err(ReplicationError::Config(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_times_out_slow_attempts() {
        let config = RetryConfig {
            max_attempts: 2,
            ..RetryConfig::testing()
        };
        let result: Result<()> = retry_with_backoff("connect", &config, || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("timed out"));
    }
}
