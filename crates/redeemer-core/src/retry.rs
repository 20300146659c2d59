//! Retry with exponential backoff.
//!
//! Used for catalog page fetches and name backfill. The redemption loop uses
//! the same [`RetryPolicy`] for its transient-failure backoff but drives the
//! attempts itself, because a platform answer is not an `Err`.
//!
//! ```rust,ignore
//! use redeemer_core::retry::{RetryPolicy, with_retry};
//!
//! let page = with_retry(&RetryPolicy::catalog_fetch(), || source.list_apps(cursor)).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::Result;

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Initial delay before first retry (default: 100ms).
    pub initial_delay: Duration,
    /// Maximum delay between retries (default: 30s).
    pub max_delay: Duration,
    /// Multiplier applied to delay after each retry (default: 2.0).
    pub backoff_factor: f64,
    /// Random jitter range as percentage (default: 0.1 = ±10%).
    pub jitter_percent: f64,
    /// Maximum number of attempts. None = retry forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: Some(3),
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with the specified parameters.
    #[must_use]
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
        jitter_percent: f64,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_factor: backoff_factor.max(1.0),
            jitter_percent: jitter_percent.clamp(0.0, 1.0),
            max_attempts,
        }
    }

    /// Policy for catalog listing pages: 4 attempts, 1s initial.
    #[must_use]
    pub fn catalog_fetch() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: Some(4),
        }
    }

    /// Policy for single app-detail lookups: 2 attempts, 500ms initial.
    #[must_use]
    pub fn app_detail() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: Some(2),
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    #[allow(clippy::cast_possible_wrap)]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        let exp = attempt.min(31) as i32;
        let base_ms = (initial_ms as f64) * self.backoff_factor.powi(exp);
        let base_ms = base_ms.min(max_ms as f64);

        let jitter = if self.jitter_percent > 0.0 && base_ms > 0.0 {
            let mut rng = rand::rng();
            let jitter_range = base_ms * self.jitter_percent;
            rng.random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        let delay_ms = (base_ms + jitter).max(0.0);
        Duration::from_millis(delay_ms as u64)
    }

    /// True when `attempts` already made leave no budget for another.
    #[must_use]
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Outcome of a retry operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// The result (success or final error).
    pub result: Result<T>,
    /// Number of attempts made.
    pub attempts: u32,
    /// Total time spent (including delays).
    pub elapsed: Duration,
}

/// Execute an async operation with retry and exponential backoff.
///
/// Errors that are not [`crate::Error::is_retryable`] are returned at once.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry_outcome(policy, operation).await.result
}

/// Execute an async operation with retry, returning detailed outcome.
#[allow(clippy::cast_possible_truncation)]
pub async fn with_retry_outcome<T, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = tokio::time::Instant::now();
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        total_attempts = attempt + 1,
                        retries = attempt,
                        "Operation succeeded after retries"
                    );
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt + 1,
                    elapsed: start.elapsed(),
                };
            }
            Err(e) => {
                attempt += 1;

                if !e.is_retryable() {
                    debug!(attempt, error = %e, "Non-retryable error, giving up");
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    };
                }

                if policy.exhausted(attempt) {
                    warn!(
                        attempt,
                        max_attempts = ?policy.max_attempts,
                        error = %e,
                        "Operation failed after all retry attempts"
                    );
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    };
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying operation after failure"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, Error};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_factor: 2.0,
            jitter_percent: 0.0,
            max_attempts: Some(max_attempts),
        }
    }

    #[test]
    fn delay_calculation_with_backoff() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter_percent: 0.0,
            max_attempts: Some(5),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            jitter_percent: 0.0,
            max_attempts: Some(10),
        };
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    #[allow(clippy::cast_precision_loss)]
    fn jitter_within_range() {
        let policy = RetryPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(10),
            1.0,
            0.1,
            Some(5),
        );
        for _ in 0..100 {
            let delay_ms = policy.delay_for_attempt(0).as_millis() as f64;
            assert!((900.0..=1100.0).contains(&delay_ms), "delay out of range: {delay_ms}");
        }
    }

    #[test]
    fn new_clamps_parameters() {
        let policy = RetryPolicy::new(Duration::ZERO, Duration::ZERO, 0.5, 4.0, None);
        assert_eq!(policy.backoff_factor, 1.0);
        assert_eq!(policy.jitter_percent, 1.0);
        assert!(!policy.exhausted(u32::MAX));
        assert_eq!(policy.delay_for_attempt(3), Duration::ZERO);
    }

    #[tokio::test]
    async fn retry_succeeds_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let outcome = with_retry_outcome(&fast_policy(5), || {
            let count = Arc::clone(&counter);
            async move {
                if count.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Network("reset".into()))
                } else {
                    Ok::<_, Error>(42)
                }
            }
        })
        .await;

        assert_eq!(outcome.result.unwrap(), 42);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_exhausts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<i32> = with_retry(&fast_policy(3), || {
            let count = Arc::clone(&counter);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err(Error::Network("down".into()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let outcome: RetryOutcome<()> = with_retry_outcome(&fast_policy(5), || {
            let count = Arc::clone(&counter);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err(Error::Config(ConfigError::ParseError("bad".into())))
            }
        })
        .await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
