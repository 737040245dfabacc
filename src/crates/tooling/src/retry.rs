//! Retry policies for async operations
//!
//! Configurable retries with exponential backoff and jitter for transient
//! failures. The operation passed to [`with_retry`] must be idempotent.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Configuration for retrying failed operations
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: usize,

    /// Interval before the first retry
    pub initial_interval: Duration,

    /// Multiplier applied to the interval after each retry
    pub backoff_factor: f64,

    /// Upper bound on the interval between retries
    pub max_interval: Duration,

    /// Whether to add random jitter to intervals
    pub jitter: bool,
}

impl RetryPolicy {
    /// Create a new retry policy with the given max attempts
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            initial_interval: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_interval: Duration::from_secs(60),
            jitter: true,
        }
    }

    /// Set the interval before the first retry
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the backoff factor
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Set the maximum interval between retries
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate the delay before retrying after a given attempt (0-indexed).
    ///
    /// Exponential backoff capped at `max_interval`, with an optional random
    /// jitter factor between 0.5 and 1.5.
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        if attempt >= self.max_attempts {
            return Duration::ZERO;
        }

        let base = self.initial_interval.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = base.min(self.max_interval.as_secs_f64());

        let delayed = if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..=1.5);
            capped * factor
        } else {
            capped
        };

        Duration::from_secs_f64(delayed)
    }

    /// Check if another attempt is allowed
    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Execute an async operation under a retry policy.
///
/// Returns the first success, or the last error once all attempts are
/// exhausted.
pub async fn with_retry<F, Fut, T, E>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut last_error = None;

    for attempt in 0..policy.max_attempts {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => {
                tracing::debug!("Attempt {} failed: {}", attempt + 1, error);
                last_error = Some(error);

                if !policy.should_retry(attempt + 1) {
                    break;
                }

                tokio::time::sleep(policy.calculate_delay(attempt)).await;
            }
        }
    }

    Err(last_error.expect("at least one attempt was made"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_interval, Duration::from_millis(500));
        assert_eq!(policy.backoff_factor, 2.0);
        assert!(policy.jitter);
    }

    #[test]
    fn test_exponential_backoff_without_jitter() {
        let policy = RetryPolicy::new(5)
            .with_initial_interval(Duration::from_secs(1))
            .with_backoff_factor(2.0)
            .with_max_interval(Duration::from_secs(100))
            .with_jitter(false);

        assert_eq!(policy.calculate_delay(0), Duration::from_secs(1));
        assert_eq!(policy.calculate_delay(1), Duration::from_secs(2));
        assert_eq!(policy.calculate_delay(2), Duration::from_secs(4));
        assert_eq!(policy.calculate_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn test_max_interval_cap() {
        let policy = RetryPolicy::new(10)
            .with_initial_interval(Duration::from_secs(10))
            .with_backoff_factor(2.0)
            .with_max_interval(Duration::from_secs(50))
            .with_jitter(false);

        assert_eq!(policy.calculate_delay(5), Duration::from_secs(50));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::new(5)
            .with_initial_interval(Duration::from_secs(1))
            .with_backoff_factor(2.0)
            .with_jitter(true);

        for _ in 0..20 {
            let delay = policy.calculate_delay(2).as_secs_f64();
            assert!(delay >= 2.0);
            assert!(delay <= 6.0);
        }
    }

    #[test]
    fn test_delay_beyond_max_attempts_is_zero() {
        let policy = RetryPolicy::new(3);
        assert_eq!(policy.calculate_delay(3), Duration::ZERO);
        assert_eq!(policy.calculate_delay(10), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_with_retry_succeeds_first_attempt() {
        let policy = RetryPolicy::new(3);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result = with_retry(&policy, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_recovers_after_failures() {
        let policy = RetryPolicy::new(3)
            .with_initial_interval(Duration::from_millis(5))
            .with_jitter(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result = with_retry(&policy, move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("transient")
                } else {
                    Ok::<_, &str>("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_exhausts_attempts() {
        let policy = RetryPolicy::new(2)
            .with_initial_interval(Duration::from_millis(5))
            .with_jitter(false);

        let result: Result<(), _> = with_retry(&policy, || async { Err("persistent") }).await;

        assert_eq!(result.unwrap_err(), "persistent");
    }
}
