//! Bounded exponential backoff for provider calls.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ExecutionConfig;
use crate::error::ProviderError;

/// Retry policy applied to every provider call made by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
    /// Timeout applied to each attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ExecutionConfig::default())
    }
}

impl RetryPolicy {
    /// Builds the policy from executor settings.
    #[must_use]
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            attempt_timeout: config.action_timeout(),
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn no_retry(attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            attempt_timeout,
        }
    }

    /// Sets the total number of attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the backoff bounds.
    #[must_use]
    pub const fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub const fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }

    /// Runs `call` until it succeeds, fails terminally, or attempts run out.
    ///
    /// Each attempt is bounded by `attempt_timeout`; an elapsed attempt
    /// becomes [`ProviderError::Timeout`], which is retryable. Returns the
    /// final outcome together with the number of attempts made.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> (Result<T, ProviderError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let outcome = match tokio::time::timeout(self.attempt_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout {
                    operation: operation.to_string(),
                    secs: self.attempt_timeout.as_secs(),
                }),
            };

            match outcome {
                Ok(value) => return (Ok(value), attempt),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{operation} attempt {attempt}/{} failed: {e}; retrying in {delay:?}",
                        self.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    debug!("{operation} giving up after {attempt} attempt(s): {e}");
                    return (Err(e), attempt);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy::default()
            .with_backoff(Duration::from_millis(1), Duration::from_millis(4))
            .with_attempt_timeout(Duration::from_secs(5))
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::default()
            .with_backoff(Duration::from_millis(500), Duration::from_millis(3000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(3000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(3000));
    }

    #[test]
    fn test_from_config() {
        let config = ExecutionConfig {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 800,
            action_timeout_secs: 30,
            ..ExecutionConfig::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_backoff, Duration::from_millis(100));
        assert_eq!(policy.attempt_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let (result, attempts) = fast()
            .run("create", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::retryable("create", "busy"))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_terminal_error_not_retried() {
        let (result, attempts) = fast()
            .run("delete", || async {
                Err::<(), _>(ProviderError::terminal("delete", "denied"))
            })
            .await;

        assert!(matches!(result, Err(ProviderError::Terminal { .. })));
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_attempt_ceiling() {
        let (result, attempts) = fast()
            .with_max_attempts(4)
            .run("update", || async {
                Err::<(), _>(ProviderError::retryable("update", "busy"))
            })
            .await;

        assert!(matches!(result, Err(ProviderError::Retryable { .. })));
        assert_eq!(attempts, 4);
    }

    #[tokio::test]
    async fn test_timeout_becomes_error() {
        let policy = RetryPolicy::no_retry(Duration::from_millis(10));
        let (result, attempts) = policy
            .run("read", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(ProviderError::Timeout { .. })));
        assert_eq!(attempts, 1);
    }
}
