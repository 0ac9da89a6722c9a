//! Retry utilities with exponential backoff.
//!
//! Used by the peering manager to restore degraded connections in the
//! background.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff policy for a retried operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub exponential_base: f64,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        exponential_base: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            exponential_base,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            exponential_base: 2.0,
        }
    }

    /// Short delays for in-process operations.
    #[must_use]
    pub fn fast() -> Self {
        Self::new(
            3,
            Duration::from_millis(10),
            Duration::from_millis(100),
            2.0,
        )
    }

    /// Default policy for restoring a degraded peer link.
    #[must_use]
    pub fn peering() -> Self {
        Self::new(
            5,
            Duration::from_millis(50),
            Duration::from_secs(2),
            2.0,
        )
    }

    /// Delay before retry number `attempt` (1-based; attempt 0 is the
    /// initial try and has no delay).
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw_ms = self.initial_delay.as_millis() as f64 * self.exponential_base.powi(exponent);
        let capped_ms = raw_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms.max(0.0) as u64)
    }

    /// Whether another retry is allowed after `current_attempt` attempts.
    #[must_use]
    pub fn should_retry(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }

    /// Iterator over every retry delay in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_attempts).map(|attempt| self.delay_for_attempt(attempt))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::peering()
    }
}

/// Result of a retried operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T, E> {
    /// Operation succeeded.
    Success(T),
    /// Every allowed attempt failed.
    Exhausted {
        /// The last error.
        error: E,
        /// Number of attempts made.
        attempts: u32,
    },
    /// The predicate refused to retry a non-retryable error.
    Aborted {
        /// The error that stopped the loop.
        error: E,
    },
}

impl<T, E> RetryOutcome<T, E> {
    /// Returns true if the operation succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Converts to a `Result`, dropping the attempt count.
    ///
    /// # Errors
    ///
    /// Returns the final error when the operation did not succeed.
    pub fn into_result(self) -> Result<T, E> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Exhausted { error, .. } | Self::Aborted { error } => Err(error),
        }
    }
}

/// Run `operation` until it succeeds, the policy is exhausted, or
/// `should_retry` rejects an error.
///
/// The operation receives the zero-based attempt number.
///
/// # Example
///
/// ```rust
/// use synapse_core::retry::{RetryConfig, retry};
///
/// # async fn example() {
/// let outcome = retry(&RetryConfig::fast(), |attempt| async move {
///     if attempt < 1 { Err("busy") } else { Ok(attempt) }
/// }, |_err| true).await;
/// assert!(outcome.is_success());
/// # }
/// ```
pub async fn retry<T, E, Fut, F, P>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt: u32 = 0;

    loop {
        match operation(attempt).await {
            Ok(value) => return RetryOutcome::Success(value),
            Err(error) => {
                if !should_retry(&error) {
                    return RetryOutcome::Aborted { error };
                }
                if !config.should_retry(attempt) {
                    return RetryOutcome::Exhausted {
                        error,
                        attempts: attempt.saturating_add(1),
                    };
                }

                attempt = attempt.saturating_add(1);
                tokio::time::sleep(config.delay_for_attempt(attempt)).await;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially() {
        let config = RetryConfig::new(4, Duration::from_millis(50), Duration::from_secs(5), 2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(50));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(200));
    }

    #[test]
    fn delay_is_capped() {
        let config = RetryConfig::new(8, Duration::from_millis(100), Duration::from_millis(300), 2.0);
        assert_eq!(config.delay_for_attempt(6), Duration::from_millis(300));
        assert_eq!(config.delays().count(), 8);
    }

    #[test]
    fn no_retry_policy() {
        let config = RetryConfig::no_retry();
        assert!(!config.should_retry(0));
        assert_eq!(config.delays().count(), 0);
    }

    #[tokio::test]
    async fn retry_recovers_after_transient_failures() {
        let config = RetryConfig::new(5, Duration::from_millis(1), Duration::from_millis(5), 2.0);
        let outcome = retry(
            &config,
            |attempt| async move { if attempt < 2 { Err("busy") } else { Ok("linked") } },
            |_| true,
        )
        .await;
        assert_eq!(outcome, RetryOutcome::Success("linked"));
    }

    #[tokio::test]
    async fn retry_reports_exhaustion() {
        let config = RetryConfig::new(2, Duration::from_millis(1), Duration::from_millis(5), 2.0);
        let outcome = retry(&config, |_| async { Err::<(), _>("down") }, |_| true).await;
        assert_eq!(
            outcome,
            RetryOutcome::Exhausted {
                error: "down",
                attempts: 3
            }
        );
    }

    #[tokio::test]
    async fn retry_stops_on_non_retryable_error() {
        let config = RetryConfig::fast();
        let outcome = retry(&config, |_| async { Err::<(), _>("closed") }, |e| *e != "closed").await;
        assert_eq!(outcome.into_result(), Err("closed"));
    }
}
