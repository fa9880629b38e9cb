//! Exponential-backoff retry policy.
//!
//! Shared by [`PersistentConnection::try_connect`] and
//! [`EventBus::publish`]: an operation is attempted once and then retried
//! up to [`BackoffConfig::retry_count`] times, waiting an exponentially
//! growing delay before each retry. Every wait is cancellable through a
//! [`CancellationToken`].
//!
//! [`PersistentConnection::try_connect`]: crate::connection::PersistentConnection::try_connect
//! [`EventBus::publish`]: crate::bus::EventBus::publish

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Retries after the initial attempt.
    pub retry_count: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            retry_count: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Total attempts the policy allows: the first one plus every retry.
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    /// Delay to wait before retry number `retry` (1-based).
    ///
    /// `initial_delay * multiplier^(retry - 1)`, clamped to `max_delay`.
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        let mut delay = self.initial_delay.min(self.max_delay);
        for _ in 1..retry {
            delay = next_delay(delay, self);
            if delay == self.max_delay {
                break;
            }
        }
        delay
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`BackoffConfig::max_delay`].
pub fn next_delay(current: Duration, config: &BackoffConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Sleep for `delay` unless `cancel` fires first.
///
/// Returns `false` when the wait was cut short by cancellation.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_delay_doubles() {
        let config = BackoffConfig::default();
        let d = next_delay(Duration::from_secs(2), &config);
        assert_eq!(d, Duration::from_secs(4));
    }

    #[test]
    fn next_delay_clamps_at_max() {
        let config = BackoffConfig {
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        let d = next_delay(Duration::from_secs(8), &config);
        assert_eq!(d, Duration::from_secs(10));
    }

    #[test]
    fn retry_delays_grow_exponentially() {
        let config = BackoffConfig::default();
        let delays: Vec<u64> = (1..=6)
            .map(|retry| config.delay_before_retry(retry).as_secs())
            .collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 60]);
    }

    #[test]
    fn custom_multiplier() {
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(10),
            multiplier: 3.0,
            ..Default::default()
        };
        assert_eq!(config.delay_before_retry(3), Duration::from_millis(90));
    }

    #[test]
    fn max_attempts_counts_initial_attempt() {
        let config = BackoffConfig {
            retry_count: 3,
            ..Default::default()
        };
        assert_eq!(config.max_attempts(), 4);

        let none = BackoffConfig {
            retry_count: 0,
            ..Default::default()
        };
        assert_eq!(none.max_attempts(), 1);
    }

    #[tokio::test]
    async fn cancelled_token_cuts_sleep_short() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let completed = sleep_or_cancel(Duration::from_secs(30), &cancel).await;
        assert!(!completed);
    }

    #[tokio::test]
    async fn sleep_completes_without_cancellation() {
        let cancel = CancellationToken::new();
        let completed = sleep_or_cancel(Duration::from_millis(1), &cancel).await;
        assert!(completed);
    }
}
