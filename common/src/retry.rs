// Retry strategy for the expense-creation call: explicit `shouldRetry`
// classification plus an exponential-backoff delay, so tests can drive the
// state machine synchronously rather than relying on implicit await chains.

use rand::Rng;
use std::time::Duration;

/// Retry strategy trait for calculating retry delays.
pub trait RetryStrategy: Send + Sync {
    /// Calculates the delay before the next retry attempt. Returns `None`
    /// once `max_retries` has been reached.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;

    fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries()
    }

    fn max_retries(&self) -> u32;
}

/// Exponential backoff bounded by `[initial_delay, max_delay]`, with jitter
/// to avoid a thundering herd when many templates fire at once.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    max_retries: u32,
    jitter_factor: f64,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_retries,
            jitter_factor: 0.1,
        }
    }

    /// The core's default policy: 3 attempts, 1000-10000ms bounds.
    pub fn default_expense_service_policy() -> Self {
        Self::new(Duration::from_millis(1_000), Duration::from_millis(10_000), 3)
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let base_ms = self.initial_delay.as_millis() as f64 * 2f64.powi(attempt as i32);
        let capped_ms = base_ms.min(self.max_delay.as_millis() as f64);

        let jitter = rand::thread_rng().gen_range(0.0..=self.jitter_factor);
        let with_jitter = capped_ms * (1.0 + jitter);
        let final_ms = with_jitter.min(self.max_delay.as_millis() as f64).max(0.0);
        Some(Duration::from_millis(final_ms as u64))
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respects_max_retries() {
        let strategy = ExponentialBackoff::default_expense_service_policy();
        assert!(strategy.should_retry(0));
        assert!(strategy.should_retry(2));
        assert!(!strategy.should_retry(3));
        assert!(strategy.next_delay(3).is_none());
    }

    #[test]
    fn delay_never_exceeds_max_delay() {
        let strategy = ExponentialBackoff::new(Duration::from_millis(1_000), Duration::from_millis(10_000), 10);
        for attempt in 0..10 {
            let delay = strategy.next_delay(attempt).unwrap();
            assert!(delay <= Duration::from_millis(10_000));
        }
    }

    #[test]
    fn delay_grows_with_attempt_before_the_cap() {
        let strategy = ExponentialBackoff::new(Duration::from_millis(1_000), Duration::from_millis(10_000), 5);
        let first = strategy.next_delay(0).unwrap();
        let second = strategy.next_delay(1).unwrap();
        assert!(second >= first);
    }
}
