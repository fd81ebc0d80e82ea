//! Retry policy for batch application
//!
//! Exponential backoff with jitter. A batch gets one initial attempt plus
//! up to `max_retries` retries before it is declared DEAD.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the initial attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_interval: Duration,
    /// Upper bound for any single delay
    pub max_interval: Duration,
    pub backoff_coefficient: f64,
    /// Jitter factor (0.0-1.0); 0.1 means ±10%
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// 5 retries, 100ms doubling up to 10s, 10% jitter.
    pub fn exponential() -> Self {
        Self {
            max_retries: 5,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(10),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// Fail on the first error.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the given retry (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(retry.saturating_sub(1).min(62) as i32);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let jitter_range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-jitter_range..jitter_range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Whether another retry is allowed after `retries_done` retries.
    pub fn has_retries_remaining(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }

    /// Total attempts a batch may receive.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_without_jitter() {
        let policy = RetryPolicy::exponential().with_jitter(0.0);
        assert_eq!(policy.delay_for_retry(0), Duration::ZERO);
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::exponential()
            .with_jitter(0.0)
            .with_max_interval(Duration::from_millis(250));
        assert_eq!(policy.delay_for_retry(10), Duration::from_millis(250));
        assert_eq!(policy.delay_for_retry(u32::MAX), Duration::from_millis(250));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::exponential().with_jitter(0.5);
        for _ in 0..100 {
            let delay = policy.delay_for_retry(1);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_retry_budget() {
        let policy = RetryPolicy::exponential().with_max_retries(2);
        assert_eq!(policy.max_attempts(), 3);
        assert!(policy.has_retries_remaining(0));
        assert!(policy.has_retries_remaining(1));
        assert!(!policy.has_retries_remaining(2));
        assert!(!RetryPolicy::no_retry().has_retries_remaining(0));
    }
}
