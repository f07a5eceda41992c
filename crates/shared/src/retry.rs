//! Retry schedule shared by the crawler and the downloader.
//!
//! Transient failures (timeouts, 5xx responses, connection resets) are
//! retried with exponential backoff up to a fixed attempt ceiling. The
//! policy only computes delays; the retry loops live with the operations
//! that fail.

use std::time::Duration;

/// Attempt ceiling plus exponential backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first (1 = no retries).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Factor applied per subsequent retry.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy with no delays, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Whether another attempt is allowed after `attempt` attempts were made.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to sleep before attempt `attempt + 1`, given `attempt` attempts
    /// were already made (so the first retry sleeps `base_delay`).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        self.base_delay.mul_f64(self.multiplier.powi(exp as i32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
        };

        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
    }

    #[test]
    fn attempt_ceiling_is_enforced() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }

    #[test]
    fn immediate_policy_has_zero_delay() {
        let policy = RetryPolicy::immediate(5);
        assert_eq!(policy.delay_after(3), Duration::ZERO);
        assert!(policy.allows_retry(4));
        assert!(!policy.allows_retry(5));
    }
}
