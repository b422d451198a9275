//! Generic exponential back-off, shared by any caller that retries a
//! fallible operation a bounded number of times.

use std::time::Duration;

/// A back-off policy: up to `max_retry` attempts, with delay growing as
/// `min(backoff_max, factor * 2^(n-1))` between attempt `n` and `n+1`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Maximum number of attempts, including the first.
    pub max_retry: u32,
    /// Multiplicative factor applied to `2^(n-1)`.
    pub factor: Duration,
    /// Upper bound on any single delay.
    pub backoff_max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retry: 3,
            factor: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// The delay to sleep before attempt `attempt` (1-indexed; the delay
    /// before the *first* retry, i.e. `attempt == 2`, uses `n == 1`).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let n = attempt.saturating_sub(1).max(1);
        let scaled = self.factor.saturating_mul(1u32.checked_shl(n - 1).unwrap_or(u32::MAX));
        scaled.min(self.backoff_max)
    }

    /// Whether `attempt` (1-indexed) is still within `max_retry`.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let p = BackoffPolicy {
            max_retry: 5,
            factor: Duration::from_millis(100),
            backoff_max: Duration::from_millis(350),
        };
        assert_eq!(p.delay_before(2), Duration::from_millis(100));
        assert_eq!(p.delay_before(3), Duration::from_millis(200));
        assert_eq!(p.delay_before(4), Duration::from_millis(350));
        assert_eq!(p.delay_before(5), Duration::from_millis(350));
    }

    #[test]
    fn test_should_retry() {
        let p = BackoffPolicy {
            max_retry: 3,
            ..Default::default()
        };
        assert!(p.should_retry(1));
        assert!(p.should_retry(2));
        assert!(!p.should_retry(3));
    }
}
