//! Bounded exponential backoff

use std::time::Duration;

use crate::config::JobsSection;

/// How often and how patiently upstream failures are retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(jobs: &JobsSection) -> Self {
        Self {
            max_retries: jobs.max_retries,
            base: Duration::from_millis(jobs.backoff_base_ms),
            max: Duration::from_millis(jobs.backoff_max_ms),
        }
    }

    /// Retry immediately; for tests
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    /// Whether a failed attempt (1-based) may be followed by another
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    /// Wait before the attempt following `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_then_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base: Duration::from_secs(1),
            max: Duration::from_secs(5),
        };
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(4), Duration::from_secs(5));
        assert_eq!(policy.delay(40), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(3));
        assert!(!policy.allows_retry(4));
        assert!(!RetryPolicy::immediate(0).allows_retry(1));
    }

    #[test]
    fn test_from_settings() {
        let policy = RetryPolicy::from_settings(&JobsSection::default());
        assert_eq!(policy, RetryPolicy::default());
    }
}
