use std::time::Duration;

use crate::infrastructure::config::ConnectionConfig;

/// Reconnect delay policy
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub exponential: bool,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_delay_ms),
            exponential: config.exponential_backoff,
            multiplier: config.backoff_multiplier,
            max_delay: Duration::from_millis(config.max_retry_delay_ms),
        }
    }

    /// Delay before retry number `attempt` (zero-based), capped at `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = if self.exponential {
            let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
            let millis = self.base_delay.as_millis() as f64 * factor;
            if millis.is_finite() && millis < self.max_delay.as_millis() as f64 {
                Duration::from_millis(millis as u64)
            } else {
                self.max_delay
            }
        } else {
            self.base_delay
        };
        delay.min(self.max_delay)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ConnectionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(exponential: bool) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            exponential,
            multiplier: 2.0,
            max_delay: Duration::from_millis(30_000),
        }
    }

    #[test]
    fn test_exponential_delays() {
        let policy = policy(true);
        let delays: Vec<_> = (0..3).map(|a| policy.delay_for(a).as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000]);
    }

    #[test]
    fn test_delay_is_capped() {
        let mut policy = policy(true);
        policy.max_delay = Duration::from_millis(3000);
        assert_eq!(policy.delay_for(2), Duration::from_millis(3000));
        assert_eq!(policy.delay_for(500), Duration::from_millis(3000));
    }

    #[test]
    fn test_flat_delay() {
        let policy = policy(false);
        assert_eq!(policy.delay_for(0), policy.delay_for(5));
    }

    #[test]
    fn test_exhausted() {
        let policy = policy(true);
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));
    }
}
