use crate::config::SynqConfig;
use std::time::Duration;

/// Capped exponential backoff. Delivery is retried indefinitely; the
/// policy bounds the interval between attempts, never their count.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    initial: Duration,
    max: Duration,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    pub fn from_config(config: &SynqConfig) -> Self {
        Self::new(config.retry_initial_backoff, config.retry_max_backoff)
    }

    /// Delay before dispatch attempt `attempts + 1`, given `attempts`
    /// failures so far: initial * 2^(attempts-1), capped.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        if attempts <= 1 {
            return self.initial.min(self.max);
        }
        let mut delay = self.initial;
        for _ in 1..attempts {
            delay = delay.saturating_mul(2);
            if delay >= self.max {
                return self.max;
            }
        }
        delay.min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::BackoffPolicy;
    use std::time::Duration;

    #[test]
    fn doubles_until_the_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_secs(1));
        assert_eq!(policy.delay_for(50), Duration::from_secs(1));
    }

    #[test]
    fn zero_attempts_uses_initial_interval() {
        let policy = BackoffPolicy::new(Duration::from_millis(50), Duration::from_secs(1));
        assert_eq!(policy.delay_for(0), Duration::from_millis(50));
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(300));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(300));
    }
}
