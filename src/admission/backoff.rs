//! Retry delay policy

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with bounded random jitter
///
/// The base delay before retry `attempt` (0-based) is `multiplier^attempt`
/// seconds, capped at `max_delay`. Jitter is drawn uniformly from
/// `[0, max_jitter)`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    multiplier: f64,
    max_jitter: Duration,
    max_delay: Duration,
}

impl BackoffPolicy {
    pub fn new(multiplier: f64, max_jitter: Duration, max_delay: Duration) -> Self {
        Self {
            multiplier: multiplier.max(1.0),
            max_jitter,
            max_delay,
        }
    }

    /// Delay before retry `attempt`, without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let secs = self.multiplier.powi(attempt as i32);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Delay before retry `attempt`, jitter included
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay(attempt) + self.jitter()
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(2.0, Duration::from_millis(1000), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_delay_grows_exponentially() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.base_delay(0), Duration::from_secs(1));
        assert_eq!(policy.base_delay(1), Duration::from_secs(2));
        assert_eq!(policy.base_delay(2), Duration::from_secs(4));
        assert_eq!(policy.base_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn test_base_delay_is_capped() {
        let policy = BackoffPolicy::new(2.0, Duration::ZERO, Duration::from_secs(5));
        assert_eq!(policy.base_delay(10), Duration::from_secs(5));
        assert_eq!(policy.base_delay(5000), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let policy = BackoffPolicy::new(2.0, Duration::from_millis(250), Duration::from_secs(30));
        for _ in 0..200 {
            let delay = policy.delay(1);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay < Duration::from_millis(2250));
        }
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let policy = BackoffPolicy::new(3.0, Duration::ZERO, Duration::from_secs(60));
        assert_eq!(policy.delay(2), Duration::from_secs(9));
    }
}
