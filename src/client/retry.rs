use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Bounded exponential backoff for custodian calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    #[serde(rename = "base_delay_ms", with = "crate::config::duration_ms")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "crate::config::duration_ms")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// `base_delay * 2^attempt`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before retry number `attempt + 1`.
    ///
    /// Adds up to 10% jitter and honours an upstream `Retry-After` hint,
    /// never exceeding `max_delay`.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let base = self.backoff(attempt);
        let jitter_cap = base.as_millis() as u64 / 10;
        let jitter = if jitter_cap > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap))
        } else {
            Duration::ZERO
        };
        let delay = base + jitter;
        let delay = match retry_after {
            Some(hint) => delay.max(hint),
            None => delay,
        };
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_millis(1000));
        assert_eq!(policy.backoff(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_delay_jitter_bounds() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        };
        for _ in 0..50 {
            let d = policy.delay_for(1, None);
            assert!(d >= Duration::from_millis(200));
            assert!(d <= Duration::from_millis(220));
        }
    }

    #[test]
    fn test_retry_after_respected_but_capped() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        };
        let d = policy.delay_for(0, Some(Duration::from_secs(1)));
        assert_eq!(d, Duration::from_secs(1));
        let d = policy.delay_for(0, Some(Duration::from_secs(30)));
        assert_eq!(d, Duration::from_secs(2));
    }
}
