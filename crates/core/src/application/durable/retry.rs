// Reconnect backoff for the durable queue
use crate::application::worker::constants::{
    DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_BASE_DELAY, DEFAULT_RECONNECT_MAX_DELAY,
};
use rand::Rng;
use std::time::Duration;

/// Retry decision result
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reconnect and try again after this delay
    Retry(Duration),
    /// Give up, the broker stayed unreachable
    Failed,
}

/// Backoff policy applied between reconnect attempts
///
/// Determines whether a put or ack should try again based on:
/// - How many network failures it has seen so far
/// - Maximum attempts allowed (`None` = keep trying until shutdown)
/// - Exponential delay growth, capped at `max_delay`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_RECONNECT_BASE_DELAY,
            max_delay: DEFAULT_RECONNECT_MAX_DELAY,
            max_attempts: Some(DEFAULT_MAX_RECONNECT_ATTEMPTS),
        }
    }
}

impl ReconnectPolicy {
    /// Decide what to do after the `failures`-th consecutive network failure
    ///
    /// Backoff formula:
    /// delay = min(base_delay * 2 ^ (failures - 1), max_delay) * (1.0 ± 0.1)
    pub fn should_retry(&self, failures: u32) -> RetryDecision {
        if let Some(max_attempts) = self.max_attempts {
            if failures >= max_attempts {
                return RetryDecision::Failed;
            }
        }
        RetryDecision::Retry(self.delay_for(failures.saturating_sub(1)))
    }

    /// Jittered delay for the given zero-based attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let raw = self.base_delay.saturating_mul(factor).min(self.max_delay);

        // Apply ±10% jitter to prevent reconnect stampedes
        let jitter = rand::thread_rng().gen_range(0.9..=1.1);
        raw.mul_f64(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: Option<u32>) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_attempts,
        }
    }

    fn assert_near(actual: Duration, expected_ms: u64) {
        let low = Duration::from_millis(expected_ms * 9 / 10);
        let high = Duration::from_millis(expected_ms * 11 / 10 + 1);
        assert!(
            actual >= low && actual <= high,
            "{actual:?} not within 10% of {expected_ms}ms"
        );
    }

    #[test]
    fn test_delay_grows_exponentially_and_caps() {
        let policy = policy(None);
        assert_near(policy.delay_for(0), 100);
        assert_near(policy.delay_for(1), 200);
        assert_near(policy.delay_for(3), 800);
        assert_near(policy.delay_for(4), 1_000);
        assert_near(policy.delay_for(40), 1_000);
    }

    #[test]
    fn test_should_retry_respects_max_attempts() {
        let policy = policy(Some(3));
        assert!(matches!(policy.should_retry(1), RetryDecision::Retry(_)));
        assert!(matches!(policy.should_retry(2), RetryDecision::Retry(_)));
        assert_eq!(policy.should_retry(3), RetryDecision::Failed);
    }

    #[test]
    fn test_unbounded_policy_never_gives_up() {
        let policy = policy(None);
        assert!(matches!(policy.should_retry(10_000), RetryDecision::Retry(_)));
    }
}
