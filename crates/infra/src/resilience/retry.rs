//! Bounded, jittered retry for transient upstream faults.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use bulwark_core::UpstreamError;

/// `min(base · 2^exponent, cap)`, saturating instead of overflowing.
///
/// Shared by the in-call retry loop and the job queue's retry scheduling.
pub fn exponential_backoff(base: Duration, cap: Duration, exponent: u32) -> Duration {
    let factor = 1u32.checked_shl(exponent.min(31)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

/// Retry policy for a single guarded call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = call once).
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0) applied symmetrically around the computed delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Call exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Exponential policy without jitter (deterministic delays).
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `retry` (1-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let delay = exponential_backoff(self.base_delay, self.max_delay, retry - 1);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-jitter..=jitter);
        delay.mul_f64(1.0 + spread).min(self.max_delay)
    }

    /// Whether another attempt should follow a failure after `retries_done` retries.
    pub fn should_retry(&self, retries_done: u32, error: &UpstreamError) -> bool {
        error.is_retryable() && retries_done < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(300);
        assert_eq!(exponential_backoff(base, cap, 0), Duration::from_secs(1));
        assert_eq!(exponential_backoff(base, cap, 1), Duration::from_secs(2));
        assert_eq!(exponential_backoff(base, cap, 3), Duration::from_secs(8));
        assert_eq!(exponential_backoff(base, cap, 9), Duration::from_secs(300));
        assert_eq!(exponential_backoff(base, cap, 64), Duration::from_secs(300));
    }

    #[test]
    fn unjittered_policy_is_deterministic() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(100), Duration::from_secs(10));
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(400));
    }

    #[test]
    fn permanent_errors_are_never_retried() {
        let policy = RetryPolicy::default();
        assert!(!policy.should_retry(0, &UpstreamError::not_found("gone")));
        assert!(!policy.should_retry(0, &UpstreamError::auth("nope")));
        assert!(policy.should_retry(0, &UpstreamError::network("reset")));
        assert!(!policy.should_retry(2, &UpstreamError::network("reset")));
    }

    proptest! {
        /// Backoff is monotone in the exponent and never exceeds the cap.
        #[test]
        fn backoff_is_monotone_and_capped(base_ms in 1u64..5_000, cap_ms in 1u64..600_000, exp in 0u32..40) {
            let base = Duration::from_millis(base_ms);
            let cap = Duration::from_millis(cap_ms);
            let d = exponential_backoff(base, cap, exp);
            prop_assert!(d <= cap);
            prop_assert!(d <= exponential_backoff(base, cap, exp + 1));
        }

        /// Jitter keeps delays within the configured spread and below the cap.
        #[test]
        fn jittered_delay_stays_in_bounds(retry in 1u32..8) {
            let policy = RetryPolicy {
                max_retries: 8,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(5),
                jitter: 0.2,
            };
            let nominal = exponential_backoff(policy.base_delay, policy.max_delay, retry - 1);
            let d = policy.delay_for_retry(retry);
            prop_assert!(d <= policy.max_delay);
            prop_assert!(d >= nominal.mul_f64(0.79));
        }
    }
}
