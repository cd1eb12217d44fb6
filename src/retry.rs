//! Retry policy for transient control plane faults.

use std::time::Duration;

use rand::Rng;

use crate::config::Config;

/// A bounded exponential backoff policy.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// The number of retries permitted after the first failed attempt.
    pub max_retries: u32,
    /// The delay before the first retry.
    pub base_delay: Duration,
    /// The factor by which the delay grows on each subsequent retry.
    pub multiplier: f64,
    /// The upper bound of any single delay, before jitter.
    pub max_delay: Duration,
    /// The fraction by which a delay may be randomly stretched, in `[0, 1)`.
    pub jitter: f64,
}

impl RetryPolicy {
    /// Build a policy from the runtime config.
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.max_transient_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            multiplier: config.retry_backoff_multiplier.max(1.0),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            jitter: config.retry_jitter.clamp(0.0, 0.99),
        }
    }

    /// Check if the given retry attempt (0-indexed) is within budget.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// The delay to observe before the given retry attempt (0-indexed), without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let delay = self.base_delay.as_secs_f64() * exp;
        let max = self.max_delay.as_secs_f64();
        if !delay.is_finite() || delay >= max {
            self.max_delay
        } else {
            Duration::from_secs_f64(delay)
        }
    }

    /// The delay to observe before the given retry attempt (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let stretch = rand::thread_rng().gen_range(1.0..(1.0 + self.jitter));
        delay.mul_f64(stretch)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}
