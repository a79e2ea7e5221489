use backoff::{backoff::Backoff, ExponentialBackoff};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff parameters shared by broker reconnects and outbox flushes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "RetryPolicy::default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    #[serde(default = "RetryPolicy::default_max_interval_ms")]
    pub max_interval_ms: u64,

    /// Jitter in [0.0, 1.0]; 0.2 means ±20%
    #[serde(default = "RetryPolicy::default_randomization_factor")]
    pub randomization_factor: f64,

    #[serde(default = "RetryPolicy::default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: Self::default_initial_interval_ms(),
            max_interval_ms: Self::default_max_interval_ms(),
            randomization_factor: Self::default_randomization_factor(),
            multiplier: Self::default_multiplier(),
        }
    }
}

impl RetryPolicy {
    fn default_initial_interval_ms() -> u64 {
        1_000
    }

    fn default_max_interval_ms() -> u64 {
        30_000
    }

    fn default_randomization_factor() -> f64 {
        0.2
    }

    fn default_multiplier() -> f64 {
        2.0
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms.max(self.initial_interval_ms))
    }
}

/// Builds a backoff that never gives up; callers decide when to stop retrying.
pub fn build_exponential_backoff(policy: &RetryPolicy) -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(policy.initial_interval_ms.max(1)),
        current_interval: Duration::from_millis(policy.initial_interval_ms.max(1)),
        max_interval: policy.max_interval(),
        randomization_factor: policy.randomization_factor.clamp(0.0, 1.0),
        multiplier: policy.multiplier.max(1.0),
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// Next delay from `backoff`, falling back to the policy cap if it ever runs dry.
pub fn next_delay(backoff: &mut ExponentialBackoff, policy: &RetryPolicy) -> Duration {
    backoff.next_backoff().unwrap_or_else(|| policy.max_interval())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_policy() -> RetryPolicy {
        RetryPolicy {
            initial_interval_ms: 100,
            max_interval_ms: 400,
            randomization_factor: 0.0,
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_delays_grow_and_cap() {
        let policy = fixed_policy();
        let mut bo = build_exponential_backoff(&policy);

        assert_eq!(next_delay(&mut bo, &policy), Duration::from_millis(100));
        assert_eq!(next_delay(&mut bo, &policy), Duration::from_millis(200));
        assert_eq!(next_delay(&mut bo, &policy), Duration::from_millis(400));
        assert_eq!(next_delay(&mut bo, &policy), Duration::from_millis(400));
    }

    #[test]
    fn test_reset_starts_over() {
        let policy = fixed_policy();
        let mut bo = build_exponential_backoff(&policy);
        next_delay(&mut bo, &policy);
        next_delay(&mut bo, &policy);
        bo.reset();
        assert_eq!(next_delay(&mut bo, &policy), Duration::from_millis(100));
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let policy: RetryPolicy = toml::from_str("").unwrap();
        assert_eq!(policy, RetryPolicy::default());
    }
}
