//! Bounded exponential backoff between polls.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Jitter applied to each backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter.
    #[default]
    None,
    /// Random from 0 to delay.
    Full,
    /// Half fixed, half random.
    Equal,
}

fn default_initial_ms() -> u64 {
    1000
}

fn default_max_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

/// Backoff curve: `initial * multiplier^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the second poll, in milliseconds.
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    /// Delay cap in milliseconds.
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    /// Growth factor per attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: JitterStrategy,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
            multiplier: default_multiplier(),
            jitter: JitterStrategy::default(),
        }
    }
}

impl BackoffConfig {
    /// Creates the default curve.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_ms(mut self, delay: u64) -> Self {
        self.initial_ms = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_ms(mut self, delay: u64) -> Self {
        self.max_ms = delay;
        self
    }

    /// Sets the growth factor.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// The un-jittered delay after `attempt` polls (0-indexed).
    #[must_use]
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.initial_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        if delay.is_finite() && delay < self.max_ms as f64 {
            delay as u64
        } else {
            self.max_ms
        }
    }

    /// The delay to wait after `attempt` polls, with jitter applied.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_ms(attempt);
        let jittered = match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };
        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_curve() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.delay(0), Duration::from_millis(1000));
        assert_eq!(backoff.delay(1), Duration::from_millis(2000));
        assert_eq!(backoff.delay(4), Duration::from_millis(16_000));
        assert_eq!(backoff.delay(5), Duration::from_millis(30_000));
        assert_eq!(backoff.delay(60), Duration::from_millis(30_000));
    }

    #[test]
    fn test_cap_holds_for_large_attempts() {
        let backoff = BackoffConfig::new().with_initial_ms(10).with_max_ms(50);
        assert_eq!(backoff.base_delay_ms(u32::MAX), 50);
    }

    #[test]
    fn test_multiplier_below_one_is_constant() {
        let backoff = BackoffConfig::new().with_multiplier(0.5);
        assert_eq!(backoff.base_delay_ms(3), 1000);
    }

    #[test]
    fn test_jitter_stays_within_delay() {
        let full = BackoffConfig::new().with_jitter(JitterStrategy::Full);
        let equal = BackoffConfig::new().with_jitter(JitterStrategy::Equal);
        for _ in 0..50 {
            assert!(full.delay(1) <= Duration::from_millis(2000));
            let d = equal.delay(1);
            assert!(d >= Duration::from_millis(1000) && d <= Duration::from_millis(2000));
        }
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let backoff: BackoffConfig = serde_json::from_str(r#"{"initial_ms": 5}"#).unwrap();
        assert_eq!(backoff.initial_ms, 5);
        assert_eq!(backoff.max_ms, 30_000);
        assert_eq!(backoff.jitter, JitterStrategy::None);
    }
}
