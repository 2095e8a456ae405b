//! Retry configuration and exponential backoff with proportional jitter.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{ResilienceError, Result};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Growth factor applied per attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound of the random jitter, as a fraction of the exponential delay.
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
    /// Optional hard cap on any single delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter_fraction() -> f64 {
    0.1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_fraction: default_jitter_fraction(),
            max_delay_ms: None,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A config that never retries.
    #[must_use]
    pub fn single_attempt() -> Self {
        Self::default().with_max_attempts(1)
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Sets the jitter fraction.
    #[must_use]
    pub fn with_jitter_fraction(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction;
        self
    }

    /// Caps each delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = Some(delay);
        self
    }

    /// Base delay as a [`Duration`].
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Checks the range invariants.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(ResilienceError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ResilienceError::Config(format!(
                "backoff_multiplier must be >= 1, got {}",
                self.backoff_multiplier
            )));
        }
        if !(0.0..1.0).contains(&self.jitter_fraction) {
            return Err(ResilienceError::Config(format!(
                "jitter_fraction must be in [0, 1), got {}",
                self.jitter_fraction
            )));
        }
        Ok(())
    }

    /// The backoff policy described by this config.
    #[must_use]
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay_ms: self.base_delay_ms,
            multiplier: self.backoff_multiplier,
            jitter_fraction: self.jitter_fraction,
            max_delay_ms: self.max_delay_ms,
        }
    }
}

/// Computes the wait before a retry.
///
/// `delay(n) = floor(base * multiplier^n + U[0, jitter_fraction * base * multiplier^n])`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    base_delay_ms: u64,
    multiplier: f64,
    jitter_fraction: f64,
    max_delay_ms: Option<u64>,
}

impl BackoffPolicy {
    /// The exponential delay for `attempt` without jitter, in milliseconds.
    #[must_use]
    pub fn nominal_delay_ms(&self, attempt: u32) -> f64 {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        if delay.is_finite() {
            delay
        } else {
            f64::MAX
        }
    }

    /// Computes the delay using the given random source.
    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exponential = self.nominal_delay_ms(attempt);
        let jitter_ceiling = exponential * self.jitter_fraction;
        let jitter = if jitter_ceiling > 0.0 && jitter_ceiling.is_finite() {
            rng.gen_range(0.0..=jitter_ceiling)
        } else {
            0.0
        };

        // `as` saturates at u64::MAX for out-of-range floats.
        let mut millis = (exponential + jitter).floor() as u64;
        if let Some(max) = self.max_delay_ms {
            millis = millis.min(max);
        }
        Duration::from_millis(millis)
    }

    /// Computes the delay using the thread-local RNG.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::thread_rng())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.base_delay_ms, 1000);
        assert!((config.backoff_multiplier - 2.0).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_config_builder() {
        let config = RetryConfig::new()
            .with_max_attempts(5)
            .with_base_delay_ms(500)
            .with_backoff_multiplier(3.0)
            .with_jitter_fraction(0.0);

        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_delay(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        assert!(RetryConfig::new().with_max_attempts(0).validate().is_err());
        assert!(RetryConfig::new().with_backoff_multiplier(0.5).validate().is_err());
        assert!(RetryConfig::new().with_jitter_fraction(1.0).validate().is_err());
        assert!(RetryConfig::new().with_jitter_fraction(-0.1).validate().is_err());
    }

    #[test]
    fn test_serde_defaults_fill_missing_fields() {
        let config: RetryConfig = serde_json::from_str(r#"{"max_attempts": 7}"#).unwrap();
        assert_eq!(config.max_attempts, 7);
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.max_delay_ms, None);
    }

    #[test]
    fn test_delay_without_jitter_is_exact() {
        let policy = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_jitter_fraction(0.0)
            .backoff();

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_within_jitter_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        for (base, multiplier, jitter) in [(100_u64, 2.0, 0.5), (250, 1.5, 0.2), (10, 3.0, 0.9)] {
            let policy = RetryConfig::new()
                .with_base_delay_ms(base)
                .with_backoff_multiplier(multiplier)
                .with_jitter_fraction(jitter)
                .backoff();

            for attempt in 0..8 {
                let nominal = policy.nominal_delay_ms(attempt);
                let delay = policy.delay_with_rng(attempt, &mut rng).as_millis() as f64;
                assert!(delay >= nominal.floor(), "attempt {attempt}: {delay} < {nominal}");
                assert!(delay <= nominal * (1.0 + jitter), "attempt {attempt}: {delay} too large");
            }
        }
    }

    #[test]
    fn test_zero_base_delay() {
        let policy = RetryConfig::new().with_base_delay_ms(0).backoff();
        assert_eq!(policy.delay(5), Duration::ZERO);
    }

    #[test]
    fn test_huge_attempt_saturates() {
        let policy = RetryConfig::new().with_jitter_fraction(0.0).backoff();
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryConfig::new()
            .with_base_delay_ms(1000)
            .with_max_delay_ms(5000)
            .backoff();
        assert_eq!(policy.delay(10), Duration::from_millis(5000));
    }
}
