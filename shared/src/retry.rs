//! Exponential backoff with jitter.
//!
//! A [`RetryPolicy`] is the retry bookkeeping for one operation: it counts
//! failed attempts and turns that count into the next delay. The count only
//! moves forward until [`RetryPolicy::reset`].

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::error::{CommitError, ConfigError};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_ratio: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be > 0".into()));
        }
        if self.base_delay_ms == 0 {
            return Err(ConfigError::Invalid("base_delay_ms must be > 0".into()));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::Invalid(
                "max_delay_ms must be >= base_delay_ms".into(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::Invalid("multiplier must be >= 1.0".into()));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(ConfigError::Invalid(
                "jitter_ratio must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }

    /// Delay for `attempts` failed attempts, before jitter.
    pub fn base_delay_for(&self, attempts: u32) -> u64 {
        if attempts == 0 {
            return self.base_delay_ms.min(self.max_delay_ms);
        }
        let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        if !raw.is_finite() || raw >= self.max_delay_ms as f64 {
            self.max_delay_ms
        } else {
            raw as u64
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    attempts: u32,
    config: RetryConfig,
    rng: StdRng,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            attempts: 0,
            config,
            rng: StdRng::from_entropy(),
        }
    }

    /// Policy with a seeded jitter source, for reproducible delays.
    pub fn with_rng(config: RetryConfig, seed: u64) -> Self {
        Self {
            attempts: 0,
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.config.max_attempts
    }

    /// Next delay in milliseconds.
    ///
    /// `min(base * multiplier^attempts, max)` shifted by up to
    /// `± delay * jitter_ratio`, never negative.
    pub fn get_delay(&mut self) -> u64 {
        let delay = self.config.base_delay_for(self.attempts);
        if self.config.jitter_ratio <= 0.0 {
            return delay;
        }
        let band = delay as f64 * self.config.jitter_ratio;
        let offset = band * self.rng.gen_range(-1.0..=1.0);
        (delay as f64 + offset).max(0.0).round() as u64
    }

    pub fn record_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for CommitError {
    fn is_retryable(&self) -> bool {
        CommitError::is_retryable(self)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of attempts, sleeping the policy's delay in between.
///
/// `op` receives the number of failed attempts so far.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: &mut RetryPolicy, mut op: F) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    loop {
        match op(policy.attempts()).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let delay = policy.get_delay();
                policy.record_attempt();
                if !err.is_retryable() || !policy.can_retry() {
                    return Err(err);
                }
                debug!(
                    attempts = policy.attempts(),
                    delay_ms = delay,
                    error = %err,
                    "attempt failed, backing off"
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            max_attempts: 10,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter_ratio: 0.0,
        }
    }

    #[test]
    fn backoff_sequence_without_jitter() {
        let mut policy = RetryPolicy::new(no_jitter());
        let mut delays = Vec::new();
        for _ in 0..6 {
            delays.push(policy.get_delay());
            policy.record_attempt();
        }
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 10_000, 10_000]);
    }

    #[test]
    fn first_delay_is_exactly_base() {
        let mut policy = RetryPolicy::new(RetryConfig {
            multiplier: 7.5,
            ..no_jitter()
        });
        assert_eq!(policy.get_delay(), 1_000);
    }

    #[test]
    fn can_retry_until_max_attempts() {
        let mut policy = RetryPolicy::new(RetryConfig {
            max_attempts: 2,
            ..no_jitter()
        });
        assert!(policy.can_retry());
        policy.record_attempt();
        assert!(policy.can_retry());
        policy.record_attempt();
        assert!(!policy.can_retry());
        policy.reset();
        assert_eq!(policy.attempts(), 0);
        assert!(policy.can_retry());
    }

    #[test]
    fn seeded_jitter_is_reproducible() {
        let config = RetryConfig::default();
        let mut a = RetryPolicy::with_rng(config.clone(), 42);
        let mut b = RetryPolicy::with_rng(config, 42);
        for _ in 0..5 {
            assert_eq!(a.get_delay(), b.get_delay());
            a.record_attempt();
            b.record_attempt();
        }
    }

    #[test]
    fn config_validation() {
        assert!(RetryConfig::default().validate().is_ok());
        assert!(RetryConfig { max_attempts: 0, ..RetryConfig::default() }.validate().is_err());
        assert!(RetryConfig { multiplier: 0.5, ..RetryConfig::default() }.validate().is_err());
        assert!(RetryConfig { jitter_ratio: 1.5, ..RetryConfig::default() }.validate().is_err());
        assert!(RetryConfig { max_delay_ms: 10, ..RetryConfig::default() }.validate().is_err());
    }

    proptest! {
        #[test]
        fn delay_stays_within_jitter_band(
            base in 1u64..5_000,
            extra in 0u64..100_000,
            multiplier in 1.0f64..4.0,
            jitter in 0.0f64..=1.0,
            attempts in 0u32..64,
            seed in any::<u64>(),
        ) {
            let config = RetryConfig {
                max_attempts: 100,
                base_delay_ms: base,
                max_delay_ms: base + extra,
                multiplier,
                jitter_ratio: jitter,
            };
            let mut policy = RetryPolicy::with_rng(config.clone(), seed);
            for _ in 0..attempts {
                policy.record_attempt();
            }
            let expected = config.base_delay_for(attempts) as f64;
            let delay = policy.get_delay() as f64;
            let band = expected * jitter;
            prop_assert!(delay <= config.max_delay_ms as f64 + band + 1.0);
            prop_assert!(delay + 1.0 >= expected - band);
        }

        #[test]
        fn expected_delay_is_non_decreasing(
            base in 1u64..5_000,
            extra in 0u64..100_000,
            multiplier in 1.0f64..4.0,
            attempts in 0u32..64,
        ) {
            let config = RetryConfig {
                max_attempts: 100,
                base_delay_ms: base,
                max_delay_ms: base + extra,
                multiplier,
                jitter_ratio: 0.0,
            };
            prop_assert!(config.base_delay_for(attempts) <= config.base_delay_for(attempts + 1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_with_backoff_stops_on_success() {
        let calls = AtomicU32::new(0);
        let mut policy = RetryPolicy::new(no_jitter());
        let result: Result<u32, CommitError> = retry_with_backoff(&mut policy, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(CommitError::network("offline"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(policy.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_with_backoff_gives_up_on_conflict() {
        let calls = AtomicU32::new(0);
        let mut policy = RetryPolicy::new(no_jitter());
        let result: Result<(), CommitError> = retry_with_backoff(&mut policy, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CommitError::conflict("stale")) }
        })
        .await;
        assert!(matches!(result, Err(CommitError::Conflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_with_backoff_exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let mut policy = RetryPolicy::new(RetryConfig {
            max_attempts: 3,
            ..no_jitter()
        });
        let result: Result<(), CommitError> = retry_with_backoff(&mut policy, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CommitError::Timeout { after_ms: 10 }) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!policy.can_retry());
    }
}
