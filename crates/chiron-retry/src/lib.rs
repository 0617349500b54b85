//! Backoff schedules for transient external tool failures.
//!
//! The tool adapter retries only network-class failures, on a fixed
//! exponential schedule (1 s, 4 s, 16 s) with jitter. This crate holds
//! the schedule math so the adapter and its tests agree on it.
//!
//! # Example
//!
//! ```
//! use chiron_retry::{BackoffConfig, delay_for_attempt};
//! use std::time::Duration;
//!
//! let config = BackoffConfig::tool_transient().without_jitter();
//! assert_eq!(delay_for_attempt(&config, 1), Duration::from_secs(1));
//! assert_eq!(delay_for_attempt(&config, 2), Duration::from_secs(4));
//! assert_eq!(delay_for_attempt(&config, 3), Duration::from_secs(16));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Strategy for computing the delay before a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// No delay between attempts.
    Immediate,
    /// Delay multiplied by `factor` each attempt (default).
    #[default]
    Exponential,
    /// Same delay every attempt.
    Constant,
}

/// Configuration for a retry schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default)]
    pub strategy: BackoffStrategy,
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
    /// Multiplier applied per attempt under the exponential strategy.
    #[serde(default = "default_factor")]
    pub factor: u32,
    /// Cap applied after strategy math.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    /// Jitter factor: 0.25 means the delay is scaled by 0.75..1.25.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_factor() -> u32 {
    4
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_jitter() -> f64 {
    0.25
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::tool_transient()
    }
}

impl BackoffConfig {
    /// The schedule the tool adapter applies to `tool_transient`
    /// failures: three attempts at 1 s, 4 s, 16 s plus jitter.
    pub fn tool_transient() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            factor: 4,
            max_delay: Duration::from_secs(60),
            jitter: 0.25,
        }
    }

    /// Single attempt, no waiting. Used for tags that must never retry.
    pub fn no_retry() -> Self {
        Self {
            strategy: BackoffStrategy::Immediate,
            max_attempts: 1,
            base_delay: Duration::ZERO,
            factor: 1,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Copy with jitter disabled; schedules become exactly reproducible.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }
}

/// Delay before retry number `attempt` (1-indexed: attempt 1 is the
/// wait after the first failure).
pub fn delay_for_attempt(config: &BackoffConfig, attempt: u32) -> Duration {
    let raw = match config.strategy {
        BackoffStrategy::Immediate => Duration::ZERO,
        BackoffStrategy::Constant => config.base_delay,
        BackoffStrategy::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config
                .base_delay
                .saturating_mul(config.factor.saturating_pow(pow))
        }
    };

    let capped = raw.min(config.max_delay);
    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

/// Scale a delay by a random factor in `1 - jitter .. 1 + jitter`.
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    let random_value: f64 = rng.r#gen();
    let factor = 1.0 - jitter + random_value * 2.0 * jitter;
    let millis = (delay.as_millis() as f64 * factor).round() as u64;
    Duration::from_millis(millis)
}

/// Run `operation` under the schedule. The closure receives the attempt
/// number (1-indexed) and returns `Ok` to stop, or `Err(retryable)`;
/// non-retryable errors stop immediately.
pub fn run_with_backoff<T, E, F>(config: &BackoffConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Result<T, RetryDecision<E>>,
{
    let mut attempt = 1;
    loop {
        match operation(attempt) {
            Ok(value) => return Ok(value),
            Err(RetryDecision::Stop(err)) => return Err(err),
            Err(RetryDecision::Retry(err)) => {
                if attempt >= config.max_attempts {
                    return Err(err);
                }
                std::thread::sleep(delay_for_attempt(config, attempt));
                attempt += 1;
            }
        }
    }
}

/// Whether a failed attempt should be retried.
#[derive(Debug)]
pub enum RetryDecision<E> {
    Retry(E),
    Stop(E),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_transient_schedule_is_1_4_16() {
        let config = BackoffConfig::tool_transient().without_jitter();
        assert_eq!(delay_for_attempt(&config, 1), Duration::from_secs(1));
        assert_eq!(delay_for_attempt(&config, 2), Duration::from_secs(4));
        assert_eq!(delay_for_attempt(&config, 3), Duration::from_secs(16));
    }

    #[test]
    fn delays_are_capped() {
        let config = BackoffConfig {
            max_delay: Duration::from_secs(5),
            ..BackoffConfig::tool_transient().without_jitter()
        };
        assert_eq!(delay_for_attempt(&config, 3), Duration::from_secs(5));
    }

    #[test]
    fn no_retry_never_waits() {
        let config = BackoffConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
        assert_eq!(delay_for_attempt(&config, 1), Duration::ZERO);
    }

    #[test]
    fn jitter_stays_within_band() {
        let config = BackoffConfig {
            jitter: 0.25,
            ..BackoffConfig::tool_transient()
        };
        for _ in 0..50 {
            let d = delay_for_attempt(&config, 2);
            assert!(d >= Duration::from_millis(3000), "delay {d:?} below band");
            assert!(d <= Duration::from_millis(5000), "delay {d:?} above band");
        }
    }

    #[test]
    fn run_with_backoff_stops_on_permanent() {
        let config = BackoffConfig::tool_transient().without_jitter();
        let mut calls = 0;
        let result: Result<(), &str> = run_with_backoff(&config, |_| {
            calls += 1;
            Err(RetryDecision::Stop("permanent"))
        });
        assert_eq!(result, Err("permanent"));
        assert_eq!(calls, 1);
    }

    #[test]
    fn run_with_backoff_exhausts_attempts() {
        let config = BackoffConfig {
            base_delay: Duration::from_millis(1),
            ..BackoffConfig::tool_transient().without_jitter()
        };
        let mut calls = 0;
        let result: Result<(), &str> = run_with_backoff(&config, |_| {
            calls += 1;
            Err(RetryDecision::Retry("transient"))
        });
        assert_eq!(result, Err("transient"));
        assert_eq!(calls, 3);
    }

    #[test]
    fn run_with_backoff_succeeds_midway() {
        let config = BackoffConfig {
            base_delay: Duration::from_millis(1),
            ..BackoffConfig::tool_transient().without_jitter()
        };
        let result: Result<u32, &str> = run_with_backoff(&config, |attempt| {
            if attempt < 2 {
                Err(RetryDecision::Retry("transient"))
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result, Ok(2));
    }

    #[test]
    fn config_serde_roundtrip() {
        let config = BackoffConfig::tool_transient();
        let json = serde_json::to_string(&config).expect("serialize");
        let back: BackoffConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.max_attempts, config.max_attempts);
        assert_eq!(back.base_delay, config.base_delay);
        assert_eq!(back.factor, config.factor);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn delay_never_exceeds_cap(attempt in 1u32..20, cap_ms in 1u64..120_000) {
                let config = BackoffConfig {
                    max_delay: Duration::from_millis(cap_ms),
                    ..BackoffConfig::tool_transient().without_jitter()
                };
                prop_assert!(delay_for_attempt(&config, attempt) <= config.max_delay);
            }

            #[test]
            fn exponential_is_monotone_before_cap(attempt in 1u32..6) {
                let config = BackoffConfig {
                    max_delay: Duration::from_secs(100_000),
                    ..BackoffConfig::tool_transient().without_jitter()
                };
                let a = delay_for_attempt(&config, attempt);
                let b = delay_for_attempt(&config, attempt + 1);
                prop_assert!(b >= a);
            }
        }
    }
}
