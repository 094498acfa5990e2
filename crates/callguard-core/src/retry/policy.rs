//! Exponential and linear backoff.

use super::strategy::BackoffStrategy;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// `base * 2^attempt`
    #[default]
    Exponential,
    /// `base * (attempt + 1)`
    Linear,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exponential => f.write_str("exponential"),
            Self::Linear => f.write_str("linear"),
        }
    }
}

impl FromStr for Strategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            other => Err(ConfigError::invalid(format!(
                "unknown backoff strategy '{other}', expected 'exponential' or 'linear'"
            ))),
        }
    }
}

/// Backoff policy with an attempt budget.
///
/// Delays are deterministic (no jitter) so that the schedule an operation follows
/// can be predicted from its configuration alone.
///
/// # Formula
///
/// For a failed attempt `n` (0-indexed):
/// ```text
/// exponential: delay = base * 2^n
/// linear:      delay = base * (n + 1)
/// final_delay = min(delay, max_delay)     // only when max_delay is set
/// ```
///
/// With the default `base` of one second this gives `1s, 2s, 4s, ...` and
/// `1s, 2s, 3s, ...` respectively.
///
/// # Examples
///
/// ```rust
/// use callguard_core::retry::{BackoffPolicy, BackoffStrategy};
/// use std::time::Duration;
///
/// let policy = BackoffPolicy::default();
/// assert_eq!(policy.max_attempts(), 3);
/// assert_eq!(policy.delay_for(0), Duration::from_secs(1));
/// assert_eq!(policy.delay_for(1), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    max_attempts: u32,
    strategy: Strategy,
    base_delay: Duration,
    max_delay: Option<Duration>,
}

impl BackoffPolicy {
    /// Create a new builder for configuring a backoff policy.
    pub fn builder() -> BackoffPolicyBuilder {
        BackoffPolicyBuilder::default()
    }

    /// Policy with the given budget and strategy and a one second base.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConfig`] if `max_attempts` is zero.
    pub fn new(max_attempts: u32, strategy: Strategy) -> Result<Self, ConfigError> {
        Self::builder()
            .max_attempts(max_attempts)
            .strategy(strategy)
            .build()
    }

    /// The growth strategy.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// The unit delay the strategy scales.
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Upper bound applied to every delay, if any.
    pub fn max_delay(&self) -> Option<Duration> {
        self.max_delay
    }

    fn raw_delay(&self, attempt: u32) -> Duration {
        let factor = match self.strategy {
            Strategy::Exponential => 1u32.checked_shl(attempt),
            Strategy::Linear => attempt.checked_add(1),
        };

        factor
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }
}

impl Default for BackoffPolicy {
    /// Defaults:
    /// - `max_attempts`: 3
    /// - `strategy`: exponential
    /// - `base_delay`: 1s
    /// - `max_delay`: none
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: Strategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: None,
        }
    }
}

impl BackoffStrategy for BackoffPolicy {
    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.raw_delay(attempt);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

/// Builder for configuring [`BackoffPolicy`].
///
/// # Examples
///
/// ```rust
/// use callguard_core::retry::{BackoffPolicy, Strategy};
/// use std::time::Duration;
///
/// let policy = BackoffPolicy::builder()
///     .max_attempts(5)
///     .strategy(Strategy::Exponential)
///     .base_delay(Duration::from_millis(100))
///     .max_delay(Duration::from_secs(5))
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Default, Clone)]
pub struct BackoffPolicyBuilder {
    max_attempts: Option<u32>,
    strategy: Option<Strategy>,
    base_delay: Option<Duration>,
    max_delay: Option<Duration>,
}

impl BackoffPolicyBuilder {
    /// Set the total number of attempts, counting the first one.
    ///
    /// Default: 3
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the growth strategy.
    ///
    /// Default: exponential
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Set the unit delay the strategy scales.
    ///
    /// Default: 1s
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = Some(delay);
        self
    }

    /// Cap every delay at `delay`.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Build the [`BackoffPolicy`], using defaults for unset parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConfig`] if `max_attempts` is zero.
    pub fn build(self) -> Result<BackoffPolicy, ConfigError> {
        let defaults = BackoffPolicy::default();
        let max_attempts = self.max_attempts.unwrap_or(defaults.max_attempts);
        if max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts must be at least 1"));
        }

        Ok(BackoffPolicy {
            max_attempts,
            strategy: self.strategy.unwrap_or(defaults.strategy),
            base_delay: self.base_delay.unwrap_or(defaults.base_delay),
            max_delay: self.max_delay,
        })
    }
}
