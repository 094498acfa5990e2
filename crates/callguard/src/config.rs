//! Configuration for the resilience layer

use crate::limiter::{RateLimitMode, RateLimiter};
use crate::timeout::TimeoutGuard;
use callguard_core::ConfigError;
use callguard_core::retry::{BackoffPolicy, Strategy};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

/// Settings for a [`RequestExecutor`](crate::RequestExecutor).
///
/// Every field has a default, so partial documents deserialize:
///
/// ```rust
/// use callguard::ResilienceConfig;
///
/// let config: ResilienceConfig =
///     serde_json::from_str(r#"{"max_attempts": 5, "rate_limit": 10}"#).unwrap();
/// assert_eq!(config.max_attempts, 5);
/// assert_eq!(config.timeout_per_attempt_seconds, 30.0);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResilienceConfig {
    /// Total attempts per operation, counting the first (>= 1)
    pub max_attempts: u32,

    /// Delay growth between attempts
    pub backoff_strategy: Strategy,

    /// Deadline for each attempt, in seconds (> 0)
    pub timeout_per_attempt_seconds: f64,

    /// Limiter capacity; `None` disables rate limiting
    pub rate_limit: Option<u32>,

    /// Admission discipline when `rate_limit` is set
    pub rate_limit_mode: RateLimitMode,

    /// Token bucket refill window, in seconds (> 0)
    pub rate_limit_window_seconds: f64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_strategy: Strategy::Exponential,
            timeout_per_attempt_seconds: 30.0,
            rate_limit: None,
            rate_limit_mode: RateLimitMode::TokenBucket,
            rate_limit_window_seconds: 1.0,
        }
    }
}

impl ResilienceConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults. This will look for:
    /// - `CALLGUARD_MAX_ATTEMPTS`
    /// - `CALLGUARD_BACKOFF` (`exponential` or `linear`)
    /// - `CALLGUARD_TIMEOUT` (seconds per attempt)
    /// - `CALLGUARD_RATE_LIMIT` (capacity; empty or `none` disables)
    /// - `CALLGUARD_RATE_LIMIT_MODE` (`token_bucket` or `semaphore`)
    /// - `CALLGUARD_RATE_LIMIT_WINDOW` (seconds)
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConfig`] if a variable cannot be parsed or
    /// the resulting configuration is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(max_attempts) = env_var("CALLGUARD_MAX_ATTEMPTS")? {
            config.max_attempts = max_attempts;
        }
        if let Some(strategy) = env_var("CALLGUARD_BACKOFF")? {
            config.backoff_strategy = strategy;
        }
        if let Some(timeout) = env_var("CALLGUARD_TIMEOUT")? {
            config.timeout_per_attempt_seconds = timeout;
        }
        if let Some(raw) = env_var::<String>("CALLGUARD_RATE_LIMIT")? {
            let raw = raw.trim();
            config.rate_limit = if raw.is_empty() || raw.eq_ignore_ascii_case("none") {
                None
            } else {
                Some(parse_var("CALLGUARD_RATE_LIMIT", raw)?)
            };
        }
        if let Some(mode) = env_var("CALLGUARD_RATE_LIMIT_MODE")? {
            config.rate_limit_mode = mode;
        }
        if let Some(window) = env_var("CALLGUARD_RATE_LIMIT_WINDOW")? {
            config.rate_limit_window_seconds = window;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the backoff strategy.
    pub fn with_backoff_strategy(mut self, strategy: Strategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Set the per-attempt deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_per_attempt_seconds = timeout.as_secs_f64();
        self
    }

    /// Enable a token bucket of `capacity` admissions per `window`.
    pub fn with_token_bucket(mut self, capacity: u32, window: Duration) -> Self {
        self.rate_limit = Some(capacity);
        self.rate_limit_mode = RateLimitMode::TokenBucket;
        self.rate_limit_window_seconds = window.as_secs_f64();
        self
    }

    /// Enable a semaphore of `capacity` in-flight operations.
    pub fn with_semaphore(mut self, capacity: u32) -> Self {
        self.rate_limit = Some(capacity);
        self.rate_limit_mode = RateLimitMode::Semaphore;
        self
    }

    /// Check every setting without building anything shared.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::InvalidConfig`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backoff_policy()?;
        self.timeout_guard()?;
        self.rate_limiter()?;
        Ok(())
    }

    /// The configured backoff policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConfig`] if `max_attempts` is zero.
    pub fn backoff_policy(&self) -> Result<BackoffPolicy, ConfigError> {
        BackoffPolicy::new(self.max_attempts, self.backoff_strategy)
    }

    /// The configured per-attempt deadline.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConfig`] unless the timeout is a positive,
    /// finite number of seconds.
    pub fn timeout_guard(&self) -> Result<TimeoutGuard, ConfigError> {
        TimeoutGuard::from_secs_f64(self.timeout_per_attempt_seconds)
    }

    /// A fresh limiter, or `None` when rate limiting is disabled.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConfig`] for a zero capacity, or for a
    /// token bucket whose window is not a positive, finite number of seconds.
    pub fn rate_limiter(&self) -> Result<Option<RateLimiter>, ConfigError> {
        let Some(capacity) = self.rate_limit else {
            return Ok(None);
        };

        let window = match self.rate_limit_mode {
            RateLimitMode::TokenBucket => window_duration(self.rate_limit_window_seconds)?,
            RateLimitMode::Semaphore => Duration::ZERO,
        };
        RateLimiter::new(capacity, window, self.rate_limit_mode).map(Some)
    }
}

fn window_duration(seconds: f64) -> Result<Duration, ConfigError> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(ConfigError::invalid(format!(
            "rate limit window must be a positive number of seconds, got {seconds}"
        )));
    }
    Duration::try_from_secs_f64(seconds)
        .map_err(|e| ConfigError::invalid(format!("rate limit window {seconds}s: {e}")))
}

fn env_var<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(name) {
        Ok(value) => parse_var(name, &value).map(Some),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::invalid(format!("{name}: {e}"))),
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::invalid(format!("{name}={value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const VARS: [&str; 6] = [
        "CALLGUARD_MAX_ATTEMPTS",
        "CALLGUARD_BACKOFF",
        "CALLGUARD_TIMEOUT",
        "CALLGUARD_RATE_LIMIT",
        "CALLGUARD_RATE_LIMIT_MODE",
        "CALLGUARD_RATE_LIMIT_WINDOW",
    ];

    /// Run `f` with exactly `set` among the CALLGUARD_* variables defined.
    fn with_env<R>(set: &[(&str, &str)], f: impl FnOnce() -> R) -> R {
        let vars: Vec<(&str, Option<&str>)> = VARS
            .iter()
            .map(|name| {
                let value = set.iter().find(|(k, _)| k == name).map(|(_, v)| *v);
                (*name, value)
            })
            .collect();
        temp_env::with_vars(vars, f)
    }

    #[test]
    fn test_defaults() {
        let config = ResilienceConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff_strategy, Strategy::Exponential);
        assert_eq!(config.timeout_per_attempt_seconds, 30.0);
        assert_eq!(config.rate_limit, None);
        assert_eq!(config.rate_limit_mode, RateLimitMode::TokenBucket);
        assert_eq!(config.rate_limit_window_seconds, 1.0);
        assert!(config.validate().is_ok());
        assert!(config.rate_limiter().unwrap().is_none());
    }

    #[test]
    fn test_from_toml() {
        let config: ResilienceConfig = toml::from_str(
            r#"
            max_attempts = 5
            backoff_strategy = "linear"
            timeout_per_attempt_seconds = 2.5
            rate_limit = 20
            rate_limit_mode = "semaphore"
            "#,
        )
        .unwrap();

        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.backoff_strategy, Strategy::Linear);
        assert_eq!(
            config.timeout_guard().unwrap().timeout(),
            Duration::from_millis(2500)
        );
        let limiter = config.rate_limiter().unwrap().unwrap();
        assert_eq!(limiter.mode(), RateLimitMode::Semaphore);
        assert_eq!(limiter.capacity(), 20);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<ResilienceConfig, _> = toml::from_str("max_retries = 5");
        assert!(result.is_err());
    }

    #[rstest]
    #[case::zero_attempts(ResilienceConfig::default().with_max_attempts(0))]
    #[case::zero_timeout(ResilienceConfig { timeout_per_attempt_seconds: 0.0, ..Default::default() })]
    #[case::negative_timeout(ResilienceConfig { timeout_per_attempt_seconds: -1.0, ..Default::default() })]
    #[case::infinite_timeout(ResilienceConfig { timeout_per_attempt_seconds: f64::INFINITY, ..Default::default() })]
    #[case::zero_capacity(ResilienceConfig::default().with_semaphore(0))]
    #[case::zero_window(ResilienceConfig::default().with_token_bucket(5, Duration::ZERO))]
    #[case::negative_window(ResilienceConfig { rate_limit: Some(5), rate_limit_window_seconds: -2.0, ..Default::default() })]
    fn test_invalid(#[case] config: ResilienceConfig) {
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_semaphore_ignores_window() {
        let config = ResilienceConfig {
            rate_limit: Some(3),
            rate_limit_mode: RateLimitMode::Semaphore,
            rate_limit_window_seconds: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_env() {
        let config = with_env(
            &[
                ("CALLGUARD_MAX_ATTEMPTS", "5"),
                ("CALLGUARD_BACKOFF", "linear"),
                ("CALLGUARD_TIMEOUT", "0.5"),
                ("CALLGUARD_RATE_LIMIT", "10"),
                ("CALLGUARD_RATE_LIMIT_WINDOW", "2"),
            ],
            ResilienceConfig::from_env,
        )
        .unwrap();

        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.backoff_strategy, Strategy::Linear);
        assert_eq!(config.timeout_per_attempt_seconds, 0.5);
        assert_eq!(config.rate_limit, Some(10));
        assert_eq!(config.rate_limit_mode, RateLimitMode::TokenBucket);
        assert_eq!(config.rate_limit_window_seconds, 2.0);
    }

    #[test]
    fn test_from_env_defaults_when_unset() {
        let config = with_env(&[], ResilienceConfig::from_env).unwrap();
        assert_eq!(config, ResilienceConfig::default());
    }

    #[test]
    fn test_from_env_rate_limit_disabled() {
        let config = with_env(
            &[("CALLGUARD_RATE_LIMIT", "none")],
            ResilienceConfig::from_env,
        )
        .unwrap();
        assert_eq!(config.rate_limit, None);
    }

    #[rstest]
    #[case("CALLGUARD_MAX_ATTEMPTS", "three")]
    #[case("CALLGUARD_MAX_ATTEMPTS", "0")]
    #[case("CALLGUARD_BACKOFF", "fibonacci")]
    #[case("CALLGUARD_TIMEOUT", "soon")]
    #[case("CALLGUARD_RATE_LIMIT", "-1")]
    #[case("CALLGUARD_RATE_LIMIT_MODE", "leaky_bucket")]
    fn test_from_env_invalid(#[case] name: &str, #[case] value: &str) {
        let err = with_env(&[(name, value)], ResilienceConfig::from_env).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfig(_)));
    }
}
