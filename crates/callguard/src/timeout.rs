//! Per-attempt deadline enforcement.

use crate::error::Failure;
use callguard_core::ConfigError;
use std::future::Future;
use std::time::Duration;

/// Wraps a single attempt with a deadline.
///
/// The attempt races a timer on the same runtime. If the timer wins, the
/// attempt's future is dropped, which cancels whatever it was awaiting (an
/// in-flight HTTP exchange included), and the outcome becomes
/// [`Failure::TimedOut`]. If the attempt wins, its outcome passes through
/// untouched and the timer is dropped with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutGuard {
    timeout: Duration,
}

impl TimeoutGuard {
    /// Guard with a default deadline of `timeout` per attempt.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConfig`] if `timeout` is zero.
    pub fn new(timeout: Duration) -> Result<Self, ConfigError> {
        Self::validate(timeout)?;
        Ok(Self { timeout })
    }

    /// Guard from a timeout given in (fractional) seconds.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConfig`] if `seconds` is not a positive,
    /// finite number.
    pub fn from_secs_f64(seconds: f64) -> Result<Self, ConfigError> {
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(ConfigError::invalid(format!(
                "timeout must be a positive number of seconds, got {seconds}"
            )));
        }
        let timeout = Duration::try_from_secs_f64(seconds)
            .map_err(|e| ConfigError::invalid(format!("timeout {seconds}s: {e}")))?;
        Self::new(timeout)
    }

    pub(crate) fn validate(timeout: Duration) -> Result<(), ConfigError> {
        if timeout.is_zero() {
            return Err(ConfigError::invalid("timeout must be positive"));
        }
        Ok(())
    }

    /// The default per-attempt deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `attempt` under the default deadline.
    pub async fn run<F, T, E>(&self, attempt: F) -> Result<T, Failure<E>>
    where
        F: Future<Output = Result<T, Failure<E>>>,
    {
        self.run_with_deadline(attempt, self.timeout).await
    }

    /// Run `attempt` under an explicit deadline.
    pub async fn run_with_deadline<F, T, E>(
        &self,
        attempt: F,
        deadline: Duration,
    ) -> Result<T, Failure<E>>
    where
        F: Future<Output = Result<T, Failure<E>>>,
    {
        match tokio::time::timeout(deadline, attempt).await {
            Ok(outcome) => outcome,
            Err(_elapsed) => Err(Failure::TimedOut(deadline)),
        }
    }
}
