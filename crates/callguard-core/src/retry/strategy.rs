//! The retry decision trait.

use std::time::Duration;

/// A strategy deciding whether a failed attempt gets another try, and how long
/// to wait before it.
///
/// Implementations must be pure: the same attempt number always yields the same
/// answer, so one strategy can be shared by concurrent operations.
///
/// Attempt numbers are 0-based. After attempt `n` fails, the executor asks
/// `should_retry(n)`; if it answers `true` it sleeps for `delay_for(n)` and then
/// runs attempt `n + 1`.
///
/// # Examples
///
/// ```rust
/// use callguard_core::retry::BackoffStrategy;
/// use std::time::Duration;
///
/// /// Retries forever with a fixed pause.
/// struct Constant(Duration);
///
/// impl BackoffStrategy for Constant {
///     fn max_attempts(&self) -> u32 {
///         u32::MAX
///     }
///
///     fn delay_for(&self, _attempt: u32) -> Duration {
///         self.0
///     }
/// }
///
/// let strategy = Constant(Duration::from_millis(50));
/// assert!(strategy.should_retry(10));
/// ```
pub trait BackoffStrategy: Send + Sync {
    /// Total number of attempts allowed, counting the first one.
    fn max_attempts(&self) -> u32;

    /// Delay to wait after attempt `attempt` failed, before the next one starts.
    fn delay_for(&self, attempt: u32) -> Duration;

    /// Whether another attempt is allowed after attempt `attempt` failed.
    ///
    /// The default is `attempt < max_attempts - 1`.
    fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts().saturating_sub(1)
    }
}
