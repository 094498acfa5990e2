//! Error types for the resilience layer
//!
//! Two levels of failure are distinguished:
//!
//! - [`Failure`] is the outcome of a *single attempt*. Its variant declares
//!   whether the attempt may be retried, so retryability is a property of the
//!   failure rather than something inferred from catching any error.
//! - [`Error`] is what a caller of
//!   [`RequestExecutor::run`](crate::RequestExecutor::run) sees once the
//!   operation reached a terminal state. It always carries the last attempt's
//!   cause and the number of attempts used.

use callguard_core::ConfigError;
use callguard_transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for executor runs failing with `Error<E>`.
pub type Result<T, E> = std::result::Result<T, Error<E>>;

/// Outcome of one failed attempt.
#[derive(Debug, Error)]
pub enum Failure<E> {
    /// The attempt did not finish before its deadline and was cancelled.
    #[error("attempt timed out after {0:?}")]
    TimedOut(Duration),

    /// A transient failure; another attempt may succeed.
    #[error("{0}")]
    Retryable(#[source] E),

    /// A failure that will not go away by retrying.
    #[error("{0}")]
    Fatal(#[source] E),
}

impl<E> Failure<E> {
    /// Wrap `error` as a transient failure.
    pub fn retryable(error: E) -> Self {
        Self::Retryable(error)
    }

    /// Wrap `error` as a non-retryable failure.
    pub fn fatal(error: E) -> Self {
        Self::Fatal(error)
    }

    /// Whether the executor may schedule another attempt after this failure.
    ///
    /// Timeouts are always retryable.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }

    /// Whether this failure is a deadline overrun.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }

    /// The classification recorded in lifecycle events.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::TimedOut(_) => FailureKind::TimedOut,
            Self::Retryable(_) => FailureKind::Retryable,
            Self::Fatal(_) => FailureKind::Fatal,
        }
    }

    /// The operation's own error, if the failure was not a timeout.
    pub fn inner(&self) -> Option<&E> {
        match self {
            Self::TimedOut(_) => None,
            Self::Retryable(e) | Self::Fatal(e) => Some(e),
        }
    }

    /// Consume the failure, returning the operation's own error if any.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::TimedOut(_) => None,
            Self::Retryable(e) | Self::Fatal(e) => Some(e),
        }
    }
}

/// Coarse classification of a [`Failure`], as it appears in emitted events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Deadline overrun
    TimedOut,
    /// Transient operation failure
    Retryable,
    /// Non-retryable operation failure
    Fatal,
}

/// Declares how a domain error maps onto [`Failure`].
///
/// Implementing this lets operations use `?` on their own error type: the
/// blanket `From` impl picks the right [`Failure`] variant.
///
/// # Examples
///
/// ```rust
/// use callguard::{Classify, Failure};
///
/// #[derive(Debug)]
/// enum StoreError {
///     Busy,
///     Corrupt,
/// }
///
/// impl Classify for StoreError {
///     fn is_retryable(&self) -> bool {
///         matches!(self, StoreError::Busy)
///     }
/// }
///
/// let failure: Failure<StoreError> = StoreError::Corrupt.into();
/// assert!(!failure.is_retryable());
/// ```
pub trait Classify {
    /// Whether a failure of this kind is transient.
    fn is_retryable(&self) -> bool;
}

impl<E: Classify> From<E> for Failure<E> {
    fn from(error: E) -> Self {
        if error.is_retryable() {
            Self::Retryable(error)
        } else {
            Self::Fatal(error)
        }
    }
}

impl Classify for TransportError {
    fn is_retryable(&self) -> bool {
        TransportError::is_retryable(self)
    }
}

/// Terminal failure of a logical operation.
#[derive(Debug, Error)]
pub enum Error<E> {
    /// The operation was configured with parameters it cannot honor. No
    /// attempt was made and the rate limiter was not consulted.
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    /// Every allowed attempt failed; `cause` is the last attempt's failure.
    #[error("gave up after {attempts} attempt(s): {cause}")]
    Exhausted {
        /// Number of attempts performed
        attempts: u32,
        /// Failure of the final attempt
        #[source]
        cause: Failure<E>,
    },

    /// An attempt failed with a non-retryable failure.
    #[error("aborted after {attempts} attempt(s): {cause}")]
    Fatal {
        /// Number of attempts performed
        attempts: u32,
        /// The non-retryable failure
        #[source]
        cause: Failure<E>,
    },

    /// The rate limiter was closed before a permit could be granted.
    #[error("rate limiter closed")]
    LimiterClosed,
}

impl<E> Error<E> {
    /// Number of attempts performed before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Fatal { attempts, .. } => *attempts,
            Self::InvalidConfig(_) | Self::LimiterClosed => 0,
        }
    }

    /// Failure of the last attempt, if any attempt ran.
    pub fn cause(&self) -> Option<&Failure<E>> {
        match self {
            Self::Exhausted { cause, .. } | Self::Fatal { cause, .. } => Some(cause),
            Self::InvalidConfig(_) | Self::LimiterClosed => None,
        }
    }

    /// Consume the error, returning the last attempt's failure if any.
    pub fn into_cause(self) -> Option<Failure<E>> {
        match self {
            Self::Exhausted { cause, .. } | Self::Fatal { cause, .. } => Some(cause),
            Self::InvalidConfig(_) | Self::LimiterClosed => None,
        }
    }

    /// Whether the last attempt ended in a deadline overrun.
    pub fn is_timeout(&self) -> bool {
        self.cause().is_some_and(Failure::is_timeout)
    }
}
