//! Configuration errors.

use thiserror::Error;

/// Error raised when a resilience component is built from invalid parameters.
///
/// These errors are fatal: they are surfaced immediately and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A construction parameter is out of range or cannot be parsed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConfigError {
    /// Build an [`ConfigError::InvalidConfig`] from anything printable.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}
