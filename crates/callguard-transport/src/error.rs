//! Transport error types

use thiserror::Error;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur in transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// Protocol-level failure while exchanging the request
    #[error("HTTP error: {0}")]
    Http(String),

    /// Could not establish a connection
    #[error("Connection error: {0}")]
    Connection(String),

    /// The transport's own timeout fired
    #[error("Timeout")]
    Timeout,

    /// The server answered with an error status
    #[error("HTTP status {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, lossily decoded
        body: String,
    },

    /// Request or response body could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The request itself is malformed (bad method, URL, header)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    /// Check if this error is transient and worth another attempt.
    ///
    /// # Retry Logic
    ///
    /// Retryable errors:
    /// - Timeout errors
    /// - Connection errors (network failures)
    /// - Protocol errors
    /// - Error statuses (4xx/5xx)
    ///
    /// Non-retryable errors:
    /// - Serialization errors (will fail again)
    /// - Invalid requests (will fail again)
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Connection(_) | Self::Http(_) | Self::Status { .. } => true,
            Self::Serialization(_) | Self::InvalidRequest(_) => false,
        }
    }

    /// HTTP status carried by this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connection(err.to_string())
        } else if err.is_builder() {
            Self::InvalidRequest(err.to_string())
        } else {
            Self::Http(err.to_string())
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
