//! Transport abstraction layer for callguard
//!
//! Provides the narrow interface the resilience layer uses to issue a request,
//! plus an HTTP implementation on top of reqwest.
//!
//! # Architecture
//!
//! - **Transport trait**: issue one request, get one response or a typed failure
//! - **HTTP transport**: connection-pooled REST client via reqwest
//! - **Error handling**: [`TransportError`] declares which failures are transient
//!
//! The transport performs exactly one exchange per call. Retries, deadlines and
//! rate limiting are applied by the caller.

#![deny(unsafe_code)]
#![warn(missing_docs)]
//! # Usage
//!
//! ```ignore
//! use callguard_transport::{HttpRequest, HttpTransport, Transport};
//!
//! let transport = HttpTransport::new()?;
//! let request = HttpRequest::new("GET", "https://api.example.com/health");
//! let response = transport.send_http(request).await?;
//! ```

pub mod error;
pub mod http;
pub mod traits;

// Re-export commonly used types
pub use error::{Result, TransportError};
pub use http::{HttpTransport, HttpTransportConfig};
pub use traits::{HttpRequest, HttpResponse, Transport};
