//! # callguard
//!
//! Resilience layer for outbound HTTP calls:
//! - Token-bucket or semaphore rate limiting
//! - Per-attempt deadlines with cancellation of the overrunning attempt
//! - Exponential or linear backoff retries with an attempt budget
//! - Structured lifecycle events correlated by a per-operation request id
//!
//! Policies are applied in a fixed order: a permit is acquired once, then
//! each attempt runs under its deadline, and failed attempts are retried
//! after the policy's delay until the budget is spent or a failure is fatal.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use callguard::ApiClient;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ApiClient::builder()
//!         .base_url("https://api.example.com")
//!         .timeout(Duration::from_secs(10))
//!         .rate_limit(5)
//!         .build()?;
//!
//!     let status = client.get("/status").await?;
//!     println!("{status}");
//!     Ok(())
//! }
//! ```
//!
//! Any fallible async operation can be wrapped directly:
//!
//! ```rust,no_run
//! use callguard::{
//!     Attempt, HttpRequest, HttpTransport, RequestExecutor, ResilienceConfig, Transport,
//!     TracingSink,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ResilienceConfig::from_env()?;
//! let executor = RequestExecutor::from_config(&config, Arc::new(TracingSink))?;
//! let transport = HttpTransport::new()?;
//!
//! let response = executor
//!     .run(|attempt: Attempt| {
//!         let transport = &transport;
//!         async move {
//!             tracing::info!(request_id = attempt.request_id(), "fetching");
//!             let request = HttpRequest::new("GET", "https://example.com");
//!             Ok(transport.send_http(request).await?)
//!         }
//!     })
//!     .await?;
//! println!("{}", response.status);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Re-export commonly used types
pub use client::{ApiClient, ApiClientBuilder, RequestOptions};
pub use config::ResilienceConfig;
pub use error::{Classify, Error, Failure, FailureKind, Result};
pub use executor::{Attempt, RequestExecutor, RequestExecutorBuilder, RunOptions};
pub use limiter::{LimiterClosed, RateLimitMode, RateLimiter, RatePermit};
pub use observability::{
    EventKind, EventSink, JsonSink, LifecycleEvent, MemorySink, NoopSink, SinkError, TracingSink,
};
pub use timeout::TimeoutGuard;

pub use callguard_core::ConfigError;
pub use callguard_core::retry::{BackoffPolicy, BackoffPolicyBuilder, BackoffStrategy, Strategy};
pub use callguard_transport::{
    HttpRequest, HttpResponse, HttpTransport, HttpTransportConfig, Transport, TransportError,
};

// Module declarations
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod limiter;
pub mod observability;
pub mod timeout;

#[cfg(feature = "trace")]
#[cfg_attr(docsrs, doc(cfg(feature = "trace")))]
pub use observability::init_tracing;

// Re-export key dependencies for convenience
pub use async_trait::async_trait;
pub use serde_json::Value as JsonValue;

/// Prelude module for convenient imports
///
/// ```rust
/// use callguard::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        ApiClient, Attempt, BackoffPolicy, BackoffStrategy, Classify, ConfigError, Error,
        EventSink, Failure, RateLimitMode, RateLimiter, RequestExecutor, RequestOptions,
        ResilienceConfig, RunOptions, Strategy, TracingSink, Transport, TransportError,
    };
}
