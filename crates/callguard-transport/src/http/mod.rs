//! HTTP transport implementation
//!
//! Provides an HTTP client that implements the Transport trait.
//! Handles connection pooling, method/URL validation and response collection.

pub mod client;

pub use client::{HttpTransport, HttpTransportConfig};
