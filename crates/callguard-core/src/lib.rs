#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Core abstractions for the callguard crates.
//!
//! This crate holds the pieces of the resilience layer that carry no I/O:
//!
//! - **Backoff policies** via the [`BackoffStrategy`](retry::BackoffStrategy) trait
//!   - Exponential (`base * 2^n`) and linear (`base * (n + 1)`) delays
//!   - Attempt budgeting (`should_retry`)
//! - **Configuration errors** via [`ConfigError`](error::ConfigError), raised when a
//!   component is constructed with parameters it cannot honor
//!
//! Everything here is pure and `Send + Sync`, so a single policy can be shared by
//! any number of concurrent operations.
//!
//! # Examples
//!
//! ```rust
//! use callguard_core::prelude::*;
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy::builder()
//!     .max_attempts(3)
//!     .strategy(Strategy::Exponential)
//!     .build()
//!     .unwrap();
//!
//! assert!(policy.should_retry(0));
//! assert!(policy.should_retry(1));
//! assert!(!policy.should_retry(2));
//! assert_eq!(policy.delay_for(1), Duration::from_secs(2));
//! ```

pub mod error;
pub mod retry;

pub use error::ConfigError;

/// Convenient re-exports of commonly used items.
///
/// ```rust
/// use callguard_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::ConfigError;
    pub use crate::retry::{BackoffPolicy, BackoffPolicyBuilder, BackoffStrategy, Strategy};
}
