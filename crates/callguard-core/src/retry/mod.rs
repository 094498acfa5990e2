//! Backoff policies for retrying failed attempts.
//!
//! This module provides the retry decision and inter-attempt delay used by the
//! request executor. Policies are plain values: they hold no state between
//! calls and never sleep themselves.
//!
//! # Key Types
//!
//! - [`BackoffStrategy`] - Trait the executor consults after each failure
//! - [`BackoffPolicy`] - Exponential or linear policy with an attempt budget
//!
//! # Examples
//!
//! ```rust
//! use callguard_core::retry::{BackoffPolicy, BackoffStrategy, Strategy};
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy::builder()
//!     .max_attempts(4)
//!     .strategy(Strategy::Linear)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(policy.delay_for(0), Duration::from_secs(1));
//! assert_eq!(policy.delay_for(2), Duration::from_secs(3));
//! ```

mod policy;
mod strategy;

pub use policy::{BackoffPolicy, BackoffPolicyBuilder, Strategy};
pub use strategy::BackoffStrategy;
