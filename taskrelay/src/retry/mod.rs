//! Retry utilities with exponential backoff and jitter.
//!
//! - [`RetryConfig`] / [`BackoffPolicy`]: how long to wait between attempts
//! - [`RetryExecutor`]: the attempt loop, with one event per attempt

mod backoff;
mod executor;

pub use backoff::{BackoffPolicy, RetryConfig};
pub use executor::{with_retry, RetryExecutor, RetryReport};
