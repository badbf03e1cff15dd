//! Reliability helpers
//!
//! - [`RetryPolicy`]: backoff for optimistic-concurrency conflicts
//! - [`with_timeout`]: upper bound on step executors and loop iterations

mod retry;
mod timeout;

pub use retry::{ConflictError, RetryPolicy};
pub use timeout::{format_duration, with_timeout, TimeoutError};
