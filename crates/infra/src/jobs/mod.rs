//! Retry scheduling for out-of-band work (notification delivery).

pub mod retry;

pub use retry::{BackoffStrategy, RetryPolicy};
