//! Utility modules.

pub mod retry;

pub use retry::{with_retry, RetryConfig, RetryResult, Retryable};
