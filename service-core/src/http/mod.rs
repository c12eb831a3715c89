//! Outbound HTTP utilities shared by services that call third-party APIs.

pub mod retry;

pub use retry::{retry_with_backoff, RetryConfig, Retryable};
