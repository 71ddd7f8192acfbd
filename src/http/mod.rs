//! HTTP transport with connection pooling and retry classification.

mod client;
mod retry;

pub use client::{
    DEFAULT_TIMEOUT, HttpClient, PoolConfig, RawResponse, ResponseBody, TransportError,
};
pub use retry::{
    DEFAULT_BASE_DELAY, DEFAULT_JITTER, DEFAULT_MAX_DELAY, DEFAULT_MAX_RETRIES, FailureKind,
    RetryPolicy, StatusClass, classify_status, classify_transport,
};
