//! Resilient client for long-running remote workflows.
//!
//! [`workflow::WorkflowClient`] submits a run over a pooled
//! [`http::HttpClient`], retries timeouts, gateway timeouts and transient
//! failures with exponential backoff, and decodes either a blocking JSON reply
//! or a live event stream.

pub mod config;
pub mod http;
pub mod runtime;
pub mod workflow;
