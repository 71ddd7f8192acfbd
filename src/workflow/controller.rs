//! Invocation controller: runs one logical invocation attempt by attempt.
//!
//! The controller is an explicit state machine:
//!
//! ```text
//! Attempting ──▶ Success
//!     │  ▲
//!     │  └────── Retrying (after backoff)
//!     ├────────▶ Exhausted
//!     └────────▶ Aborted
//! ```
//!
//! [`next_state`] decides every transition out of `Attempting` and is pure;
//! [`WorkflowClient::invoke`] executes the states, sleeping through the
//! injected [`Runtime`].

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use rand::Rng;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONNECTION, CONTENT_TYPE, HeaderMap, HeaderValue};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::decoder;
use super::types::{DeliveryMode, Fields, InvocationError, InvocationResult, WorkflowRequest};
use crate::http::{
    DEFAULT_TIMEOUT, FailureKind, HttpClient, RetryPolicy, StatusClass, classify_status,
    classify_transport,
};
use crate::runtime::{RealRuntime, Runtime};

/// Characters of a failed response body kept for diagnostics.
const ERROR_SNIPPET_CHARS: usize = 500;

/// Caller identity used when none is configured.
pub const DEFAULT_IDENTITY: &str = "wfcall";

/// Result of a single attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success(InvocationResult),
    RetryableFailure(FailureKind),
    FatalFailure {
        status: Option<StatusCode>,
        detail: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvocationState {
    /// Attempt number `attempt` (zero based) is about to be sent
    Attempting { attempt: u32 },
    /// Waiting `delay` before attempt number `attempt`
    Retrying {
        attempt: u32,
        delay: Duration,
        reason: FailureKind,
    },
    Success(InvocationResult),
    Exhausted { attempts: u32, last: FailureKind },
    Aborted(InvocationError),
}

/// Transition out of `Attempting { attempt }` given that attempt's outcome.
///
/// `jitter_sample` is a uniform draw from `[0, 1]`.
pub fn next_state(
    attempt: u32,
    outcome: AttemptOutcome,
    policy: &RetryPolicy,
    jitter_sample: f64,
) -> InvocationState {
    match outcome {
        AttemptOutcome::Success(result) => InvocationState::Success(result),
        AttemptOutcome::FatalFailure { status, detail } => {
            InvocationState::Aborted(InvocationError::Fatal { status, detail })
        }
        AttemptOutcome::RetryableFailure(last) if attempt >= policy.max_retries => {
            InvocationState::Exhausted {
                attempts: attempt + 1,
                last,
            }
        }
        AttemptOutcome::RetryableFailure(reason) => {
            let failures = attempt + 1;
            InvocationState::Retrying {
                attempt: failures,
                delay: policy.backoff_delay(&reason, failures, jitter_sample),
                reason,
            }
        }
    }
}

/// Client for one workflow endpoint.
///
/// Cheap to share: the transport is pooled and every call to [`invoke`]
/// keeps its own attempt counter.
///
/// [`invoke`]: WorkflowClient::invoke
pub struct WorkflowClient<R: Runtime = RealRuntime> {
    http: HttpClient,
    url: String,
    headers: HeaderMap,
    identity: String,
    timeout: Duration,
    policy: RetryPolicy,
    runtime: R,
}

impl WorkflowClient<RealRuntime> {
    pub fn new(http: HttpClient, url: impl Into<String>, api_key: &str) -> Result<Self> {
        Self::with_runtime(RealRuntime, http, url, api_key)
    }
}

impl<R: Runtime> WorkflowClient<R> {
    pub fn with_runtime(
        runtime: R,
        http: HttpClient,
        url: impl Into<String>,
        api_key: &str,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut auth_value = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .context("API key contains characters not allowed in an HTTP header")?;
        auth_value.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth_value);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));

        Ok(Self {
            http,
            url: url.into(),
            headers,
            identity: DEFAULT_IDENTITY.to_string(),
            timeout: DEFAULT_TIMEOUT,
            policy: RetryPolicy::default(),
            runtime,
        })
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Per-attempt timeout, covering connect and the full body read.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Identity sent as `user` by the convenience entry points.
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    /// Runs the workflow, retrying timeouts, 504s and transient errors.
    ///
    /// Attempts are strictly sequential. Cancelling `cancel` stops the
    /// invocation during a request, a stream read or a backoff wait.
    #[tracing::instrument(skip(self, request, cancel), fields(mode = %request.delivery_mode()))]
    pub async fn invoke(
        &self,
        request: &WorkflowRequest,
        cancel: &CancellationToken,
    ) -> Result<InvocationResult, InvocationError> {
        let mode = request.delivery_mode();
        let body = request.to_body();
        let mut state = InvocationState::Attempting { attempt: 0 };

        loop {
            state = match state {
                InvocationState::Attempting { attempt } => {
                    info!(
                        "Invoking workflow ({} mode, attempt {}/{})...",
                        mode,
                        attempt + 1,
                        self.policy.max_attempts()
                    );
                    let outcome = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        outcome = self.attempt(&body, mode) => Some(outcome),
                    };
                    match outcome {
                        Some(outcome) => {
                            let sample: f64 = rand::rng().random();
                            next_state(attempt, outcome, &self.policy, sample)
                        }
                        None => InvocationState::Aborted(InvocationError::Cancelled),
                    }
                }
                InvocationState::Retrying {
                    attempt,
                    delay,
                    reason,
                } => {
                    warn!(
                        "Workflow attempt {}/{} failed ({}), retrying in {:.2}s...",
                        attempt,
                        self.policy.max_attempts(),
                        reason,
                        delay.as_secs_f64()
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => InvocationState::Aborted(InvocationError::Cancelled),
                        _ = self.runtime.sleep(delay) => InvocationState::Attempting { attempt },
                    }
                }
                InvocationState::Success(result) => {
                    match &result {
                        InvocationResult::Text(text) => {
                            info!(
                                "Workflow succeeded, received {} characters",
                                text.chars().count()
                            )
                        }
                        InvocationResult::Outputs(outputs) => {
                            info!("Workflow succeeded, received {} outputs", outputs.len())
                        }
                    }
                    return Ok(result);
                }
                InvocationState::Exhausted { attempts, last } => {
                    error!(
                        "All {} workflow attempts failed. Last error: {}",
                        attempts, last
                    );
                    return Err(InvocationError::Exhausted { attempts, last });
                }
                InvocationState::Aborted(err) => {
                    error!("Workflow invocation aborted: {}", err);
                    return Err(err);
                }
            };
        }
    }

    /// Like [`invoke`](Self::invoke), but any failure becomes the empty value
    /// for the request's mode: `""` when streaming, `{}` when blocking.
    pub async fn invoke_or_empty(
        &self,
        request: &WorkflowRequest,
        cancel: &CancellationToken,
    ) -> InvocationResult {
        match self.invoke(request, cancel).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Returning empty {} result: {}", request.delivery_mode(), e);
                InvocationResult::empty(request.delivery_mode())
            }
        }
    }

    /// Streams the workflow and returns its text, or `""` on failure.
    pub async fn invoke_text(&self, inputs: Fields) -> String {
        let request = WorkflowRequest::new(inputs, DeliveryMode::Streaming, self.identity.clone());
        self.invoke_or_empty(&request, &CancellationToken::new())
            .await
            .into_text()
            .unwrap_or_default()
    }

    /// Runs the workflow in blocking mode and returns its outputs, or `{}` on failure.
    pub async fn invoke_outputs(&self, inputs: Fields) -> Fields {
        let request = WorkflowRequest::new(inputs, DeliveryMode::Blocking, self.identity.clone());
        self.invoke_or_empty(&request, &CancellationToken::new())
            .await
            .into_outputs()
            .unwrap_or_default()
    }

    /// Sends one request and classifies what came back.
    async fn attempt(&self, body: &[u8], mode: DeliveryMode) -> AttemptOutcome {
        let response = match self
            .http
            .send(
                &self.url,
                self.headers.clone(),
                body.to_vec(),
                self.timeout,
                mode == DeliveryMode::Streaming,
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                debug!("Transport error: {}", e);
                return match classify_transport(&e) {
                    Some(kind) => AttemptOutcome::RetryableFailure(kind),
                    None => AttemptOutcome::FatalFailure {
                        status: None,
                        detail: e.to_string(),
                    },
                };
            }
        };

        let status = response.status();
        match classify_status(status) {
            StatusClass::GatewayTimeout => {
                let detail = response.snippet(ERROR_SNIPPET_CHARS).await;
                debug!("Gateway timeout from {}, body: {}", self.url, detail);
                AttemptOutcome::RetryableFailure(FailureKind::GatewayTimeout)
            }
            StatusClass::Fatal => {
                let detail = response.snippet(ERROR_SNIPPET_CHARS).await;
                AttemptOutcome::FatalFailure {
                    status: Some(status),
                    detail,
                }
            }
            StatusClass::Unexpected => AttemptOutcome::RetryableFailure(FailureKind::Transient(
                format!("unexpected HTTP status {}", status),
            )),
            StatusClass::Success => match decoder::decode(response, mode, ERROR_SNIPPET_CHARS).await {
                Ok(result) => AttemptOutcome::Success(result),
                Err(kind) => {
                    debug!("Failed to decode {} response: {}", mode, kind);
                    AttemptOutcome::RetryableFailure(kind)
                }
            },
        }
    }
}
