//! Pooled HTTP transport shared across workflow invocations.

use anyhow::{Context, Result};
use futures_util::stream::{self, BoxStream, StreamExt};
use log::debug;
use reqwest::{Client, StatusCode, header::HeaderMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Default per-attempt timeout. Workflows run for minutes, not seconds.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(900);

/// Connection pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Idle connections kept open per host
    pub max_idle_per_host: usize,
    /// Requests allowed in flight at once through one client
    pub max_connections: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            max_connections: 20,
        }
    }
}

/// Network-level failures of a single request.
#[derive(Debug)]
pub enum TransportError {
    /// The request did not complete within its timeout
    Timeout(String),
    /// Connection refused, TLS failure, read/write error
    Network(String),
    /// The client has been closed
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Timeout(msg) => write!(f, "Request timed out: {}", msg),
            TransportError::Network(msg) => write!(f, "Network error: {}", msg),
            TransportError::Closed => write!(f, "HTTP client is closed"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            TransportError::Timeout(error.to_string())
        } else {
            TransportError::Network(error.to_string())
        }
    }
}

/// Body of a response, either fully read or still on the wire.
pub enum ResponseBody {
    Buffered(Vec<u8>),
    Streaming(reqwest::Response),
}

/// A response whose connection slot stays reserved until it is dropped.
pub struct RawResponse {
    status: StatusCode,
    body: ResponseBody,
    permit: OwnedSemaphorePermit,
}

impl RawResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.body, ResponseBody::Streaming(_))
    }

    /// Reads the whole body.
    pub async fn bytes(self) -> Result<Vec<u8>, TransportError> {
        match self.body {
            ResponseBody::Buffered(data) => Ok(data),
            ResponseBody::Streaming(response) => Ok(response.bytes().await?.to_vec()),
        }
    }

    /// Body as a stream of chunks. Streaming bodies are read lazily.
    pub fn chunks(self) -> BoxStream<'static, Result<Vec<u8>, TransportError>> {
        let permit = self.permit;
        match self.body {
            ResponseBody::Buffered(data) => stream::once(async move {
                drop(permit);
                Ok::<_, TransportError>(data)
            })
            .boxed(),
            ResponseBody::Streaming(response) => response
                .bytes_stream()
                .map(move |chunk| {
                    let _slot = &permit;
                    chunk.map(|b| b.to_vec()).map_err(TransportError::from)
                })
                .boxed(),
        }
    }

    /// First `limit` characters of the body, for diagnostics.
    pub async fn snippet(self, limit: usize) -> String {
        match self.bytes().await {
            Ok(data) => String::from_utf8_lossy(&data).chars().take(limit).collect(),
            Err(e) => format!("<unreadable body: {}>", e),
        }
    }
}

/// Connection manager: one pooled reqwest client plus a bound on in-flight requests.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    permits: Arc<Semaphore>,
    pool: PoolConfig,
}

impl HttpClient {
    /// Wraps an already configured reqwest Client.
    pub fn new(client: Client, pool: PoolConfig) -> Self {
        let pool = PoolConfig {
            max_connections: pool.max_connections.max(1),
            ..pool
        };
        Self {
            client,
            permits: Arc::new(Semaphore::new(pool.max_connections)),
            pool,
        }
    }

    /// Builds a pooled client with the given user agent and default headers.
    pub fn build(pool: PoolConfig, user_agent: &str, headers: HeaderMap) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .default_headers(headers)
            .pool_max_idle_per_host(pool.max_idle_per_host)
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self::new(client, pool))
    }

    /// Builds a client, hands a handle to `f`, and closes the client once `f`
    /// finishes, whether it succeeded or not.
    pub async fn scoped<F, Fut, T>(
        pool: PoolConfig,
        user_agent: &str,
        headers: HeaderMap,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(HttpClient) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let client = Self::build(pool, user_agent, headers)?;
        let result = f(client.clone()).await;
        client.close();
        result
    }

    /// Returns a reference to the underlying reqwest Client.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn pool(&self) -> PoolConfig {
        self.pool
    }

    /// Number of requests currently holding a connection slot.
    pub fn in_flight(&self) -> usize {
        self.pool
            .max_connections
            .saturating_sub(self.permits.available_permits())
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Refuses further requests on every handle. Pooled sockets are released
    /// once the last handle is dropped.
    pub fn close(self) {
        debug!("Closing HTTP client");
        self.permits.close();
    }

    /// Sends one POST request.
    ///
    /// `timeout` bounds the whole exchange, including the wait for a free
    /// connection slot and the body. With `streaming` set the call returns as
    /// soon as the headers arrive.
    #[tracing::instrument(skip(self, headers, body))]
    pub async fn send(
        &self,
        url: &str,
        headers: HeaderMap,
        body: Vec<u8>,
        timeout: Duration,
        streaming: bool,
    ) -> Result<RawResponse, TransportError> {
        let now = Instant::now();
        // Absurd timeouts saturate to a deadline decades away.
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365 * 30));
        let permit = tokio::time::timeout_at(deadline, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| {
                TransportError::Timeout(format!(
                    "no connection slot free within {:?} ({} in flight)",
                    timeout,
                    self.in_flight()
                ))
            })?
            .map_err(|_| TransportError::Closed)?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransportError::Timeout(format!(
                "attempt deadline of {:?} spent waiting for a connection slot",
                timeout
            )));
        }

        debug!("POST {} ({} bytes)...", url, body.len());

        let response = self
            .client
            .post(url)
            .headers(headers)
            .body(body)
            .timeout(remaining)
            .send()
            .await?;

        let status = response.status();
        debug!("Received HTTP {} from {}", status, url);

        let body = if streaming {
            ResponseBody::Streaming(response)
        } else {
            ResponseBody::Buffered(response.bytes().await?.to_vec())
        };

        Ok(RawResponse {
            status,
            body,
            permit,
        })
    }
}
