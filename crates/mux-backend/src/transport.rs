//! HTTP transport with bounded retries on rate limits and server errors.

use std::pin::Pin;
use std::sync::OnceLock;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use mux_protocol::StreamError;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, Response, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::sse::{frame_reader, FrameReader};

pub const MAX_ATTEMPTS: u32 = 3;
pub const BASE_DELAY: Duration = Duration::from_secs(1);
pub const MAX_DELAY: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HEADER_TIMEOUT: Duration = Duration::from_secs(60);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// Response body as a stream of chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("no response headers within {0:?}")]
    Timeout(Duration),
    #[error("request cancelled")]
    Cancelled,
    #[error("got retryable status {status} but the request body cannot be replayed")]
    BodyNotReplayable { status: u16 },
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid request: {0}")]
    Build(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<TransportError> for StreamError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Status { status, body } => StreamError::Http { status, body },
            TransportError::Cancelled => StreamError::Cancelled,
            other => StreamError::Transport(other.to_string()),
        }
    }
}

/// Capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay: BASE_DELAY,
            max_delay: MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Wait before the retry that follows attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Rate limits and server errors are worth another attempt; nothing else is.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    pub retry: RetryPolicy,
    /// Covers the TCP connect and the TLS handshake.
    pub connect_timeout: Duration,
    /// Limit on waiting for response headers. The body may stream for longer.
    pub header_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            connect_timeout: CONNECT_TIMEOUT,
            header_timeout: HEADER_TIMEOUT,
        }
    }
}

static SHARED_CLIENT: OnceLock<Client> = OnceLock::new();

/// The process-wide client. The first caller's connect timeout is the one
/// that sticks.
pub fn shared_client(config: &TransportConfig) -> Result<Client, TransportError> {
    if let Some(client) = SHARED_CLIENT.get() {
        return Ok(client.clone());
    }
    let client = build_http_client(config)?;
    Ok(SHARED_CLIENT.get_or_init(|| client).clone())
}

/// No total request timeout: a streamed completion can legitimately run for
/// minutes. Proxies come from the environment.
fn build_http_client(config: &TransportConfig) -> Result<Client, TransportError> {
    Client::builder()
        .connect_timeout(config.connect_timeout)
        .min_tls_version(reqwest::tls::Version::TLS_1_2)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(16)
        .tcp_keepalive(TCP_KEEPALIVE)
        .build()
        .map_err(|e| TransportError::Build(format!("failed to build HTTP client: {e}")))
}

/// Request payload.
///
/// `Bytes` is sent again unchanged on every retry. `OneShot` can only be
/// sent once, so a retryable status with it is reported as
/// [`TransportError::BodyNotReplayable`].
#[derive(Debug)]
pub enum RequestBody {
    Empty,
    Bytes(Bytes),
    OneShot(Option<reqwest::Body>),
}

impl RequestBody {
    pub fn json<T: Serialize>(value: &T) -> Result<Self, TransportError> {
        Ok(Self::Bytes(Bytes::from(serde_json::to_vec(value)?)))
    }

    pub fn one_shot(body: impl Into<reqwest::Body>) -> Self {
        Self::OneShot(Some(body.into()))
    }

    pub fn is_replayable(&self) -> bool {
        !matches!(self, Self::OneShot(_))
    }

    fn for_attempt(&mut self) -> Option<reqwest::Body> {
        match self {
            Self::Empty => None,
            Self::Bytes(bytes) => Some(reqwest::Body::from(bytes.clone())),
            Self::OneShot(body) => body.take(),
        }
    }
}

/// A base URL plus default headers, sharing the process-wide client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    headers: HeaderMap,
    retry: RetryPolicy,
    header_timeout: Duration,
}

impl HttpTransport {
    pub fn new(base_url: &str, config: &TransportConfig) -> Result<Self, TransportError> {
        Ok(Self::with_client(shared_client(config)?, base_url, config))
    }

    pub fn with_client(client: Client, base_url: &str, config: &TransportConfig) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            headers,
            retry: config.retry,
            header_timeout: config.header_timeout,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Result<Self, TransportError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::Build(format!("header name {name:?}: {e}")))?;
        let mut value = HeaderValue::from_str(value)
            .map_err(|e| TransportError::Build(format!("header {name}: {e}")))?;
        if name == AUTHORIZATION || name.as_str().ends_with("api-key") {
            value.set_sensitive(true);
        }
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn bearer(self, token: &str) -> Result<Self, TransportError> {
        self.header(AUTHORIZATION.as_str(), &format!("Bearer {token}"))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request, retrying 429 and 5xx responses with backoff.
    ///
    /// Connection failures are returned immediately. When the retry budget
    /// runs out the last response is returned whatever its status.
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        method: Method,
        path: &str,
        mut body: RequestBody,
    ) -> Result<Response, TransportError> {
        let url = self.url(path);
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let mut request = self
                .client
                .request(method.clone(), &url)
                .headers(self.headers.clone());
            if let Some(payload) = body.for_attempt() {
                request = request.body(payload);
            }

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                sent = tokio::time::timeout(self.header_timeout, request.send()) => match sent {
                    Ok(response) => response?,
                    Err(_) => return Err(TransportError::Timeout(self.header_timeout)),
                },
            };

            let status = response.status();
            attempt += 1;
            if !is_retryable_status(status) {
                return Ok(response);
            }
            if attempt >= max_attempts {
                warn!(%url, status = status.as_u16(), attempts = attempt, "retries exhausted");
                return Ok(response);
            }
            if !body.is_replayable() {
                return Err(TransportError::BodyNotReplayable {
                    status: status.as_u16(),
                });
            }

            let delay = self.retry.delay_for(attempt - 1);
            warn!(
                %url,
                status = status.as_u16(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying request"
            );
            drop(response);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Like [`HttpTransport::send`], but a non-2xx final status becomes
    /// [`TransportError::Status`] carrying the response body.
    pub async fn stream_bytes(
        &self,
        cancel: &CancellationToken,
        method: Method,
        path: &str,
        body: RequestBody,
    ) -> Result<ByteStream, TransportError> {
        let response = self.send(cancel, method, path, body).await?;
        let status = response.status();
        if !status.is_success() {
            let body = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                text = response.text() => text.unwrap_or_default(),
            };
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        debug!(status = status.as_u16(), path, "response stream opened");
        Ok(Box::pin(response.bytes_stream()))
    }

    /// [`HttpTransport::stream_bytes`] wrapped in a frame reader. Dropping the
    /// reader closes the connection.
    pub async fn stream_frames(
        &self,
        cancel: &CancellationToken,
        method: Method,
        path: &str,
        body: RequestBody,
    ) -> Result<FrameReader<ByteStream>, TransportError> {
        let bytes = self.stream_bytes(cancel, method, path, body).await?;
        Ok(frame_reader(bytes))
    }
}

/// Strip a base URL's path when it is exactly `/v1`, since adapters append
/// their own `/v1/...`. Anything else is returned unchanged.
pub fn normalize_base_url(base: &str) -> String {
    let Ok(mut url) = reqwest::Url::parse(base.trim()) else {
        return base.to_string();
    };
    if url.path().trim_end_matches('/') != "/v1" {
        return base.to_string();
    }
    url.set_path("");
    url.as_str().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_bare_v1() {
        assert_eq!(normalize_base_url("http://h:8000/v1"), "http://h:8000");
        assert_eq!(normalize_base_url("http://h:8000/v1/"), "http://h:8000");
        assert_eq!(
            normalize_base_url("https://api.openai.com/v1"),
            "https://api.openai.com"
        );
    }

    #[test]
    fn normalize_keeps_nested_v1() {
        assert_eq!(
            normalize_base_url("http://h:8000/api/v1"),
            "http://h:8000/api/v1"
        );
        assert_eq!(normalize_base_url("http://h:8000"), "http://h:8000");
    }

    #[test]
    fn normalize_empty_and_garbage() {
        assert_eq!(normalize_base_url(""), "");
        assert_eq!(normalize_base_url("not a url"), "not a url");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(StatusCode::OK));
    }

    #[test]
    fn bytes_body_is_replayed() {
        let mut body = RequestBody::Bytes(Bytes::from_static(b"{}"));
        assert!(body.is_replayable());
        assert!(body.for_attempt().is_some());
        assert!(body.for_attempt().is_some());
    }

    #[test]
    fn one_shot_body_is_taken_once() {
        let mut body = RequestBody::one_shot("payload");
        assert!(!body.is_replayable());
        assert!(body.for_attempt().is_some());
        assert!(body.for_attempt().is_none());
    }

    #[test]
    fn status_error_maps_to_http_stream_error() {
        let err = TransportError::Status {
            status: 401,
            body: "bad key".to_string(),
        };
        assert_eq!(
            StreamError::from(err),
            StreamError::Http {
                status: 401,
                body: "bad key".to_string()
            }
        );
        assert_eq!(
            StreamError::from(TransportError::Cancelled),
            StreamError::Cancelled
        );
        assert!(matches!(
            StreamError::from(TransportError::Timeout(Duration::from_secs(1))),
            StreamError::Transport(_)
        ));
    }

    #[test]
    fn invalid_header_is_a_build_error() {
        let transport = HttpTransport::with_client(
            Client::new(),
            "http://localhost/",
            &TransportConfig::default(),
        );
        assert_eq!(transport.base_url(), "http://localhost");
        let err = transport.header("x-key", "bad\nvalue").unwrap_err();
        assert!(matches!(err, TransportError::Build(_)));
    }

    #[test]
    fn shared_client_is_reused() {
        let config = TransportConfig::default();
        assert!(shared_client(&config).is_ok());
        assert!(shared_client(&config).is_ok());
    }
}
