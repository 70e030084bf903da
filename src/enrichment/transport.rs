//! HTTP transport seam for the metadata provider client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Cooperative cancellation flag shared between a caller and a running build.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    aborted: Arc<AtomicBool>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// Sleeps in short slices so an abort is noticed promptly.
/// Returns `false` when the signal fired before the full duration elapsed.
pub fn sleep_unless_aborted(duration: Duration, abort: &AbortSignal) -> bool {
    const SLICE: Duration = Duration::from_millis(50);
    let mut remaining = duration;
    while !remaining.is_zero() {
        if abort.is_aborted() {
            return false;
        }
        let step = remaining.min(SLICE);
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
    !abort.is_aborted()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

/// Any completed exchange, including non-2xx statuses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub retry_after_ms: Option<i64>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request aborted")]
    Aborted,
}

/// Blocking GET transport. Implementations must not retry on their own.
pub trait HttpTransport: Send + Sync {
    fn get(&self, request: &HttpRequest, abort: &AbortSignal)
        -> Result<HttpResponse, TransportError>;
}

/// Parses `Retry-After` as delta seconds or an HTTP date.
pub fn parse_retry_after_ms(value: &str, now_unix_ms: i64) -> Option<i64> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(seconds) = trimmed.parse::<f64>() {
        if seconds.is_finite() && seconds >= 0.0 {
            return Some((seconds * 1000.0).round() as i64);
        }
        return None;
    }
    chrono::DateTime::parse_from_rfc2822(trimmed)
        .ok()
        .map(|date| (date.timestamp_millis() - now_unix_ms).max(0))
}

/// Transport backed by a shared `ureq` agent.
pub struct UreqTransport {
    http_client: ureq::Agent,
}

impl UreqTransport {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(connect_timeout)
            .timeout_read(read_timeout)
            .timeout_write(read_timeout)
            .build();
        Self { http_client }
    }

    fn read_response(response: ureq::Response) -> Result<HttpResponse, TransportError> {
        let status = response.status();
        let retry_after_ms = response
            .header("Retry-After")
            .and_then(|value| parse_retry_after_ms(value, crate::now_unix_ms()));
        let body = response
            .into_string()
            .map_err(|error| TransportError::Network(format!("Failed to read response: {error}")))?;
        Ok(HttpResponse {
            status,
            retry_after_ms,
            body,
        })
    }
}

impl HttpTransport for UreqTransport {
    fn get(
        &self,
        request: &HttpRequest,
        abort: &AbortSignal,
    ) -> Result<HttpResponse, TransportError> {
        if abort.is_aborted() {
            return Err(TransportError::Aborted);
        }
        let mut call = self
            .http_client
            .get(&request.url)
            .set("Accept", "application/json");
        for (name, value) in &request.headers {
            call = call.set(name, value);
        }
        let outcome = match call.call() {
            Ok(response) => Self::read_response(response),
            Err(ureq::Error::Status(_, response)) => Self::read_response(response),
            Err(ureq::Error::Transport(transport)) => {
                Err(TransportError::Network(format!("Request failed: {transport}")))
            }
        };
        if abort.is_aborted() {
            return Err(TransportError::Aborted);
        }
        outcome
    }
}
