//! Delivery of encoded payloads to the collector.
//!
//! A [`Transport`] performs one delivery attempt. [`send_with_retry`] wraps
//! any transport with the bounded exponential backoff of [`RetryConfig`] and
//! stops early once the pipeline is cancelled.

use crate::config::RetryConfig;
use crate::error::TransportError;
use crate::headers::HeaderConfig;
use crate::record::Signal;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One encoded payload addressed to one signal endpoint.
#[derive(Debug, Clone, Copy)]
pub struct ExportRequest<'a> {
    /// Full endpoint URL, e.g. `https://collector:4318/v1/traces`.
    pub endpoint: &'a str,
    /// Signal carried by the payload.
    pub signal: Signal,
    /// Encoded body.
    pub body: &'a [u8],
    /// `Content-Type` header value.
    pub content_type: &'static str,
    /// `Content-Encoding` header value, if the body is compressed.
    pub content_encoding: Option<&'static str>,
    /// Configured transport headers.
    pub headers: &'a HeaderConfig,
    /// Per-attempt timeout.
    pub timeout: Duration,
}

/// Sends one encoded payload.
///
/// Implementations perform a single attempt; retries are applied by
/// [`send_with_retry`]. `send` is only ever called from an export worker
/// thread, so blocking I/O is fine.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Delivers `request`.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] describing why delivery failed.
    fn send(&self, request: &ExportRequest<'_>) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, request: &ExportRequest<'_>) -> Result<(), TransportError> {
        (**self).send(request)
    }
}

/// OTLP/HTTP transport backed by a blocking reqwest client.
///
/// The client is created on first use, which happens on the export worker
/// thread.
#[derive(Default)]
pub struct HttpTransport {
    client: OnceLock<Client>,
}

impl HttpTransport {
    /// Creates a transport; the HTTP client is built lazily.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> Result<&Client, TransportError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = Client::builder().build().map_err(TransportError::Client)?;
        Ok(self.client.get_or_init(|| client))
    }
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("initialised", &self.client.get().is_some())
            .finish()
    }
}

impl HttpTransport {
    fn request(&self, request: &ExportRequest<'_>) -> Result<RequestBuilder, TransportError> {
        let mut builder = self
            .client()?
            .post(request.endpoint)
            .header(CONTENT_TYPE, request.content_type)
            .timeout(request.timeout)
            .body(request.body.to_vec());

        if let Some(encoding) = request.content_encoding {
            builder = builder.header(CONTENT_ENCODING, encoding);
        }
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        Ok(builder)
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: &ExportRequest<'_>) -> Result<(), TransportError> {
        let response = self.request(request)?.send()?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().unwrap_or_default();
            Err(TransportError::http(status.as_u16(), body))
        }
    }
}

/// Shared flag that aborts retries once shutdown gives up waiting.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    /// Creates an unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether the flag is set.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Sleeps for `duration` unless cancelled first. Returns `false` if cancelled.
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(CANCEL_POLL_INTERVAL.min(deadline - now));
        }
    }
}

/// Sends `request`, retrying transient failures.
///
/// Network errors, timeouts, 408, 429 and 5xx are retried up to
/// `retry.max_attempts` attempts in total. Any other error is returned
/// immediately.
///
/// # Errors
///
/// Returns the last error, or [`TransportError::Cancelled`] if `cancel` was
/// set before delivery succeeded.
pub fn send_with_retry(
    transport: &dyn Transport,
    request: &ExportRequest<'_>,
    retry: &RetryConfig,
    cancel: &CancellationFlag,
) -> Result<(), TransportError> {
    let max_attempts = retry.max_attempts.max(1);

    for attempt in 0..max_attempts {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let err = match transport.send(request) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        if !err.is_retryable() {
            tracing::warn!(
                target: "otel_lifecycle",
                signal = %request.signal,
                error = %err,
                "Export rejected, not retrying"
            );
            return Err(err);
        }

        tracing::warn!(
            target: "otel_lifecycle",
            signal = %request.signal,
            attempt = attempt + 1,
            max_attempts,
            error = %err,
            "Export attempt failed"
        );

        if attempt + 1 == max_attempts {
            return Err(err);
        }
        if !cancel.sleep(retry.backoff(attempt + 1)) {
            return Err(TransportError::Cancelled);
        }
    }

    Err(TransportError::Cancelled)
}
