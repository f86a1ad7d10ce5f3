//! Per-signal OTLP exporter.

use crate::config::{Compression, PipelineConfig, Protocol, RetryConfig};
use crate::encode::{EncodedBatch, encode_batch};
use crate::fallback::{ExportFailure, ExportFallback};
use crate::headers::HeaderConfig;
use crate::record::{Batch, Signal};
use crate::transport::{CancellationFlag, ExportRequest, Transport, send_with_retry};
use std::sync::Arc;
use std::time::Duration;

/// Counts from one [`SignalExporter::export`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportOutcome {
    /// Records delivered to the collector.
    pub exported: usize,
    /// Records dropped because they could not be encoded.
    pub rejected: usize,
    /// Records lost because delivery failed.
    pub lost: usize,
}

impl ExportOutcome {
    /// Whether delivery failed.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.lost > 0
    }
}

/// Encodes batches of one signal and delivers them to that signal's endpoint.
#[derive(Debug)]
pub struct SignalExporter {
    signal: Signal,
    endpoint: String,
    headers: Arc<HeaderConfig>,
    protocol: Protocol,
    compression: Compression,
    timeout: Duration,
    retry: RetryConfig,
    transport: Arc<dyn Transport>,
    fallback: ExportFallback,
    cancel: CancellationFlag,
}

impl SignalExporter {
    /// Creates an exporter with default protocol, compression, timeout and retry.
    pub fn new(signal: Signal, endpoint: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        let defaults = PipelineConfig::default();
        Self {
            signal,
            endpoint: endpoint.into(),
            headers: Arc::new(HeaderConfig::default()),
            protocol: defaults.endpoint.protocol,
            compression: defaults.endpoint.compression,
            timeout: defaults.endpoint.timeout,
            retry: defaults.retry,
            transport,
            fallback: ExportFallback::default(),
            cancel: CancellationFlag::new(),
        }
    }

    /// Creates the exporter for `signal` from pipeline configuration.
    ///
    /// Returns `None` when no endpoint is configured.
    pub(crate) fn from_config(
        signal: Signal,
        config: &PipelineConfig,
        headers: Arc<HeaderConfig>,
        transport: Arc<dyn Transport>,
        fallback: ExportFallback,
    ) -> Option<Self> {
        let endpoint = config.signal_endpoint(signal)?;
        Some(
            Self::new(signal, endpoint, transport)
                .with_headers(headers)
                .with_protocol(config.endpoint.protocol)
                .with_compression(config.endpoint.compression)
                .with_timeout(config.endpoint.timeout)
                .with_retry(config.retry.clone())
                .with_fallback(fallback),
        )
    }

    /// Sets the transport headers.
    #[must_use]
    pub fn with_headers(mut self, headers: Arc<HeaderConfig>) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the wire encoding.
    #[must_use]
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Sets payload compression.
    #[must_use]
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the fallback for undeliverable requests.
    #[must_use]
    pub fn with_fallback(mut self, fallback: ExportFallback) -> Self {
        self.fallback = fallback;
        self
    }

    pub(crate) fn set_cancellation(&mut self, cancel: CancellationFlag) {
        self.cancel = cancel;
    }

    /// Signal this exporter handles.
    #[must_use]
    pub fn signal(&self) -> Signal {
        self.signal
    }

    /// Full endpoint URL.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Encodes and delivers `batch`.
    ///
    /// Never fails: undeliverable requests go to the fallback and are
    /// reported through the returned counts.
    pub fn export(&self, batch: Batch) -> ExportOutcome {
        let EncodedBatch { request, rejected } = encode_batch(batch);

        for err in &rejected {
            tracing::debug!(
                target: "otel_lifecycle",
                signal = %self.signal,
                error = %err,
                "Dropping record that cannot be encoded"
            );
        }

        let mut outcome = ExportOutcome {
            rejected: rejected.len(),
            ..Default::default()
        };
        let Some(request) = request else {
            return outcome;
        };
        let items = request.item_count();

        let body = match request.to_payload(self.protocol, self.compression) {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(
                    target: "otel_lifecycle",
                    signal = %self.signal,
                    error = %err,
                    "Failed to serialise export request"
                );
                outcome.rejected += items;
                return outcome;
            }
        };

        let export_request = ExportRequest {
            endpoint: &self.endpoint,
            signal: self.signal,
            body: &body,
            content_type: self.protocol.content_type(),
            content_encoding: match self.compression {
                Compression::Gzip => Some("gzip"),
                Compression::None => None,
            },
            headers: &self.headers,
            timeout: self.timeout,
        };

        match send_with_retry(
            self.transport.as_ref(),
            &export_request,
            &self.retry,
            &self.cancel,
        ) {
            Ok(()) => {
                tracing::trace!(
                    target: "otel_lifecycle",
                    signal = %self.signal,
                    items,
                    bytes = body.len(),
                    "Exported batch"
                );
                outcome.exported = items;
            }
            Err(err) => {
                outcome.lost = items;
                self.fallback
                    .handle(ExportFailure::new(err, request, self.endpoint.clone()));
            }
        }

        outcome
    }
}
