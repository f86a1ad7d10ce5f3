//! Handling of payloads that could not be delivered.
//!
//! Once [`send_with_retry`](crate::transport::send_with_retry) gives up, the
//! exporter hands the already-encoded request to the configured
//! [`ExportFallback`] so the data can be logged, dumped, or re-routed.
//!
//! ```no_run
//! use telemetry_pipeline::ExportFallback;
//!
//! let fallback = ExportFallback::custom(|failure| {
//!     let bytes = failure.request.to_protobuf();
//!     eprintln!("{} lost ({} bytes): {}", failure.signal(), bytes.len(), failure.error);
//!     Ok(())
//! });
//! ```

use crate::encode::OtlpRequest;
use crate::error::TransportError;
use crate::record::Signal;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

static FILE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A request that exhausted its delivery attempts.
#[derive(Debug)]
pub struct ExportFailure {
    /// Final delivery error.
    pub error: TransportError,
    /// The encoded request that was not delivered.
    pub request: OtlpRequest,
    /// Endpoint the request was addressed to.
    pub endpoint: String,
    /// When delivery was abandoned.
    pub timestamp: SystemTime,
}

impl ExportFailure {
    /// Creates a failure stamped with the current time.
    pub fn new(error: TransportError, request: OtlpRequest, endpoint: impl Into<String>) -> Self {
        Self {
            error,
            request,
            endpoint: endpoint.into(),
            timestamp: SystemTime::now(),
        }
    }

    /// Signal of the lost request.
    #[must_use]
    pub fn signal(&self) -> Signal {
        self.request.signal()
    }

    fn timestamp_ms(&self) -> u128 {
        self.timestamp
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0)
    }

    fn to_json_value(&self) -> serde_json::Result<serde_json::Value> {
        let request = match &self.request {
            OtlpRequest::Traces(req) => serde_json::to_value(req)?,
            OtlpRequest::Metrics(req) => serde_json::to_value(req)?,
            OtlpRequest::Logs(req) => serde_json::to_value(req)?,
        };

        Ok(serde_json::json!({
            "otlp_fallback": {
                "signal": self.signal(),
                "endpoint": self.endpoint,
                "error": self.error.to_string(),
                "item_count": self.request.item_count(),
                "size_bytes": self.request.encoded_len(),
                "timestamp": self.timestamp_ms(),
                "request": request,
            }
        }))
    }
}

/// Receives requests that could not be delivered.
///
/// Errors returned from the handler are logged and otherwise ignored.
pub trait FallbackHandler: Send + Sync {
    /// Handles one lost request.
    ///
    /// # Errors
    ///
    /// Returns an error if the handler itself failed.
    fn handle_failure(&self, failure: ExportFailure) -> HandlerResult;
}

/// What to do with a request that could not be delivered.
#[derive(Clone, Default)]
pub enum ExportFallback {
    /// Discard silently.
    None,
    /// Log a warning on target `otel_lifecycle` without the payload.
    #[default]
    LogError,
    /// Print the request as one JSON line on stdout.
    Stdout,
    /// Print the request as one JSON line on stderr.
    Stderr,
    /// Write the protobuf request into this directory as `{signal}-{ms}-{seq}.pb`.
    File(PathBuf),
    /// Call a custom handler.
    Custom(Arc<dyn FallbackHandler>),
}

impl ExportFallback {
    /// Wraps a closure as a [`Custom`](Self::Custom) fallback.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(ExportFailure) -> HandlerResult + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(ClosureHandler(f)))
    }

    /// Applies the fallback to `failure`.
    pub fn handle(&self, failure: ExportFailure) {
        let result = match self {
            Self::None => Ok(()),
            Self::LogError => {
                tracing::warn!(
                    target: "otel_lifecycle",
                    signal = %failure.signal(),
                    endpoint = %failure.endpoint,
                    item_count = failure.request.item_count(),
                    size_bytes = failure.request.encoded_len(),
                    error = %failure.error,
                    "Export failed, records dropped"
                );
                Ok(())
            }
            Self::Stdout => write_json_line(std::io::stdout().lock(), &failure),
            Self::Stderr => write_json_line(std::io::stderr().lock(), &failure),
            Self::File(dir) => write_protobuf_file(dir, &failure)
                .map(|_| ())
                .map_err(Into::into),
            Self::Custom(handler) => handler.handle_failure(failure),
        };

        if let Err(e) = result {
            tracing::error!(target: "otel_lifecycle", error = %e, "Fallback handler failed");
        }
    }
}

impl fmt::Debug for ExportFallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::LogError => f.write_str("LogError"),
            Self::Stdout => f.write_str("Stdout"),
            Self::Stderr => f.write_str("Stderr"),
            Self::File(dir) => f.debug_tuple("File").field(dir).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

struct ClosureHandler<F>(F);

impl<F> FallbackHandler for ClosureHandler<F>
where
    F: Fn(ExportFailure) -> HandlerResult + Send + Sync,
{
    fn handle_failure(&self, failure: ExportFailure) -> HandlerResult {
        (self.0)(failure)
    }
}

fn write_json_line(mut out: impl Write, failure: &ExportFailure) -> HandlerResult {
    let line = serde_json::to_string(&failure.to_json_value()?)?;
    writeln!(out, "{line}")?;
    Ok(())
}

fn write_protobuf_file(dir: &Path, failure: &ExportFailure) -> Result<PathBuf, std::io::Error> {
    let seq = FILE_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let path = dir.join(format!(
        "{}-{}-{seq}.pb",
        failure.signal(),
        failure.timestamp_ms()
    ));

    std::fs::create_dir_all(dir)?;
    std::fs::write(&path, failure.request.to_protobuf())?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
    use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span};
    use prost::Message;
    use std::sync::Mutex;

    fn traces_request(names: &[&str]) -> OtlpRequest {
        OtlpRequest::Traces(ExportTraceServiceRequest {
            resource_spans: vec![ResourceSpans {
                scope_spans: vec![ScopeSpans {
                    spans: names
                        .iter()
                        .map(|name| Span {
                            name: name.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
        })
    }

    fn failure(names: &[&str]) -> ExportFailure {
        ExportFailure::new(
            TransportError::http(503, "unavailable"),
            traces_request(names),
            "http://collector:4318/v1/traces",
        )
    }

    #[test]
    fn json_line_carries_signal_error_and_payload() {
        let mut out = Vec::new();
        write_json_line(&mut out, &failure(&["lost-span"])).unwrap();

        let line = String::from_utf8(out).unwrap();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        let body = &value["otlp_fallback"];
        assert_eq!(body["signal"], "traces");
        assert_eq!(body["item_count"], 1);
        assert!(body["error"].as_str().unwrap().contains("503"));
        assert!(line.contains("lost-span"));
    }

    #[test]
    fn file_fallback_writes_decodable_protobuf() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_protobuf_file(dir.path(), &failure(&["a", "b"])).unwrap();

        assert!(
            path.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("traces-")
        );
        let bytes = std::fs::read(&path).unwrap();
        let decoded = ExportTraceServiceRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.resource_spans[0].scope_spans[0].spans.len(), 2);
    }

    #[test]
    fn file_variant_writes_one_file_per_failure() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = ExportFallback::File(dir.path().to_path_buf());

        fallback.handle(failure(&["a"]));
        fallback.handle(failure(&["b"]));

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn file_variant_with_missing_directory_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = ExportFallback::File(dir.path().join("missing"));
        fallback.handle(failure(&["a"]));
    }

    #[test]
    fn successive_file_writes_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_protobuf_file(dir.path(), &failure(&["a"])).unwrap();
        let b = write_protobuf_file(dir.path(), &failure(&["b"])).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn custom_fallback_receives_the_request() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let fallback = ExportFallback::custom(move |failure| {
            sink.lock()
                .unwrap()
                .push((failure.signal(), failure.request.item_count()));
            Ok(())
        });

        fallback.handle(failure(&["x", "y", "z"]));

        assert_eq!(*seen.lock().unwrap(), vec![(Signal::Traces, 3)]);
    }

    #[test]
    fn failing_custom_handler_does_not_panic() {
        let fallback = ExportFallback::custom(|_| Err("sink unavailable".into()));
        fallback.handle(failure(&["x"]));
    }

    #[test]
    fn default_fallback_logs() {
        assert!(matches!(ExportFallback::default(), ExportFallback::LogError));
        assert_eq!(format!("{:?}", ExportFallback::custom(|_| Ok(()))), "Custom(..)");
    }
}
