//! Framework lifecycle and watcher events.
//!
//! The host framework publishes [`FrameworkEvent`]s to an
//! [`EventDispatcher`]. [`TelemetryListener`] turns them into spans, metric
//! points and log records through the pipeline's ordinary handles.
//!
//! ```no_run
//! # fn demo(registry: &telemetry_pipeline::ProviderRegistry) {
//! use std::time::Duration;
//! use telemetry_pipeline::events::{EventDispatcher, FrameworkEvent, TelemetryListener};
//!
//! let mut dispatcher = EventDispatcher::new();
//! dispatcher.subscribe(TelemetryListener::new(registry));
//!
//! dispatcher.dispatch(&FrameworkEvent::QueryExecuted {
//!     sql: "select * from users where id = ?".into(),
//!     connection: "primary".into(),
//!     duration: Duration::from_millis(3),
//! });
//! # }
//! ```

use crate::logs::Logger;
use crate::metrics::{Counter, Meter};
use crate::record::Severity;
use crate::registry::ProviderRegistry;
use crate::subscriber::LIFECYCLE_TARGET;
use crate::trace::Tracer;
use opentelemetry::KeyValue;
use opentelemetry::trace::{SpanKind, Status};
use opentelemetry_semantic_conventions::attribute::{
    HTTP_REQUEST_METHOD, HTTP_RESPONSE_STATUS_CODE, URL_FULL,
};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Prefix of the variables forwarded to the serve subprocess.
const PASSTHROUGH_PREFIX: &str = "OTEL_";

/// Name of the cache lookup counter.
pub const CACHE_LOOKUPS_METRIC: &str = "cache.lookups";

/// Kind of cache access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOperation {
    /// Key found.
    Hit,
    /// Key not found.
    Miss,
    /// Key written.
    Write,
    /// Key removed.
    Forget,
}

impl CacheOperation {
    /// Lowercase name used in span names and attributes.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Write => "write",
            Self::Forget => "forget",
        }
    }

    fn is_lookup(&self) -> bool {
        matches!(self, Self::Hit | Self::Miss)
    }
}

/// Events published by the host framework.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum FrameworkEvent {
    /// The application finished booting.
    ApplicationCreated {
        /// Application name.
        name: String,
    },

    /// The serve command is about to start a worker subprocess.
    ServeCommandInvoked {
        /// Listen address.
        host: String,
        /// Listen port.
        port: u16,
    },

    /// A cache store was accessed.
    CacheOperation {
        /// Kind of access.
        operation: CacheOperation,
        /// Cache key.
        key: String,
        /// Store name, if the framework has several.
        store: Option<String>,
        /// Time spent in the store.
        duration: Duration,
    },

    /// A database query completed.
    QueryExecuted {
        /// Query text with placeholders.
        sql: String,
        /// Connection name.
        connection: String,
        /// Execution time.
        duration: Duration,
    },

    /// An outgoing HTTP request completed.
    HttpClientRequest {
        /// Request method.
        method: String,
        /// Full request URL.
        url: String,
        /// Response status; `None` when no response arrived.
        status: Option<u16>,
        /// Round-trip time.
        duration: Duration,
    },

    /// An exception reached the framework's handler.
    ExceptionThrown {
        /// Exception type name.
        exception_type: String,
        /// Exception message.
        message: String,
    },

    /// The framework logger wrote a message.
    LogWritten {
        /// Severity.
        level: Severity,
        /// Message text.
        message: String,
        /// Structured context.
        context: Vec<KeyValue>,
    },
}

/// Receives framework events.
pub trait EventListener: Send + Sync {
    /// Handles one event. Must not panic.
    fn handle(&self, event: &FrameworkEvent);
}

impl<F> EventListener for F
where
    F: Fn(&FrameworkEvent) + Send + Sync,
{
    fn handle(&self, event: &FrameworkEvent) {
        self(event);
    }
}

/// Fans events out to subscribed listeners in subscription order.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    listeners: Vec<Arc<dyn EventListener>>,
}

impl EventDispatcher {
    /// Creates a dispatcher with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener after the existing ones.
    pub fn subscribe(&mut self, listener: impl EventListener + 'static) {
        self.listeners.push(Arc::new(listener));
    }

    /// Delivers `event` to every listener.
    pub fn dispatch(&self, event: &FrameworkEvent) {
        for listener in &self.listeners {
            listener.handle(event);
        }
    }

    /// Number of subscribed listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Whether no listener is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Maps framework events onto traces, metrics and logs.
#[derive(Debug, Clone)]
pub struct TelemetryListener {
    tracer: Tracer,
    logger: Option<Logger>,
    cache_lookups: Counter,
}

impl TelemetryListener {
    /// Creates a listener using the registry's default scope.
    #[must_use]
    pub fn new(registry: &ProviderRegistry) -> Self {
        Self::from_parts(registry.tracer(), &registry.meter(), registry.logger())
    }

    /// Creates a listener from explicit handles.
    #[must_use]
    pub fn from_parts(tracer: Tracer, meter: &Meter, logger: Option<Logger>) -> Self {
        let cache_lookups = meter
            .u64_counter(CACHE_LOOKUPS_METRIC)
            .with_description("Cache lookups by result")
            .with_unit("{lookup}")
            .build();
        Self {
            tracer,
            logger,
            cache_lookups,
        }
    }

    fn client_span(
        &self,
        name: String,
        duration: Duration,
        attributes: Vec<KeyValue>,
        status: Status,
    ) {
        let end = SystemTime::now();
        let start = end.checked_sub(duration).unwrap_or(end);
        let mut span = self
            .tracer
            .span_builder(name)
            .with_kind(SpanKind::Client)
            .with_attributes(attributes)
            .with_start_time(start)
            .start();
        span.set_status(status);
        span.end_with_timestamp(end);
    }
}

impl EventListener for TelemetryListener {
    fn handle(&self, event: &FrameworkEvent) {
        match event {
            FrameworkEvent::ApplicationCreated { name } => {
                tracing::debug!(target: LIFECYCLE_TARGET, application = %name, "Application created");
            }
            FrameworkEvent::ServeCommandInvoked { host, port } => {
                tracing::debug!(
                    target: LIFECYCLE_TARGET,
                    %host,
                    port,
                    forwarded = passthrough_env().len(),
                    "Serve command invoked"
                );
            }
            FrameworkEvent::CacheOperation {
                operation,
                key,
                store,
                duration,
            } => {
                let mut attributes = vec![
                    KeyValue::new("cache.operation", operation.as_str()),
                    KeyValue::new("cache.key", key.clone()),
                ];
                if let Some(store) = store {
                    attributes.push(KeyValue::new("cache.store", store.clone()));
                }
                if operation.is_lookup() {
                    let mut labels = vec![KeyValue::new("cache.result", operation.as_str())];
                    labels.extend(store.iter().map(|s| KeyValue::new("cache.store", s.clone())));
                    self.cache_lookups.add(1, &labels);
                }
                self.client_span(
                    format!("cache {}", operation.as_str()),
                    *duration,
                    attributes,
                    Status::Unset,
                );
            }
            FrameworkEvent::QueryExecuted {
                sql,
                connection,
                duration,
            } => {
                self.client_span(
                    query_span_name(sql),
                    *duration,
                    vec![
                        KeyValue::new("db.query.text", sql.clone()),
                        KeyValue::new("db.namespace", connection.clone()),
                    ],
                    Status::Unset,
                );
            }
            FrameworkEvent::HttpClientRequest {
                method,
                url,
                status,
                duration,
            } => {
                let mut attributes = vec![
                    KeyValue::new(HTTP_REQUEST_METHOD, method.clone()),
                    KeyValue::new(URL_FULL, url.clone()),
                ];
                let span_status = match status {
                    Some(code) => {
                        attributes.push(KeyValue::new(HTTP_RESPONSE_STATUS_CODE, i64::from(*code)));
                        if *code >= 400 {
                            Status::error(code.to_string())
                        } else {
                            Status::Unset
                        }
                    }
                    None => Status::error("no response"),
                };
                self.client_span(method.to_uppercase(), *duration, attributes, span_status);
            }
            FrameworkEvent::ExceptionThrown {
                exception_type,
                message,
            } => {
                let mut span = self.tracer.start(exception_type.clone());
                span.record_exception(exception_type, message);
                span.end();
            }
            FrameworkEvent::LogWritten {
                level,
                message,
                context,
            } => {
                if let Some(logger) = &self.logger {
                    logger.emit(*level, message.clone(), context.clone());
                }
            }
        }
    }
}

/// First keyword of the statement, e.g. `SELECT`, or `query`.
fn query_span_name(sql: &str) -> String {
    sql.split_whitespace()
        .next()
        .filter(|word| word.chars().all(|c| c.is_ascii_alphabetic()))
        .map_or_else(|| "query".to_string(), str::to_ascii_uppercase)
}

/// `OTEL_*` variables of this process, sorted by name.
///
/// The serve command forwards these to its worker subprocess so it exports
/// to the same collector.
#[must_use]
pub fn passthrough_env() -> Vec<(String, String)> {
    filter_passthrough(std::env::vars())
}

fn filter_passthrough(vars: impl IntoIterator<Item = (String, String)>) -> Vec<(String, String)> {
    let mut vars: Vec<_> = vars
        .into_iter()
        .filter(|(name, _)| name.starts_with(PASSTHROUGH_PREFIX))
        .collect();
    vars.sort();
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignalConfig;
    use crate::exporter::SignalExporter;
    use crate::fallback::ExportFallback;
    use crate::logs::LoggerProvider;
    use crate::metrics::MeterProvider;
    use crate::processor::Processor;
    use crate::record::Signal;
    use crate::record::test_support::resource;
    use crate::trace::TracerProvider;
    use crate::transport::test_support::ScriptedTransport;
    use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
    use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
    use opentelemetry_proto::tonic::trace::v1::Span as ProtoSpan;
    use opentelemetry_proto::tonic::trace::v1::span::SpanKind as ProtoSpanKind;
    use opentelemetry_proto::tonic::trace::v1::status::StatusCode;
    use prost::Message;
    use std::sync::Mutex;

    struct Harness {
        listener: TelemetryListener,
        transport: Arc<ScriptedTransport>,
    }

    fn processor(signal: Signal, transport: &Arc<ScriptedTransport>) -> Processor {
        let exporter = SignalExporter::new(signal, format!("http://c{}", signal.otlp_path()), transport.clone())
            .with_fallback(ExportFallback::None);
        Processor::new(exporter, &SignalConfig::simple(), Duration::from_secs(5)).unwrap()
    }

    fn harness() -> Harness {
        let transport = ScriptedTransport::new();
        let tracer = TracerProvider::new(resource(), Some(processor(Signal::Traces, &transport)))
            .tracer("framework");
        let meter = MeterProvider::new(resource(), Some(processor(Signal::Metrics, &transport)))
            .meter("framework");
        let logger = LoggerProvider::new(resource(), Some(processor(Signal::Logs, &transport)))
            .logger("framework");
        Harness {
            listener: TelemetryListener::from_parts(tracer, &meter, Some(logger)),
            transport,
        }
    }

    fn spans(transport: &ScriptedTransport) -> Vec<ProtoSpan> {
        transport
            .sent()
            .iter()
            .filter(|sent| sent.signal == Signal::Traces)
            .flat_map(|sent| {
                ExportTraceServiceRequest::decode(sent.body.as_slice())
                    .unwrap()
                    .resource_spans
            })
            .flat_map(|rs| rs.scope_spans)
            .flat_map(|ss| ss.spans)
            .collect()
    }

    #[test]
    fn dispatcher_preserves_subscription_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = EventDispatcher::new();
        for id in 0..3 {
            let seen = Arc::clone(&seen);
            dispatcher.subscribe(move |_: &FrameworkEvent| seen.lock().unwrap().push(id));
        }

        dispatcher.dispatch(&FrameworkEvent::ApplicationCreated {
            name: "shop".into(),
        });

        assert_eq!(dispatcher.len(), 3);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn query_becomes_client_span_with_duration() {
        let h = harness();

        h.listener.handle(&FrameworkEvent::QueryExecuted {
            sql: "select * from users".into(),
            connection: "primary".into(),
            duration: Duration::from_millis(12),
        });

        let spans = spans(&h.transport);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "SELECT");
        assert_eq!(spans[0].kind, ProtoSpanKind::Client as i32);
        let elapsed = spans[0].end_time_unix_nano - spans[0].start_time_unix_nano;
        assert_eq!(elapsed, 12_000_000);
    }

    #[test]
    fn failed_http_request_marks_span_as_error() {
        let h = harness();

        h.listener.handle(&FrameworkEvent::HttpClientRequest {
            method: "get".into(),
            url: "https://api.example.com/users".into(),
            status: Some(503),
            duration: Duration::from_millis(40),
        });

        let spans = spans(&h.transport);
        assert_eq!(spans[0].name, "GET");
        let status = spans[0].status.as_ref().unwrap();
        assert_eq!(status.code, StatusCode::Error as i32);
        assert!(spans[0]
            .attributes
            .iter()
            .any(|kv| kv.key == HTTP_RESPONSE_STATUS_CODE));
    }

    #[test]
    fn exception_records_exception_event() {
        let h = harness();

        h.listener.handle(&FrameworkEvent::ExceptionThrown {
            exception_type: "RuntimeException".into(),
            message: "boom".into(),
        });

        let spans = spans(&h.transport);
        assert_eq!(spans[0].events.len(), 1);
        assert_eq!(spans[0].events[0].name, "exception");
        assert_eq!(
            spans[0].status.as_ref().unwrap().code,
            StatusCode::Error as i32
        );
    }

    #[test]
    fn cache_lookups_are_counted() {
        let h = harness();

        for operation in [CacheOperation::Hit, CacheOperation::Miss, CacheOperation::Write] {
            h.listener.handle(&FrameworkEvent::CacheOperation {
                operation,
                key: "user:1".into(),
                store: Some("redis".into()),
                duration: Duration::from_micros(200),
            });
        }

        let counted: Vec<_> = h
            .transport
            .sent()
            .iter()
            .filter(|sent| sent.signal == Signal::Metrics)
            .flat_map(|sent| {
                ExportMetricsServiceRequest::decode(sent.body.as_slice())
                    .unwrap()
                    .resource_metrics
            })
            .flat_map(|rm| rm.scope_metrics)
            .flat_map(|sm| sm.metrics)
            .filter(|m| m.name == CACHE_LOOKUPS_METRIC)
            .collect();
        assert_eq!(counted.len(), 2);
        assert_eq!(spans(&h.transport).len(), 3);
    }

    #[test]
    fn log_event_becomes_log_record() {
        let h = harness();

        h.listener.handle(&FrameworkEvent::LogWritten {
            level: Severity::Error,
            message: "payment failed".into(),
            context: vec![KeyValue::new("order", 17_i64)],
        });

        let logs: Vec<_> = h
            .transport
            .sent()
            .into_iter()
            .filter(|sent| sent.signal == Signal::Logs)
            .collect();
        assert_eq!(logs.len(), 1);
    }

    #[test]
    fn lifecycle_events_emit_nothing() {
        let h = harness();

        h.listener.handle(&FrameworkEvent::ApplicationCreated {
            name: "shop".into(),
        });
        h.listener.handle(&FrameworkEvent::ServeCommandInvoked {
            host: "127.0.0.1".into(),
            port: 8000,
        });

        assert_eq!(h.transport.attempts(), 0);
    }

    #[test]
    fn query_span_name_falls_back_for_odd_statements() {
        assert_eq!(query_span_name("  update users set x = 1"), "UPDATE");
        assert_eq!(query_span_name("(select 1)"), "query");
        assert_eq!(query_span_name(""), "query");
    }

    #[test]
    fn passthrough_keeps_only_otel_variables() {
        let vars = vec![
            ("PATH".to_string(), "/bin".to_string()),
            ("OTEL_SERVICE_NAME".to_string(), "shop".to_string()),
            ("OTEL_EXPORTER_OTLP_ENDPOINT".to_string(), "http://c".to_string()),
            ("APP_OTEL_X".to_string(), "no".to_string()),
        ];

        let forwarded = filter_passthrough(vars);

        assert_eq!(
            forwarded,
            vec![
                ("OTEL_EXPORTER_OTLP_ENDPOINT".to_string(), "http://c".to_string()),
                ("OTEL_SERVICE_NAME".to_string(), "shop".to_string()),
            ]
        );
    }

    #[test]
    fn passthrough_reads_process_environment() {
        temp_env::with_var("OTEL_RESOURCE_ATTRIBUTES", Some("team=web"), || {
            assert!(
                passthrough_env()
                    .iter()
                    .any(|(name, value)| name == "OTEL_RESOURCE_ATTRIBUTES" && value == "team=web")
            );
        });
    }
}
