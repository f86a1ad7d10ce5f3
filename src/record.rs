//! In-memory telemetry records and batches.
//!
//! Records are created by the providers in [`trace`](crate::trace),
//! [`metrics`](crate::metrics) and [`logs`](crate::logs), buffered by a
//! [`Processor`](crate::Processor) and moved into an exporter as a [`Batch`].

use crate::resource::ResourceDescriptor;
use opentelemetry::KeyValue;
use opentelemetry::trace::{SpanId, SpanKind, Status, TraceId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Telemetry signal type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    /// Spans.
    Traces,
    /// Metric data points.
    Metrics,
    /// Log records.
    Logs,
}

impl Signal {
    /// All signals, in setup order.
    pub const ALL: [Signal; 3] = [Signal::Traces, Signal::Metrics, Signal::Logs];

    /// Returns the OTLP HTTP path for this signal.
    #[must_use]
    pub fn otlp_path(&self) -> &'static str {
        match self {
            Self::Traces => "/v1/traces",
            Self::Metrics => "/v1/metrics",
            Self::Logs => "/v1/logs",
        }
    }

    /// Returns the signal name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Traces => "traces",
            Self::Metrics => "metrics",
            Self::Logs => "logs",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name and version of the library that produced a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstrumentationScope {
    /// Scope name, e.g. the watcher or crate name.
    pub name: String,
    /// Optional scope version.
    pub version: Option<String>,
}

impl InstrumentationScope {
    /// Creates a scope without a version.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    /// Sets the scope version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// One record of any signal.
#[derive(Debug, Clone)]
pub enum TelemetryRecord {
    /// A finished span.
    Span(SpanRecord),
    /// A metric data point.
    Metric(MetricPoint),
    /// A log record.
    Log(LogRecord),
}

impl TelemetryRecord {
    /// Signal this record belongs to.
    #[must_use]
    pub fn signal(&self) -> Signal {
        match self {
            Self::Span(_) => Signal::Traces,
            Self::Metric(_) => Signal::Metrics,
            Self::Log(_) => Signal::Logs,
        }
    }

    /// Resource the record was created under.
    #[must_use]
    pub fn resource(&self) -> &Arc<ResourceDescriptor> {
        match self {
            Self::Span(s) => &s.resource,
            Self::Metric(m) => &m.resource,
            Self::Log(l) => &l.resource,
        }
    }

    /// Instrumentation scope of the record.
    #[must_use]
    pub fn scope(&self) -> &Arc<InstrumentationScope> {
        match self {
            Self::Span(s) => &s.scope,
            Self::Metric(m) => &m.scope,
            Self::Log(l) => &l.scope,
        }
    }

    /// Primary timestamp: span end, metric observation, or log time.
    #[must_use]
    pub fn timestamp(&self) -> SystemTime {
        match self {
            Self::Span(s) => s.end_time,
            Self::Metric(m) => m.time,
            Self::Log(l) => l.time,
        }
    }
}

impl From<SpanRecord> for TelemetryRecord {
    fn from(span: SpanRecord) -> Self {
        Self::Span(span)
    }
}

impl From<MetricPoint> for TelemetryRecord {
    fn from(point: MetricPoint) -> Self {
        Self::Metric(point)
    }
}

impl From<LogRecord> for TelemetryRecord {
    fn from(log: LogRecord) -> Self {
        Self::Log(log)
    }
}

/// A finished span.
#[derive(Debug, Clone)]
pub struct SpanRecord {
    /// Trace the span belongs to.
    pub trace_id: TraceId,
    /// Id of this span.
    pub span_id: SpanId,
    /// Parent span, if any.
    pub parent_span_id: Option<SpanId>,
    /// Operation name.
    pub name: String,
    /// Span kind.
    pub kind: SpanKind,
    /// Start time.
    pub start_time: SystemTime,
    /// End time.
    pub end_time: SystemTime,
    /// Final status.
    pub status: Status,
    /// Span attributes.
    pub attributes: Vec<KeyValue>,
    /// Timestamped events, including recorded exceptions.
    pub events: Vec<SpanEvent>,
    /// Producing scope.
    pub scope: Arc<InstrumentationScope>,
    /// Resource at creation time.
    pub resource: Arc<ResourceDescriptor>,
}

/// A timestamped annotation on a span.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanEvent {
    /// Event name.
    pub name: String,
    /// When the event happened.
    pub time: SystemTime,
    /// Event attributes.
    pub attributes: Vec<KeyValue>,
}

/// Numeric value of a metric observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    /// Integer value.
    I64(i64),
    /// Floating point value.
    F64(f64),
}

impl Number {
    /// Whether the value is usable on the wire.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        match self {
            Self::I64(_) => true,
            Self::F64(v) => v.is_finite(),
        }
    }
}

impl From<i64> for Number {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<u64> for Number {
    fn from(v: u64) -> Self {
        Self::I64(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for Number {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

/// Kind and value of a metric observation.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    /// Delta increment of a sum.
    Sum {
        /// Increment.
        value: Number,
        /// Whether the sum only grows (counter) or may shrink.
        monotonic: bool,
    },
    /// Instantaneous value.
    Gauge(Number),
    /// Single observation of a distribution.
    Histogram {
        /// Observed value.
        value: f64,
        /// Explicit bucket boundaries, ascending.
        bounds: Arc<[f64]>,
    },
}

/// A metric data point.
#[derive(Debug, Clone)]
pub struct MetricPoint {
    /// Instrument name.
    pub name: String,
    /// Instrument description.
    pub description: String,
    /// Instrument unit.
    pub unit: String,
    /// Observation.
    pub value: MetricValue,
    /// Point attributes.
    pub attributes: Vec<KeyValue>,
    /// Start of the delta interval (instrument creation for the first point).
    pub start_time: SystemTime,
    /// Observation time.
    pub time: SystemTime,
    /// Producing scope.
    pub scope: Arc<InstrumentationScope>,
    /// Resource at creation time.
    pub resource: Arc<ResourceDescriptor>,
}

/// Log severity, mapped onto OTLP severity numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Trace.
    Trace,
    /// Debug.
    Debug,
    /// Info.
    Info,
    /// Warn.
    Warn,
    /// Error.
    Error,
    /// Fatal.
    Fatal,
}

impl Severity {
    /// OTLP severity number (first number of each range).
    #[must_use]
    pub fn number(&self) -> i32 {
        match self {
            Self::Trace => 1,
            Self::Debug => 5,
            Self::Info => 9,
            Self::Warn => 13,
            Self::Error => 17,
            Self::Fatal => 21,
        }
    }

    /// Severity text.
    #[must_use]
    pub fn text(&self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        }
    }
}

impl From<tracing::Level> for Severity {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => Self::Trace,
            tracing::Level::DEBUG => Self::Debug,
            tracing::Level::INFO => Self::Info,
            tracing::Level::WARN => Self::Warn,
            tracing::Level::ERROR => Self::Error,
        }
    }
}

/// A log record.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// When the event happened.
    pub time: SystemTime,
    /// When the pipeline observed it.
    pub observed_time: SystemTime,
    /// Severity.
    pub severity: Severity,
    /// Message body.
    pub body: String,
    /// Record attributes.
    pub attributes: Vec<KeyValue>,
    /// Trace the record correlates with.
    pub trace_id: Option<TraceId>,
    /// Span the record correlates with.
    pub span_id: Option<SpanId>,
    /// Producing scope.
    pub scope: Arc<InstrumentationScope>,
    /// Resource at creation time.
    pub resource: Arc<ResourceDescriptor>,
}

/// Ordered records of one signal, moved into an exporter as a unit.
#[derive(Debug)]
pub struct Batch {
    signal: Signal,
    records: Vec<TelemetryRecord>,
}

impl Batch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new(signal: Signal) -> Self {
        Self {
            signal,
            records: Vec::new(),
        }
    }

    /// Creates an empty batch with room for `capacity` records.
    #[must_use]
    pub fn with_capacity(signal: Signal, capacity: usize) -> Self {
        Self {
            signal,
            records: Vec::with_capacity(capacity),
        }
    }

    /// Appends a record, handing it back if it belongs to another signal.
    ///
    /// # Errors
    ///
    /// Returns the record unchanged when its signal differs from the batch's.
    pub fn push(&mut self, record: TelemetryRecord) -> Result<(), TelemetryRecord> {
        if record.signal() != self.signal {
            return Err(record);
        }
        self.records.push(record);
        Ok(())
    }

    /// Signal of every record in the batch.
    #[must_use]
    pub fn signal(&self) -> Signal {
        self.signal
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the batch holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterates over the records in accumulation order.
    pub fn iter(&self) -> impl Iterator<Item = &TelemetryRecord> {
        self.records.iter()
    }

    /// Consumes the batch, yielding its records.
    #[must_use]
    pub fn into_records(self) -> Vec<TelemetryRecord> {
        self.records
    }

    pub(crate) fn take(&mut self) -> Batch {
        Batch {
            signal: self.signal,
            records: std::mem::take(&mut self.records),
        }
    }
}
