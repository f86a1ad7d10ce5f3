//! Telemetry export pipeline for web-framework instrumentation.
//!
//! Records produced through [`Tracer`], [`Meter`] and [`Logger`] handles are
//! buffered per signal, encoded as OTLP (protobuf or JSON) and delivered to
//! a collector over HTTP with retry. The pipeline stays fully disabled
//! unless both an endpoint and a header string are configured.
//!
//! # Example
//!
//! ```no_run
//! use telemetry_pipeline::{ConfigError, TelemetryBuilder};
//!
//! fn main() -> Result<(), ConfigError> {
//!     let Some(guard) = TelemetryBuilder::new().with_standard_env().build()? else {
//!         return Ok(());
//!     };
//!
//!     let tracer = guard.registry().tracer();
//!     tracer.in_span("startup", |_span| {
//!         // ...
//!     });
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod builder;
mod config;
mod encode;
mod error;
pub mod events;
mod exporter;
mod fallback;
mod headers;
mod logs;
mod metrics;
mod processor;
mod record;
mod registry;
mod resource;
mod subscriber;
mod trace;
mod transport;

pub use builder::TelemetryBuilder;
pub use config::{
    BatchConfig, Compression, EndpointConfig, PipelineConfig, ProcessorMode, Protocol,
    ResourceConfig, ResourceDetection, RetryConfig, SignalConfig,
};
pub use encode::{EncodedBatch, OtlpRequest, encode_batch, validate};
pub use error::{ConfigError, EncodeError, ProcessorError, TransportError};
pub use exporter::{ExportOutcome, SignalExporter};
pub use fallback::{ExportFailure, ExportFallback, FallbackHandler};
pub use headers::HeaderConfig;
pub use logs::{Logger, LoggerProvider};
pub use metrics::{
    Counter, DEFAULT_HISTOGRAM_BOUNDARIES, Gauge, Histogram, InstrumentBuilder, Meter,
    MeterProvider, UpDownCounter,
};
pub use processor::{Processor, ProcessorState, ProcessorStats};
pub use record::{
    Batch, InstrumentationScope, LogRecord, MetricPoint, MetricValue, Number, Severity, Signal,
    SpanEvent, SpanRecord, TelemetryRecord,
};
pub use registry::{ProviderRegistry, TelemetryGuard, global};
pub use resource::{MetadataSource, ResourceDescriptor, parse_properties};
pub use subscriber::{LIFECYCLE_TARGET, LogBridgeLayer, init_subscriber};
pub use trace::{Span, SpanBuilder, Tracer, TracerProvider};
pub use transport::{CancellationFlag, ExportRequest, HttpTransport, Transport, send_with_retry};

/// Re-exported for version compatibility with this crate's dependencies.
pub use opentelemetry;
/// Re-exported for version compatibility with this crate's dependencies.
pub use tracing;

/// Re-exported for users who want to construct custom configuration providers.
pub use figment;
