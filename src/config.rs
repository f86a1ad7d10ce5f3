//! Configuration types for the telemetry pipeline.
//!
//! These types are designed to be deserialised from multiple sources using
//! figment, supporting layered configuration from defaults, files, and
//! environment variables. See [`TelemetryBuilder`](crate::TelemetryBuilder).

use crate::record::Signal;
use crate::resource::MetadataSource;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// OTLP payload encoding over HTTP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// HTTP with Protocol Buffers encoding.
    #[default]
    #[serde(alias = "http_binary", alias = "http-binary", alias = "http/protobuf")]
    HttpBinary,
    /// HTTP with JSON encoding.
    #[serde(alias = "http_json", alias = "http-json", alias = "http/json")]
    HttpJson,
}

impl Protocol {
    /// Returns the `Content-Type` for payloads of this protocol.
    #[must_use]
    pub fn content_type(&self) -> &'static str {
        match self {
            Protocol::HttpBinary => "application/x-protobuf",
            Protocol::HttpJson => "application/json",
        }
    }

    /// Parses the `OTEL_EXPORTER_OTLP_PROTOCOL` spelling.
    #[must_use]
    pub fn from_env_value(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "http/protobuf" | "http" => Some(Protocol::HttpBinary),
            "http/json" => Some(Protocol::HttpJson),
            _ => None,
        }
    }
}

/// Payload compression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// No compression.
    #[default]
    None,
    /// Gzip, sent with `Content-Encoding: gzip`.
    Gzip,
}

/// How a processor hands records to its exporter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorMode {
    /// Export every record before `record` returns.
    #[default]
    Simple,
    /// Queue records and export from a background worker.
    Batch,
}

/// Which resource detectors run at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceDetection {
    /// Host, OS, process and Rust runtime detectors.
    #[default]
    Auto,
    /// Only configured and file-derived attributes.
    None,
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Endpoint configuration.
    pub endpoint: EndpointConfig,

    /// Resource configuration.
    pub resource: ResourceConfig,

    /// Traces configuration.
    pub traces: SignalConfig,

    /// Metrics configuration.
    pub metrics: SignalConfig,

    /// Logs configuration.
    pub logs: SignalConfig,

    /// Retry policy for failed deliveries.
    pub retry: RetryConfig,

    /// Upper bound on how long shutdown waits for pending exports.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Whether to initialise the tracing subscriber.
    pub init_tracing_subscriber: bool,

    /// Name for the instrumentation scope used by the log bridge.
    /// Defaults to `service_name` if set, otherwise "telemetry-pipeline".
    pub instrumentation_scope_name: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            resource: ResourceConfig::default(),
            traces: SignalConfig::simple(),
            metrics: SignalConfig::simple(),
            logs: SignalConfig::batched(),
            retry: RetryConfig::default(),
            shutdown_timeout: Duration::from_secs(5),
            init_tracing_subscriber: false,
            instrumentation_scope_name: None,
        }
    }
}

impl PipelineConfig {
    /// Whether both the endpoint and the header string are configured.
    ///
    /// The pipeline stays fully disabled unless this holds.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.endpoint.url.is_some() && self.endpoint.headers.is_some()
    }

    /// Returns the endpoint URL for a specific signal, if an endpoint is set.
    #[must_use]
    pub fn signal_endpoint(&self, signal: Signal) -> Option<String> {
        let base = self.endpoint.url.as_deref()?;
        let base = base.trim_end_matches('/');
        Some(format!("{base}{}", signal.otlp_path()))
    }

    /// Returns the configuration of one signal.
    #[must_use]
    pub fn signal(&self, signal: Signal) -> &SignalConfig {
        match signal {
            Signal::Traces => &self.traces,
            Signal::Metrics => &self.metrics,
            Signal::Logs => &self.logs,
        }
    }

    pub(crate) fn scope_name(&self) -> String {
        self.instrumentation_scope_name
            .clone()
            .or_else(|| self.resource.service_name.clone())
            .unwrap_or_else(|| "telemetry-pipeline".to_string())
    }
}

/// Endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// OTLP base URL; signal paths are appended.
    pub url: Option<String>,

    /// Raw newline-delimited `KEY=VALUE` header string.
    pub headers: Option<String>,

    /// Payload encoding.
    pub protocol: Protocol,

    /// Payload compression.
    pub compression: Compression,

    /// Per-request timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: None,
            headers: None,
            protocol: Protocol::default(),
            compression: Compression::default(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Resource configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Service name (`APP_NAME`).
    pub service_name: Option<String>,

    /// Service version (`APP_VERSION`).
    pub service_version: Option<String>,

    /// Deployment environment (`APP_ENV`).
    pub deployment_environment: Option<String>,

    /// Additional resource attributes.
    pub attributes: HashMap<String, String>,

    /// Automatic resource detection.
    pub detection: ResourceDetection,

    /// Metadata property files, merged in order.
    pub metadata_files: Vec<MetadataSource>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            service_name: None,
            service_version: None,
            deployment_environment: None,
            attributes: HashMap::new(),
            detection: ResourceDetection::default(),
            metadata_files: MetadataSource::dynatrace_defaults(),
        }
    }
}

/// Configuration for an individual signal type (traces, metrics, logs).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Whether this signal is enabled.
    pub enabled: bool,

    /// Processor mode.
    pub mode: ProcessorMode,

    /// Batch export configuration, used in [`ProcessorMode::Batch`].
    pub batch: BatchConfig,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self::simple()
    }
}

impl SignalConfig {
    /// An enabled signal exporting synchronously.
    #[must_use]
    pub fn simple() -> Self {
        Self {
            enabled: true,
            mode: ProcessorMode::Simple,
            batch: BatchConfig::default(),
        }
    }

    /// An enabled signal exporting from a background worker.
    #[must_use]
    pub fn batched() -> Self {
        Self {
            enabled: true,
            mode: ProcessorMode::Batch,
            batch: BatchConfig::default(),
        }
    }
}

/// Batch processor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum queued records; further records are dropped.
    pub max_queue_size: usize,

    /// Maximum records per export.
    pub max_export_batch_size: usize,

    /// Maximum time a record waits before its batch is exported.
    #[serde(with = "humantime_serde")]
    pub scheduled_delay: Duration,

    /// Maximum time to wait for a forced flush to complete.
    #[serde(with = "humantime_serde")]
    pub export_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 2048,
            max_export_batch_size: 512,
            scheduled_delay: Duration::from_secs(5),
            export_timeout: Duration::from_secs(30),
        }
    }
}

/// Delivery retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,

    /// Wait before the second attempt; doubles each time.
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Cap on a single wait.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `retry` (1-based).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}
