//! Layered configuration and one-call pipeline setup.
//!
//! Sources are merged in order, later sources taking precedence:
//! 1. Compiled defaults
//! 2. An optional TOML file
//! 3. Environment variables (`OTEL_EXPORTER_OTLP_*`, `APP_*`)
//! 4. Programmatic overrides

use crate::config::{Compression, PipelineConfig, ProcessorMode, Protocol, ResourceDetection};
use crate::error::ConfigError;
use crate::fallback::{ExportFailure, ExportFallback};
use crate::record::Signal;
use crate::registry::{ProviderRegistry, TelemetryGuard};
use crate::resource::MetadataSource;
use crate::subscriber::init_subscriber;
use crate::transport::{HttpTransport, Transport};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Builder for configuring and starting the telemetry pipeline.
///
/// # Example
///
/// ```no_run
/// use telemetry_pipeline::{ConfigError, TelemetryBuilder};
///
/// fn main() -> Result<(), ConfigError> {
///     let _guard = TelemetryBuilder::new()
///         .with_file("/etc/app/telemetry.toml")
///         .with_standard_env()
///         .with_tracing_subscriber()
///         .build()?;
///
///     tracing::info!("Application running");
///     Ok(())
/// }
/// ```
#[must_use = "builders do nothing unless .build() is called"]
pub struct TelemetryBuilder {
    figment: Figment,
    fallback: ExportFallback,
    transport: Option<Arc<dyn Transport>>,
    resource_attributes: HashMap<String, String>,
}

impl TelemetryBuilder {
    /// Creates a builder holding only the compiled defaults.
    ///
    /// Defaults leave the pipeline disabled: no endpoint and no headers.
    pub fn new() -> Self {
        Self::from_figment(Figment::from(Serialized::defaults(PipelineConfig::default())))
    }

    /// Creates a builder from an existing figment.
    ///
    /// ```no_run
    /// use figment::{Figment, providers::{Format, Toml}};
    /// use telemetry_pipeline::{PipelineConfig, TelemetryBuilder};
    /// use figment::providers::Serialized;
    ///
    /// let figment = Figment::from(Serialized::defaults(PipelineConfig::default()))
    ///     .merge(Toml::file("/etc/telemetry-defaults.toml"));
    ///
    /// let builder = TelemetryBuilder::from_figment(figment).with_standard_env();
    /// ```
    pub fn from_figment(figment: Figment) -> Self {
        Self {
            figment,
            fallback: ExportFallback::default(),
            transport: None,
            resource_attributes: HashMap::new(),
        }
    }

    /// Merges configuration from a TOML file. A missing file is skipped.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            self.figment = self.figment.merge(Toml::file(path));
        } else {
            tracing::debug!(
                target: "otel_lifecycle",
                path = %path.display(),
                "Configuration file not found, skipping"
            );
        }
        self
    }

    /// Merges prefixed environment variables, nesting on `__`.
    ///
    /// With prefix `TELEMETRY_`:
    /// - `TELEMETRY_ENDPOINT__URL` → `endpoint.url`
    /// - `TELEMETRY_LOGS__MODE` → `logs.mode`
    /// - `TELEMETRY_RESOURCE__SERVICE_NAME` → `resource.service_name`
    pub fn with_env(mut self, prefix: &str) -> Self {
        self.figment = self.figment.merge(Env::prefixed(prefix).split("__"));
        self
    }

    /// Merges the standard variables.
    ///
    /// - `OTEL_EXPORTER_OTLP_ENDPOINT` → endpoint URL
    /// - `OTEL_EXPORTER_OTLP_HEADERS` → newline-delimited headers
    /// - `OTEL_EXPORTER_OTLP_PROTOCOL` → `http/protobuf` or `http/json`
    /// - `OTEL_EXPORTER_OTLP_COMPRESSION` → `gzip` or `none`
    /// - `OTEL_EXPORTER_OTLP_TIMEOUT` → request timeout in milliseconds
    /// - `OTEL_SERVICE_NAME`, then `APP_NAME` → service name
    /// - `APP_ENV` → deployment environment
    /// - `APP_VERSION` → service version
    /// - `OTEL_{TRACES,METRICS,LOGS}_EXPORTER=none` → disables that signal
    ///
    /// Empty variables are treated as unset. Unrecognised protocol,
    /// compression or timeout values are logged and ignored.
    pub fn with_standard_env(mut self) -> Self {
        if let Some(endpoint) = env_value("OTEL_EXPORTER_OTLP_ENDPOINT") {
            self = self.set("endpoint.url", endpoint);
        }

        if let Some(headers) = env_value("OTEL_EXPORTER_OTLP_HEADERS") {
            self = self.set("endpoint.headers", headers);
        }

        if let Some(value) = env_value("OTEL_EXPORTER_OTLP_PROTOCOL") {
            match Protocol::from_env_value(&value) {
                Some(protocol) => self = self.protocol(protocol),
                None => ignored("OTEL_EXPORTER_OTLP_PROTOCOL", &value),
            }
        }

        if let Some(value) = env_value("OTEL_EXPORTER_OTLP_COMPRESSION") {
            match value.to_lowercase().as_str() {
                "gzip" => self = self.compression(Compression::Gzip),
                "none" => self = self.compression(Compression::None),
                _ => ignored("OTEL_EXPORTER_OTLP_COMPRESSION", &value),
            }
        }

        if let Some(value) = env_value("OTEL_EXPORTER_OTLP_TIMEOUT") {
            match value.parse::<u64>() {
                Ok(ms) => self = self.timeout(Duration::from_millis(ms)),
                Err(_) => ignored("OTEL_EXPORTER_OTLP_TIMEOUT", &value),
            }
        }

        for var in ["OTEL_SERVICE_NAME", "APP_NAME"] {
            if let Some(name) = env_value(var) {
                self = self.service_name(name);
            }
        }

        if let Some(env) = env_value("APP_ENV") {
            self = self.deployment_environment(env);
        }

        if let Some(version) = env_value("APP_VERSION") {
            self = self.service_version(version);
        }

        for (var, signal) in [
            ("OTEL_TRACES_EXPORTER", Signal::Traces),
            ("OTEL_METRICS_EXPORTER", Signal::Metrics),
            ("OTEL_LOGS_EXPORTER", Signal::Logs),
        ] {
            if let Some(exporter) = env_value(var) {
                self = self.signal_enabled(signal, exporter != "none");
            }
        }

        self
    }

    fn set<T: serde::Serialize>(mut self, key: &str, value: T) -> Self {
        self.figment = self.figment.merge(Serialized::default(key, value));
        self
    }

    /// Sets the OTLP base URL. Signal paths are appended.
    pub fn endpoint(self, url: impl Into<String>) -> Self {
        self.set("endpoint.url", url.into())
    }

    /// Sets the raw newline-delimited `KEY=VALUE` header string.
    pub fn headers(self, raw: impl Into<String>) -> Self {
        self.set("endpoint.headers", raw.into())
    }

    /// Sets the payload encoding.
    pub fn protocol(self, protocol: Protocol) -> Self {
        self.set("endpoint.protocol", protocol)
    }

    /// Sets the payload compression.
    pub fn compression(self, compression: Compression) -> Self {
        self.set("endpoint.compression", compression)
    }

    /// Sets the per-request timeout.
    pub fn timeout(self, timeout: Duration) -> Self {
        self.set("endpoint.timeout", humantime_serde::Serde::from(timeout))
    }

    /// Sets `service.name`.
    pub fn service_name(self, name: impl Into<String>) -> Self {
        self.set("resource.service_name", name.into())
    }

    /// Sets `service.version`.
    pub fn service_version(self, version: impl Into<String>) -> Self {
        self.set("resource.service_version", version.into())
    }

    /// Sets `deployment.environment.name`.
    pub fn deployment_environment(self, env: impl Into<String>) -> Self {
        self.set("resource.deployment_environment", env.into())
    }

    /// Adds a resource attribute.
    pub fn resource_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.resource_attributes.insert(key.into(), value.into());
        self
    }

    /// Selects the resource detectors.
    pub fn resource_detection(self, detection: ResourceDetection) -> Self {
        self.set("resource.detection", detection)
    }

    /// Replaces the metadata files merged into the resource.
    pub fn metadata_files(self, sources: Vec<MetadataSource>) -> Self {
        self.set("resource.metadata_files", sources)
    }

    /// Enables or disables trace export.
    pub fn traces(self, enabled: bool) -> Self {
        self.signal_enabled(Signal::Traces, enabled)
    }

    /// Enables or disables metric export.
    pub fn metrics(self, enabled: bool) -> Self {
        self.signal_enabled(Signal::Metrics, enabled)
    }

    /// Enables or disables log export.
    pub fn logs(self, enabled: bool) -> Self {
        self.signal_enabled(Signal::Logs, enabled)
    }

    fn signal_enabled(self, signal: Signal, enabled: bool) -> Self {
        self.set(&format!("{signal}.enabled"), enabled)
    }

    /// Sets the processor mode of one signal.
    pub fn processor_mode(self, signal: Signal, mode: ProcessorMode) -> Self {
        self.set(&format!("{signal}.mode"), mode)
    }

    /// Sets the upper bound on shutdown.
    pub fn shutdown_timeout(self, timeout: Duration) -> Self {
        self.set("shutdown_timeout", humantime_serde::Serde::from(timeout))
    }

    /// Installs the global `tracing` subscriber during [`build`](Self::build).
    pub fn with_tracing_subscriber(self) -> Self {
        self.set("init_tracing_subscriber", true)
    }

    /// Sets the instrumentation scope name.
    ///
    /// Defaults to the service name, then "telemetry-pipeline".
    pub fn instrumentation_scope_name(self, name: impl Into<String>) -> Self {
        self.set("instrumentation_scope_name", name.into())
    }

    /// Sets what happens to requests that could not be delivered.
    pub fn fallback(mut self, fallback: ExportFallback) -> Self {
        self.fallback = fallback;
        self
    }

    /// Sets a custom fallback closure.
    ///
    /// ```no_run
    /// use telemetry_pipeline::{ConfigError, TelemetryBuilder};
    ///
    /// let _guard = TelemetryBuilder::new()
    ///     .with_standard_env()
    ///     .with_fallback(|failure| {
    ///         eprintln!("lost {} items: {}", failure.request.item_count(), failure.error);
    ///         Ok(())
    ///     })
    ///     .build()?;
    /// # Ok::<(), ConfigError>(())
    /// ```
    pub fn with_fallback<F>(mut self, f: F) -> Self
    where
        F: Fn(ExportFailure) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        self.fallback = ExportFallback::custom(f);
        self
    }

    /// Replaces the OTLP/HTTP transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Extracts the merged configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Extract`] if a source cannot be deserialised.
    pub fn extract_config(&self) -> Result<PipelineConfig, ConfigError> {
        let mut config: PipelineConfig = self.figment.extract()?;
        config
            .resource
            .attributes
            .extend(self.resource_attributes.clone());
        Ok(config)
    }

    /// Builds the registry without registering it.
    ///
    /// # Errors
    ///
    /// See [`ProviderRegistry::setup`].
    pub fn build_registry(&self) -> Result<Option<ProviderRegistry>, ConfigError> {
        self.setup(&self.extract_config()?)
    }

    fn setup(&self, config: &PipelineConfig) -> Result<Option<ProviderRegistry>, ConfigError> {
        let transport = match &self.transport {
            Some(transport) => Arc::clone(transport),
            None => Arc::new(HttpTransport::new()),
        };
        ProviderRegistry::setup_with(config, transport, self.fallback.clone())
    }

    /// Builds, registers and optionally installs the `tracing` subscriber.
    ///
    /// Returns `Ok(None)` when the endpoint or headers are not configured.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration extraction or setup fails, if a
    /// registry is already registered, or if the subscriber cannot be
    /// installed.
    pub fn build(self) -> Result<Option<TelemetryGuard>, ConfigError> {
        let config = self.extract_config()?;
        let Some(registry) = self.setup(&config)? else {
            return Ok(None);
        };

        let guard = registry.register()?;
        if config.init_tracing_subscriber {
            init_subscriber(registry.logger())?;
        }

        Ok(Some(guard))
    }
}

impl Default for TelemetryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn ignored(var: &str, value: &str) {
    tracing::warn!(target: "otel_lifecycle", var, value, "Ignoring unrecognised value");
}

#[cfg(test)]
mod tests {
    use super::*;

    const STANDARD_VARS: [&str; 12] = [
        "OTEL_EXPORTER_OTLP_ENDPOINT",
        "OTEL_EXPORTER_OTLP_HEADERS",
        "OTEL_EXPORTER_OTLP_PROTOCOL",
        "OTEL_EXPORTER_OTLP_COMPRESSION",
        "OTEL_EXPORTER_OTLP_TIMEOUT",
        "OTEL_SERVICE_NAME",
        "APP_NAME",
        "APP_ENV",
        "APP_VERSION",
        "OTEL_TRACES_EXPORTER",
        "OTEL_METRICS_EXPORTER",
        "OTEL_LOGS_EXPORTER",
    ];

    fn with_env<F: FnOnce()>(vars: &[(&str, &str)], f: F) {
        let mut all: Vec<(&str, Option<&str>)> = STANDARD_VARS.iter().map(|v| (*v, None)).collect();
        for (name, value) in vars {
            all.retain(|(n, _)| n != name);
            all.push((*name, Some(*value)));
        }
        temp_env::with_vars(all, f);
    }

    #[test]
    fn defaults_are_disabled() {
        with_env(&[], || {
            let config = TelemetryBuilder::new().with_standard_env().extract_config().unwrap();
            assert!(!config.is_enabled());
            assert!(config.traces.enabled);
            assert!(!config.init_tracing_subscriber);
        });
    }

    #[test]
    fn standard_env_populates_endpoint_and_resource() {
        with_env(
            &[
                ("OTEL_EXPORTER_OTLP_ENDPOINT", "https://collector:4318"),
                ("OTEL_EXPORTER_OTLP_HEADERS", "Authorization=Api-Token abc"),
                ("APP_NAME", "checkout"),
                ("APP_ENV", "production"),
                ("APP_VERSION", "1.4.2"),
            ],
            || {
                let config = TelemetryBuilder::new().with_standard_env().extract_config().unwrap();
                assert!(config.is_enabled());
                assert_eq!(config.endpoint.url.as_deref(), Some("https://collector:4318"));
                assert_eq!(config.resource.service_name.as_deref(), Some("checkout"));
                assert_eq!(
                    config.resource.deployment_environment.as_deref(),
                    Some("production")
                );
                assert_eq!(config.resource.service_version.as_deref(), Some("1.4.2"));
            },
        );
    }

    #[test]
    fn endpoint_alone_leaves_pipeline_disabled() {
        with_env(&[("OTEL_EXPORTER_OTLP_ENDPOINT", "https://collector:4318")], || {
            let builder = TelemetryBuilder::new().with_standard_env();
            assert!(!builder.extract_config().unwrap().is_enabled());
            assert!(builder.build_registry().unwrap().is_none());
        });
    }

    #[test]
    fn empty_headers_variable_counts_as_unset() {
        with_env(
            &[
                ("OTEL_EXPORTER_OTLP_ENDPOINT", "https://collector:4318"),
                ("OTEL_EXPORTER_OTLP_HEADERS", "  "),
            ],
            || {
                let config = TelemetryBuilder::new().with_standard_env().extract_config().unwrap();
                assert_eq!(config.endpoint.headers, None);
            },
        );
    }

    #[test]
    fn protocol_compression_and_timeout_are_parsed() {
        with_env(
            &[
                ("OTEL_EXPORTER_OTLP_PROTOCOL", "http/json"),
                ("OTEL_EXPORTER_OTLP_COMPRESSION", "gzip"),
                ("OTEL_EXPORTER_OTLP_TIMEOUT", "2500"),
            ],
            || {
                let config = TelemetryBuilder::new().with_standard_env().extract_config().unwrap();
                assert_eq!(config.endpoint.protocol, Protocol::HttpJson);
                assert_eq!(config.endpoint.compression, Compression::Gzip);
                assert_eq!(config.endpoint.timeout, Duration::from_millis(2500));
            },
        );
    }

    #[test]
    fn unrecognised_values_are_ignored() {
        with_env(
            &[
                ("OTEL_EXPORTER_OTLP_PROTOCOL", "grpc"),
                ("OTEL_EXPORTER_OTLP_TIMEOUT", "soon"),
            ],
            || {
                let config = TelemetryBuilder::new().with_standard_env().extract_config().unwrap();
                assert_eq!(config.endpoint.protocol, Protocol::HttpBinary);
                assert_eq!(config.endpoint.timeout, Duration::from_secs(10));
            },
        );
    }

    #[test]
    fn exporter_none_disables_signals() {
        with_env(
            &[
                ("OTEL_TRACES_EXPORTER", "otlp"),
                ("OTEL_METRICS_EXPORTER", "none"),
                ("OTEL_LOGS_EXPORTER", "none"),
            ],
            || {
                let config = TelemetryBuilder::new().with_standard_env().extract_config().unwrap();
                assert!(config.traces.enabled);
                assert!(!config.metrics.enabled);
                assert!(!config.logs.enabled);
            },
        );
    }

    #[test]
    fn app_name_wins_over_otel_service_name() {
        with_env(
            &[("OTEL_SERVICE_NAME", "from-otel"), ("APP_NAME", "from-app")],
            || {
                let config = TelemetryBuilder::new().with_standard_env().extract_config().unwrap();
                assert_eq!(config.resource.service_name.as_deref(), Some("from-app"));
            },
        );
    }

    #[test]
    fn programmatic_overrides_env() {
        with_env(&[("APP_NAME", "env-service")], || {
            let config = TelemetryBuilder::new()
                .with_standard_env()
                .service_name("programmatic")
                .extract_config()
                .unwrap();
            assert_eq!(config.resource.service_name.as_deref(), Some("programmatic"));
        });
    }

    #[test]
    fn file_layer_is_applied_and_env_overrides_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.toml");
        std::fs::write(
            &path,
            r#"
shutdown_timeout = "2s"

[endpoint]
url = "http://from-file:4318"
compression = "gzip"

[logs]
mode = "simple"
"#,
        )
        .unwrap();

        with_env(&[("OTEL_EXPORTER_OTLP_ENDPOINT", "http://from-env:4318")], || {
            let config = TelemetryBuilder::new()
                .with_file(&path)
                .with_standard_env()
                .extract_config()
                .unwrap();
            assert_eq!(config.endpoint.url.as_deref(), Some("http://from-env:4318"));
            assert_eq!(config.endpoint.compression, Compression::Gzip);
            assert_eq!(config.logs.mode, ProcessorMode::Simple);
            assert_eq!(config.shutdown_timeout, Duration::from_secs(2));
        });
    }

    #[test]
    fn missing_file_is_skipped() {
        let config = TelemetryBuilder::new()
            .with_file("/nonexistent/telemetry.toml")
            .extract_config()
            .unwrap();
        assert_eq!(config.endpoint.url, None);
    }

    #[test]
    fn prefixed_env_nests_on_double_underscore() {
        temp_env::with_vars(
            [
                ("TPTEST_RESOURCE__SERVICE_NAME", Some("nested")),
                ("TPTEST_METRICS__MODE", Some("batch")),
            ],
            || {
                let config = TelemetryBuilder::new().with_env("TPTEST_").extract_config().unwrap();
                assert_eq!(config.resource.service_name.as_deref(), Some("nested"));
                assert_eq!(config.metrics.mode, ProcessorMode::Batch);
            },
        );
    }

    #[test]
    fn setters_reach_the_config() {
        let config = TelemetryBuilder::new()
            .endpoint("http://collector:4318")
            .headers("Authorization=Api-Token abc")
            .timeout(Duration::from_millis(750))
            .processor_mode(Signal::Traces, ProcessorMode::Batch)
            .resource_detection(ResourceDetection::None)
            .metadata_files(Vec::new())
            .resource_attribute("team", "payments")
            .logs(false)
            .with_tracing_subscriber()
            .extract_config()
            .unwrap();

        assert!(config.is_enabled());
        assert_eq!(config.endpoint.timeout, Duration::from_millis(750));
        assert_eq!(config.traces.mode, ProcessorMode::Batch);
        assert_eq!(config.resource.detection, ResourceDetection::None);
        assert!(config.resource.metadata_files.is_empty());
        assert_eq!(
            config.resource.attributes.get("team").map(String::as_str),
            Some("payments")
        );
        assert!(!config.logs.enabled);
        assert!(config.init_tracing_subscriber);
    }

    #[test]
    fn custom_fallback_is_stored() {
        let builder = TelemetryBuilder::new().with_fallback(|_failure| Ok(()));
        assert!(matches!(builder.fallback, ExportFallback::Custom(_)));
    }
}
