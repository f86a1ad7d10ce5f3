//! Provider lifecycle: setup, registration, propagation and shutdown.
//!
//! [`ProviderRegistry`] is constructed once by the process entry point and
//! handed to whatever creates telemetry. Dropping the [`TelemetryGuard`]
//! returned by [`ProviderRegistry::register`] flushes pending records and
//! shuts every processor down.

use crate::config::PipelineConfig;
use crate::error::ConfigError;
use crate::exporter::SignalExporter;
use crate::fallback::ExportFallback;
use crate::headers::HeaderConfig;
use crate::logs::{Logger, LoggerProvider};
use crate::metrics::{Meter, MeterProvider};
use crate::processor::{Processor, ProviderCore};
use crate::record::Signal;
use crate::resource::ResourceDescriptor;
use crate::trace::{Span, Tracer, TracerProvider};
use crate::transport::{HttpTransport, Transport};
use opentelemetry::Context;
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

static GLOBAL: OnceLock<ProviderRegistry> = OnceLock::new();

/// Owns the providers of every signal, the shared resource and the
/// trace-context propagator.
///
/// Cloning yields another handle to the same registry.
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug)]
struct RegistryInner {
    resource: Arc<ResourceDescriptor>,
    tracer_provider: TracerProvider,
    meter_provider: MeterProvider,
    logger_provider: Option<LoggerProvider>,
    propagator: TraceContextPropagator,
    scope_name: String,
    shut_down: AtomicBool,
}

impl ProviderRegistry {
    /// Builds the pipeline with the OTLP/HTTP transport.
    ///
    /// Returns `Ok(None)` when the endpoint or the header string is not
    /// configured; nothing is constructed in that case.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for an invalid endpoint, malformed headers,
    /// missing service attributes, malformed metadata files, or a worker
    /// thread that cannot start. No provider survives a failed setup.
    pub fn setup(config: &PipelineConfig) -> Result<Option<Self>, ConfigError> {
        Self::setup_with(config, Arc::new(HttpTransport::new()), ExportFallback::default())
    }

    /// Builds the pipeline with a custom transport.
    ///
    /// # Errors
    ///
    /// See [`setup`](Self::setup).
    pub fn setup_with_transport(
        config: &PipelineConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Option<Self>, ConfigError> {
        Self::setup_with(config, transport, ExportFallback::default())
    }

    /// Builds the pipeline with a custom transport and export fallback.
    ///
    /// # Errors
    ///
    /// See [`setup`](Self::setup).
    pub fn setup_with(
        config: &PipelineConfig,
        transport: Arc<dyn Transport>,
        fallback: ExportFallback,
    ) -> Result<Option<Self>, ConfigError> {
        let (Some(url), Some(raw_headers)) = (
            config.endpoint.url.as_deref(),
            config.endpoint.headers.as_deref(),
        ) else {
            tracing::debug!(
                target: "otel_lifecycle",
                endpoint = config.endpoint.url.is_some(),
                headers = config.endpoint.headers.is_some(),
                "Telemetry disabled: endpoint and headers are both required"
            );
            return Ok(None);
        };

        validate_endpoint(url)?;
        let headers = Arc::new(HeaderConfig::parse(raw_headers)?);
        let resource = Arc::new(ResourceDescriptor::build(
            &config.resource,
            &config.resource.metadata_files,
        )?);

        let processor = |signal: Signal| -> Result<Option<Processor>, ConfigError> {
            let signal_config = config.signal(signal);
            if !signal_config.enabled {
                tracing::debug!(target: "otel_lifecycle", %signal, "Signal disabled");
                return Ok(None);
            }
            let Some(exporter) = SignalExporter::from_config(
                signal,
                config,
                Arc::clone(&headers),
                Arc::clone(&transport),
                fallback.clone(),
            ) else {
                return Ok(None);
            };
            Processor::new(exporter, signal_config, config.shutdown_timeout).map(Some)
        };

        let tracer_provider = TracerProvider::new(Arc::clone(&resource), processor(Signal::Traces)?);
        let meter_provider = MeterProvider::new(Arc::clone(&resource), processor(Signal::Metrics)?);
        let logger_provider = processor(Signal::Logs)?
            .map(|p| LoggerProvider::new(Arc::clone(&resource), Some(p)));

        tracing::debug!(
            target: "otel_lifecycle",
            endpoint = url,
            service = resource.service_name().unwrap_or_default(),
            attributes = resource.len(),
            logs = logger_provider.is_some(),
            "Telemetry pipeline configured"
        );

        Ok(Some(Self {
            inner: Arc::new(RegistryInner {
                resource,
                tracer_provider,
                meter_provider,
                logger_provider,
                propagator: TraceContextPropagator::new(),
                scope_name: config.scope_name(),
                shut_down: AtomicBool::new(false),
            }),
        }))
    }

    /// Installs this registry as the process-global entry point.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::AlreadyRegistered`] if any registry has already
    /// been installed in this process.
    pub fn register(&self) -> Result<TelemetryGuard, ConfigError> {
        GLOBAL
            .set(self.clone())
            .map_err(|_| ConfigError::AlreadyRegistered)?;
        tracing::debug!(target: "otel_lifecycle", "Registered provider registry");
        Ok(TelemetryGuard {
            registry: self.clone(),
        })
    }

    /// Shared resource descriptor.
    #[must_use]
    pub fn resource(&self) -> &Arc<ResourceDescriptor> {
        &self.inner.resource
    }

    /// Tracer provider.
    #[must_use]
    pub fn tracer_provider(&self) -> &TracerProvider {
        &self.inner.tracer_provider
    }

    /// Meter provider.
    #[must_use]
    pub fn meter_provider(&self) -> &MeterProvider {
        &self.inner.meter_provider
    }

    /// Logger provider, absent when the log pipeline is disabled.
    #[must_use]
    pub fn logger_provider(&self) -> Option<&LoggerProvider> {
        self.inner.logger_provider.as_ref()
    }

    /// Tracer for the configured instrumentation scope.
    #[must_use]
    pub fn tracer(&self) -> Tracer {
        self.inner.tracer_provider.tracer(self.inner.scope_name.clone())
    }

    /// Meter for the configured instrumentation scope.
    #[must_use]
    pub fn meter(&self) -> Meter {
        self.inner.meter_provider.meter(self.inner.scope_name.clone())
    }

    /// Logger for the configured instrumentation scope.
    #[must_use]
    pub fn logger(&self) -> Option<Logger> {
        self.inner
            .logger_provider
            .as_ref()
            .map(|p| p.logger(self.inner.scope_name.clone()))
    }

    /// Writes W3C `traceparent`/`tracestate` headers for `cx` into `carrier`.
    pub fn inject_context(&self, cx: &Context, carrier: &mut HashMap<String, String>) {
        self.inner.propagator.inject_context(cx, carrier);
    }

    /// Writes propagation headers for `span` into `carrier`.
    pub fn inject_span(&self, span: &Span, carrier: &mut HashMap<String, String>) {
        self.inject_context(&span.context(), carrier);
    }

    /// Reads a remote parent from W3C headers in `carrier`.
    #[must_use]
    pub fn extract_context(&self, carrier: &HashMap<String, String>) -> Context {
        self.inner.propagator.extract(carrier)
    }

    fn cores(&self) -> impl Iterator<Item = (Signal, &ProviderCore)> {
        [
            Some((Signal::Traces, self.inner.tracer_provider.core())),
            self.inner
                .logger_provider
                .as_ref()
                .map(|p| (Signal::Logs, p.core())),
            Some((Signal::Metrics, self.inner.meter_provider.core())),
        ]
        .into_iter()
        .flatten()
    }

    /// Exports buffered records of every signal. Errors are logged.
    pub fn force_flush(&self) {
        for (signal, core) in self.cores() {
            if let Err(e) = core.force_flush() {
                tracing::error!(target: "otel_lifecycle", %signal, error = %e, "Failed to flush");
            }
        }
    }

    /// Flushes and closes every processor.
    ///
    /// Later calls are no-ops returning `Ok`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Shutdown`] for the first processor that did
    /// not shut down cleanly; the others are still shut down.
    pub fn shutdown(&self) -> Result<(), ConfigError> {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut first_error = None;
        for (signal, core) in self.cores() {
            if let Err(source) = core.shutdown() {
                tracing::error!(
                    target: "otel_lifecycle",
                    %signal,
                    error = %source,
                    "Failed to shut down processor"
                );
                first_error.get_or_insert(ConfigError::Shutdown { signal, source });
            }
        }

        tracing::debug!(target: "otel_lifecycle", "Telemetry pipeline shut down");
        first_error.map_or(Ok(()), Err)
    }
}

fn validate_endpoint(url: &str) -> Result<(), ConfigError> {
    match url::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") && parsed.has_host() => Ok(()),
        _ => Err(ConfigError::InvalidEndpoint {
            url: url.to_string(),
        }),
    }
}

/// Shuts the registry down when dropped.
///
/// Keep it alive for the lifetime of the process, typically in `main`.
#[derive(Debug)]
#[must_use = "dropping the guard shuts telemetry down immediately"]
pub struct TelemetryGuard {
    registry: ProviderRegistry,
}

impl TelemetryGuard {
    /// The guarded registry.
    #[must_use]
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Exports buffered records of every signal.
    pub fn flush(&self) {
        self.registry.force_flush();
    }

    /// Shuts down explicitly, returning the first error.
    ///
    /// # Errors
    ///
    /// See [`ProviderRegistry::shutdown`].
    pub fn shutdown(self) -> Result<(), ConfigError> {
        self.registry.shutdown()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Err(e) = self.registry.shutdown() {
            tracing::error!(target: "otel_lifecycle", error = %e, "Failed to shut down telemetry");
        }
    }
}

/// Process-global access for the outermost integration layer.
///
/// Pipeline components never read this; they receive handles explicitly.
pub mod global {
    use super::{GLOBAL, ProviderRegistry};

    /// The registered registry, if [`ProviderRegistry::register`] succeeded.
    #[must_use]
    pub fn registry() -> Option<&'static ProviderRegistry> {
        GLOBAL.get()
    }
}
