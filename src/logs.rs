//! Log record emission.

use crate::processor::{Processor, ProviderCore};
use crate::record::{InstrumentationScope, LogRecord, Severity};
use crate::resource::ResourceDescriptor;
use opentelemetry::KeyValue;
use opentelemetry::trace::SpanContext;
use std::sync::Arc;
use std::time::SystemTime;

/// Creates [`Logger`]s bound to the pipeline's resource and log processor.
#[derive(Debug, Clone)]
pub struct LoggerProvider {
    core: Arc<ProviderCore>,
}

impl LoggerProvider {
    pub(crate) fn new(resource: Arc<ResourceDescriptor>, processor: Option<Processor>) -> Self {
        Self {
            core: ProviderCore::new(resource, processor),
        }
    }

    /// Returns a logger for the named instrumentation scope.
    pub fn logger(&self, name: impl Into<String>) -> Logger {
        Logger {
            core: Arc::clone(&self.core),
            scope: Arc::new(InstrumentationScope::new(name)),
        }
    }

    /// The log processor.
    #[must_use]
    pub fn processor(&self) -> Option<&Processor> {
        self.core.processor.as_ref()
    }

    pub(crate) fn core(&self) -> &ProviderCore {
        &self.core
    }
}

/// Emits log records for one instrumentation scope.
#[derive(Debug, Clone)]
pub struct Logger {
    core: Arc<ProviderCore>,
    scope: Arc<InstrumentationScope>,
}

impl Logger {
    /// Whether emitted records are exported.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.core.is_enabled()
    }

    /// Emits an uncorrelated record.
    pub fn emit(&self, severity: Severity, body: impl Into<String>, attributes: Vec<KeyValue>) {
        self.emit_at(SystemTime::now(), severity, body.into(), attributes, None);
    }

    /// Emits a record correlated with `span`. Invalid contexts are ignored.
    pub fn emit_in_span(
        &self,
        span: &SpanContext,
        severity: Severity,
        body: impl Into<String>,
        attributes: Vec<KeyValue>,
    ) {
        self.emit_at(SystemTime::now(), severity, body.into(), attributes, Some(span));
    }

    pub(crate) fn emit_at(
        &self,
        time: SystemTime,
        severity: Severity,
        body: String,
        attributes: Vec<KeyValue>,
        span: Option<&SpanContext>,
    ) {
        if self.core.processor.is_none() {
            return;
        }
        let span = span.filter(|cx| cx.is_valid());

        self.core.emit(
            LogRecord {
                time,
                observed_time: SystemTime::now(),
                severity,
                body,
                attributes,
                trace_id: span.map(SpanContext::trace_id),
                span_id: span.map(SpanContext::span_id),
                scope: Arc::clone(&self.scope),
                resource: Arc::clone(&self.core.resource),
            }
            .into(),
        );
    }
}
