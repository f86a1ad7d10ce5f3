//! Span creation.
//!
//! ```no_run
//! # fn demo(registry: &telemetry_pipeline::ProviderRegistry) {
//! use opentelemetry::KeyValue;
//! use opentelemetry::trace::SpanKind;
//!
//! let tracer = registry.tracer_provider().tracer("cache");
//! let mut span = tracer
//!     .span_builder("cache.get")
//!     .with_kind(SpanKind::Client)
//!     .start();
//! span.set_attribute(KeyValue::new("cache.key", "user:42"));
//! span.end();
//! # }
//! ```

use crate::processor::{Processor, ProviderCore};
use crate::record::{InstrumentationScope, SpanEvent, SpanRecord};
use crate::resource::ResourceDescriptor;
use opentelemetry::trace::{
    SpanContext, SpanId, SpanKind, Status, TraceContextExt, TraceFlags, TraceId, TraceState,
};
use opentelemetry::{Context, KeyValue};
use std::sync::Arc;
use std::time::SystemTime;

/// Creates [`Tracer`]s bound to the pipeline's resource and trace processor.
#[derive(Debug, Clone)]
pub struct TracerProvider {
    core: Arc<ProviderCore>,
}

impl TracerProvider {
    pub(crate) fn new(resource: Arc<ResourceDescriptor>, processor: Option<Processor>) -> Self {
        Self {
            core: ProviderCore::new(resource, processor),
        }
    }

    /// Returns a tracer for the named instrumentation scope.
    pub fn tracer(&self, name: impl Into<String>) -> Tracer {
        self.tracer_with_scope(InstrumentationScope::new(name))
    }

    /// Returns a tracer for `scope`.
    pub fn tracer_with_scope(&self, scope: InstrumentationScope) -> Tracer {
        Tracer {
            core: Arc::clone(&self.core),
            scope: Arc::new(scope),
        }
    }

    /// The trace processor, if traces are enabled.
    #[must_use]
    pub fn processor(&self) -> Option<&Processor> {
        self.core.processor.as_ref()
    }

    pub(crate) fn core(&self) -> &ProviderCore {
        &self.core
    }
}

/// Starts spans for one instrumentation scope.
#[derive(Debug, Clone)]
pub struct Tracer {
    core: Arc<ProviderCore>,
    scope: Arc<InstrumentationScope>,
}

impl Tracer {
    /// Whether finished spans are exported.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.core.is_enabled()
    }

    /// Starts an internal root span named `name`.
    pub fn start(&self, name: impl Into<String>) -> Span {
        self.span_builder(name).start()
    }

    /// Returns a builder for a span named `name`.
    pub fn span_builder(&self, name: impl Into<String>) -> SpanBuilder {
        SpanBuilder {
            tracer: self.clone(),
            name: name.into(),
            kind: SpanKind::Internal,
            parent: None,
            attributes: Vec::new(),
            start_time: None,
        }
    }

    /// Runs `f` inside a span that ends when `f` returns.
    pub fn in_span<T>(&self, name: impl Into<String>, f: impl FnOnce(&mut Span) -> T) -> T {
        let mut span = self.start(name);
        f(&mut span)
    }
}

/// Configures a span before it starts.
#[derive(Debug)]
pub struct SpanBuilder {
    tracer: Tracer,
    name: String,
    kind: SpanKind,
    parent: Option<SpanContext>,
    attributes: Vec<KeyValue>,
    start_time: Option<SystemTime>,
}

impl SpanBuilder {
    /// Sets the span kind.
    #[must_use]
    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the parent span. Invalid contexts are ignored.
    #[must_use]
    pub fn with_parent(mut self, parent: &SpanContext) -> Self {
        self.parent = parent.is_valid().then(|| parent.clone());
        self
    }

    /// Sets the parent from a propagated [`Context`], e.g. one returned by
    /// [`ProviderRegistry::extract_context`](crate::ProviderRegistry::extract_context).
    #[must_use]
    pub fn with_parent_context(self, cx: &Context) -> Self {
        let parent = cx.span().span_context().clone();
        self.with_parent(&parent)
    }

    /// Adds attributes.
    #[must_use]
    pub fn with_attributes(mut self, attributes: impl IntoIterator<Item = KeyValue>) -> Self {
        self.attributes.extend(attributes);
        self
    }

    /// Overrides the start time, e.g. for an operation that already finished.
    #[must_use]
    pub fn with_start_time(mut self, start_time: SystemTime) -> Self {
        self.start_time = Some(start_time);
        self
    }

    /// Starts the span.
    pub fn start(self) -> Span {
        let (trace_id, parent_span_id) = match &self.parent {
            Some(parent) => (parent.trace_id(), Some(parent.span_id())),
            None => (new_trace_id(), None),
        };
        let start_time = self.start_time.unwrap_or_else(SystemTime::now);

        Span {
            record: Some(SpanRecord {
                trace_id,
                span_id: new_span_id(),
                parent_span_id,
                name: self.name,
                kind: self.kind,
                start_time,
                end_time: start_time,
                status: Status::Unset,
                attributes: self.attributes,
                events: Vec::new(),
                scope: self.tracer.scope,
                resource: Arc::clone(&self.tracer.core.resource),
            }),
            core: self.tracer.core,
        }
    }
}

/// An in-progress span. Ends on [`end`](Self::end) or when dropped.
#[derive(Debug)]
pub struct Span {
    record: Option<SpanRecord>,
    core: Arc<ProviderCore>,
}

impl Span {
    /// Context identifying this span, for parenting and propagation.
    #[must_use]
    pub fn span_context(&self) -> SpanContext {
        match &self.record {
            Some(record) => SpanContext::new(
                record.trace_id,
                record.span_id,
                TraceFlags::SAMPLED,
                false,
                TraceState::default(),
            ),
            None => SpanContext::empty_context(),
        }
    }

    /// Wraps this span's identity in a [`Context`] for propagation.
    #[must_use]
    pub fn context(&self) -> Context {
        Context::new().with_remote_span_context(self.span_context())
    }

    /// Whether the span has not ended yet.
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.record.is_some()
    }

    /// Sets an attribute, replacing a previous value for the same key.
    pub fn set_attribute(&mut self, attribute: KeyValue) {
        if let Some(record) = &mut self.record {
            match record
                .attributes
                .iter_mut()
                .find(|kv| kv.key == attribute.key)
            {
                Some(existing) => *existing = attribute,
                None => record.attributes.push(attribute),
            }
        }
    }

    /// Sets several attributes.
    pub fn set_attributes(&mut self, attributes: impl IntoIterator<Item = KeyValue>) {
        for attribute in attributes {
            self.set_attribute(attribute);
        }
    }

    /// Adds a timestamped event.
    pub fn add_event(&mut self, name: impl Into<String>, attributes: Vec<KeyValue>) {
        if let Some(record) = &mut self.record {
            record.events.push(SpanEvent {
                name: name.into(),
                time: SystemTime::now(),
                attributes,
            });
        }
    }

    /// Records an exception event and marks the span as failed.
    pub fn record_exception(&mut self, exception_type: &str, message: &str) {
        self.add_event(
            "exception",
            vec![
                KeyValue::new("exception.type", exception_type.to_string()),
                KeyValue::new("exception.message", message.to_string()),
            ],
        );
        self.set_status(Status::error(message.to_string()));
    }

    /// Records `err` as an exception using its type name and message.
    pub fn record_error<E: std::error::Error>(&mut self, err: &E) {
        self.record_exception(std::any::type_name::<E>(), &err.to_string());
    }

    /// Sets the status. `Ok` is final; `Unset` is ignored.
    pub fn set_status(&mut self, status: Status) {
        if let Some(record) = &mut self.record
            && record.status != Status::Ok
            && status != Status::Unset
        {
            record.status = status;
        }
    }

    /// Renames the span.
    pub fn update_name(&mut self, name: impl Into<String>) {
        if let Some(record) = &mut self.record {
            record.name = name.into();
        }
    }

    /// Ends the span now.
    pub fn end(&mut self) {
        self.end_with_timestamp(SystemTime::now());
    }

    /// Ends the span at `end_time`. Later calls have no effect.
    pub fn end_with_timestamp(&mut self, end_time: SystemTime) {
        if let Some(mut record) = self.record.take() {
            record.end_time = end_time;
            self.core.emit(record.into());
        }
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        self.end();
    }
}

fn new_trace_id() -> TraceId {
    loop {
        let id = TraceId::from_bytes(rand::random::<[u8; 16]>());
        if id != TraceId::INVALID {
            return id;
        }
    }
}

fn new_span_id() -> SpanId {
    loop {
        let id = SpanId::from_bytes(rand::random::<[u8; 8]>());
        if id != SpanId::INVALID {
            return id;
        }
    }
}
