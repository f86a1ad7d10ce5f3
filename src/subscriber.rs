//! `tracing` integration: console output plus a bridge into the log pipeline.

use crate::error::ConfigError;
use crate::logs::Logger;
use crate::processor::is_export_thread;
use crate::record::Severity;
use opentelemetry::KeyValue;
use std::fmt;
use std::time::SystemTime;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

/// Target used by the pipeline's own lifecycle and delivery diagnostics.
pub const LIFECYCLE_TARGET: &str = "otel_lifecycle";

/// Forwards `tracing` events to a [`Logger`].
///
/// The event's `message` field becomes the record body and the remaining
/// fields become attributes. Events emitted by the pipeline itself, and any
/// event raised on an export worker thread (HTTP client internals, custom
/// transports), are skipped so delivery cannot feed back into the log
/// pipeline.
#[derive(Debug, Clone)]
pub struct LogBridgeLayer {
    logger: Logger,
}

impl LogBridgeLayer {
    /// Creates a bridge emitting through `logger`.
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }
}

impl<S: Subscriber> Layer<S> for LogBridgeLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let target = metadata.target();
        if target == LIFECYCLE_TARGET
            || target.starts_with(env!("CARGO_CRATE_NAME"))
            || is_export_thread()
            || !self.logger.is_enabled()
        {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let mut attributes = visitor.attributes;
        if let Some(module) = metadata.module_path() {
            attributes.push(KeyValue::new("code.namespace", module.to_string()));
        }
        if let Some(line) = metadata.line() {
            attributes.push(KeyValue::new("code.lineno", i64::from(line)));
        }

        self.logger.emit_at(
            SystemTime::now(),
            Severity::from(*metadata.level()),
            visitor.message.unwrap_or_default(),
            attributes,
            None,
        );
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    attributes: Vec<KeyValue>,
}

impl FieldVisitor {
    fn push(&mut self, field: &Field, value: impl Into<opentelemetry::Value>) {
        self.attributes
            .push(KeyValue::new(field.name().to_string(), value.into()));
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.push(field, value.to_string());
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.push(field, value);
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        match i64::try_from(value) {
            Ok(value) => self.push(field, value),
            Err(_) => self.push(field, value.to_string()),
        }
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.push(field, value);
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.push(field, value);
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.push(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let value = format!("{value:?}");
        if field.name() == "message" {
            self.message = Some(value);
        } else {
            self.push(field, value);
        }
    }
}

/// Installs the global `tracing` subscriber.
///
/// Filtering follows `RUST_LOG`, defaulting to `info`. Events are printed
/// to stdout and, when `logger` is given, forwarded to the log pipeline.
///
/// # Errors
///
/// Returns [`ConfigError::TracingSubscriber`] if a global subscriber is
/// already set.
pub fn init_subscriber(logger: Option<Logger>) -> Result<(), ConfigError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .without_time();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(logger.map(LogBridgeLayer::new))
        .try_init()?;

    Ok(())
}
