//! Minimal pipeline setup from the standard environment.
//!
//! Run with:
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:4318 \
//! OTEL_EXPORTER_OTLP_HEADERS='Authorization=Api-Token dev' \
//! APP_NAME=basic-example APP_ENV=development cargo run --example basic

use opentelemetry::KeyValue;
use telemetry_pipeline::{ConfigError, Severity, TelemetryBuilder};

fn main() -> Result<(), ConfigError> {
    // Without an endpoint and headers the pipeline stays off and build returns None.
    let Some(guard) = TelemetryBuilder::new()
        .with_standard_env()
        .with_tracing_subscriber()
        .build()?
    else {
        println!("telemetry disabled");
        return Ok(());
    };

    let registry = guard.registry();
    registry.tracer().in_span("handle-request", |span| {
        span.set_attribute(KeyValue::new("user.id", 42_i64));
        tracing::info!(user_id = 42, "Processing request");
    });

    if let Some(logger) = registry.logger() {
        logger.emit(Severity::Info, "request handled", Vec::new());
    }

    // Dropping the guard flushes batched logs and shuts every processor down.
    Ok(())
}
