//! Layered configuration: defaults, file, environment, then code.
//!
//! Run with: APP_NAME=env-override cargo run --example configuration_layers

use std::time::Duration;
use telemetry_pipeline::events::{EventDispatcher, FrameworkEvent, TelemetryListener};
use telemetry_pipeline::{Compression, ConfigError, ProcessorMode, Signal, TelemetryBuilder};

fn main() -> Result<(), ConfigError> {
    let builder = TelemetryBuilder::new()
        .with_file("telemetry.toml")
        .with_standard_env()
        .endpoint("http://localhost:4318")
        .headers("Authorization=Api-Token dev\nX-Team=platform")
        .deployment_environment("development")
        .service_version("1.0.0")
        .resource_attribute("custom.team", "platform")
        .compression(Compression::Gzip)
        .processor_mode(Signal::Traces, ProcessorMode::Batch)
        .metrics(false);

    let config = builder.extract_config()?;
    println!("Effective endpoint: {:?}", config.endpoint.url);
    println!("Service name: {:?}", config.resource.service_name);
    println!("Traces: {:?}", config.traces.mode);
    println!("Metrics enabled: {}", config.metrics.enabled);
    println!("Logs enabled: {}", config.logs.enabled);

    let Some(registry) = builder.build_registry()? else {
        return Ok(());
    };

    let mut dispatcher = EventDispatcher::new();
    dispatcher.subscribe(TelemetryListener::new(&registry));
    dispatcher.dispatch(&FrameworkEvent::HttpClientRequest {
        method: "GET".into(),
        url: "https://api.example.com/health".into(),
        status: Some(200),
        duration: Duration::from_millis(18),
    });

    registry.shutdown()
}
