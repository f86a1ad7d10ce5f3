//! Integration tests running the pipeline against a mock OTLP collector.
//!
//! Registration is process-global, so these tests build registries without
//! registering them; `registration_test.rs` covers `register`.
//!
//! Recording in simple mode, flushing and shutdown all wait on the export
//! workers, so those calls run inside `block_in_place`.

use mock_collector::{MockServer, Protocol as MockProtocol, ServerHandle};
use opentelemetry::KeyValue;
use std::time::Duration;
use telemetry_pipeline::events::{EventDispatcher, FrameworkEvent, TelemetryListener};
use telemetry_pipeline::{
    ExportFallback, ProcessorMode, Protocol, ProviderRegistry, ResourceDetection, Severity, Signal,
    TelemetryBuilder,
};
use tokio::task::block_in_place;

async fn start_collector(protocol: MockProtocol) -> ServerHandle {
    MockServer::builder()
        .protocol(protocol)
        .start()
        .await
        .expect("Failed to start mock collector")
}

fn builder(collector: &ServerHandle) -> TelemetryBuilder {
    TelemetryBuilder::new()
        .endpoint(format!("http://{}", collector.addr()))
        .headers("Authorization=Api-Token secret\nX-Tenant=acme")
        .service_name("checkout")
        .deployment_environment("integration")
        .resource_detection(ResourceDetection::None)
        .metadata_files(Vec::new())
        .fallback(ExportFallback::None)
}

fn registry(builder: TelemetryBuilder) -> ProviderRegistry {
    builder
        .build_registry()
        .expect("valid configuration")
        .expect("pipeline enabled")
}

#[tokio::test(flavor = "multi_thread")]
async fn ten_spans_arrive_as_ten_records() {
    let collector = start_collector(MockProtocol::HttpBinary).await;
    let registry = registry(builder(&collector));
    let tracer = registry.tracer();

    block_in_place(|| {
        for i in 0..10 {
            tracer.in_span(format!("request-{i}"), |span| {
                span.set_attribute(KeyValue::new("iteration", i64::from(i)));
            });
        }
    });

    collector
        .wait_for_spans(10, Duration::from_secs(5))
        .await
        .expect("Should receive all spans");
    collector
        .with_collector(|c| {
            c.expect_span().assert_count(10);
            c.expect_span_with_name("request-0").assert_exists();
            c.expect_span_with_name("request-9").assert_exists();
        })
        .await;

    block_in_place(|| registry.shutdown()).unwrap();
    collector.shutdown().await.expect("Failed to shutdown server");
}

#[tokio::test(flavor = "multi_thread")]
async fn every_signal_reaches_the_collector() {
    let collector = start_collector(MockProtocol::HttpBinary).await;
    let registry = registry(builder(&collector));

    block_in_place(|| {
        registry.tracer().start("checkout").end();
        registry
            .meter()
            .u64_counter("orders")
            .build()
            .add(1, &[KeyValue::new("region", "eu")]);
        registry
            .logger()
            .unwrap()
            .emit(Severity::Info, "order placed", Vec::new());
        registry.shutdown()
    })
    .unwrap();

    collector
        .with_collector(|c| {
            assert_eq!(c.span_count(), 1);
            assert!(c.metric_count() >= 1);
            assert_eq!(c.log_count(), 1);
            c.expect_span_with_name("checkout").assert_exists();
            c.expect_log_with_body("order placed").assert_exists();
        })
        .await;

    collector.shutdown().await.expect("Failed to shutdown server");
}

#[tokio::test(flavor = "multi_thread")]
async fn span_attributes_are_exported() {
    let collector = start_collector(MockProtocol::HttpBinary).await;
    let registry = registry(builder(&collector));

    block_in_place(|| {
        let mut span = registry.tracer().start("GET /orders/{id}");
        span.set_attribute(KeyValue::new("http.route", "/orders/{id}"));
        span.set_attribute(KeyValue::new("url.path", "/orders/17"));
        span.end();
    });

    collector
        .wait_for_spans(1, Duration::from_secs(5))
        .await
        .expect("Should receive the span");
    collector
        .with_collector(|c| {
            c.expect_span_with_name("GET /orders/{id}")
                .with_attributes([("http.route", "/orders/{id}"), ("url.path", "/orders/17")])
                .assert_exists();
        })
        .await;

    block_in_place(|| registry.shutdown()).unwrap();
    collector.shutdown().await.expect("Failed to shutdown server");
}

#[tokio::test(flavor = "multi_thread")]
async fn batched_logs_are_drained_on_shutdown() {
    let collector = start_collector(MockProtocol::HttpBinary).await;
    let registry = registry(builder(&collector));
    let logger = registry.logger().unwrap();

    for i in 0..25 {
        logger.emit(Severity::Warn, format!("line {i}"), Vec::new());
    }
    collector
        .with_collector(|c| {
            assert_eq!(c.log_count(), 0);
        })
        .await;

    block_in_place(|| registry.shutdown()).unwrap();

    collector
        .with_collector(|c| {
            assert_eq!(c.log_count(), 25);
            c.expect_log_with_body("line 0").assert_exists();
            c.expect_log_with_body("line 24").assert_exists();
        })
        .await;
    collector.shutdown().await.expect("Failed to shutdown server");
}

#[tokio::test(flavor = "multi_thread")]
async fn force_flush_exports_batched_traces() {
    let collector = start_collector(MockProtocol::HttpBinary).await;
    let registry =
        registry(builder(&collector).processor_mode(Signal::Traces, ProcessorMode::Batch));

    registry.tracer().start("buffered").end();
    collector
        .with_collector(|c| {
            assert_eq!(c.span_count(), 0);
        })
        .await;

    block_in_place(|| registry.force_flush());

    collector
        .wait_for_spans(1, Duration::from_secs(5))
        .await
        .expect("Flush should export the buffered span");
    collector
        .with_collector(|c| {
            c.expect_span_with_name("buffered").assert_exists();
        })
        .await;

    block_in_place(|| registry.shutdown()).unwrap();
    collector.shutdown().await.expect("Failed to shutdown server");
}

#[tokio::test(flavor = "multi_thread")]
async fn json_protocol_is_accepted_by_json_collector() {
    let collector = start_collector(MockProtocol::HttpJson).await;
    let registry = registry(builder(&collector).protocol(Protocol::HttpJson));

    block_in_place(|| registry.tracer().start("as-json").end());

    collector
        .wait_for_spans(1, Duration::from_secs(5))
        .await
        .expect("Should receive the JSON span");
    collector
        .with_collector(|c| {
            c.expect_span_with_name("as-json").assert_exists();
        })
        .await;

    block_in_place(|| registry.shutdown()).unwrap();
    collector.shutdown().await.expect("Failed to shutdown server");
}

#[tokio::test(flavor = "multi_thread")]
async fn endpoint_without_headers_stays_silent() {
    let collector = start_collector(MockProtocol::HttpBinary).await;
    let builder = TelemetryBuilder::new()
        .endpoint(format!("http://{}", collector.addr()))
        .service_name("checkout")
        .deployment_environment("integration");

    assert!(builder.build_registry().unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(100)).await;
    collector
        .with_collector(|c| {
            assert_eq!(c.span_count(), 0);
            assert_eq!(c.log_count(), 0);
            assert_eq!(c.metric_count(), 0);
        })
        .await;
    collector.shutdown().await.expect("Failed to shutdown server");
}

#[tokio::test(flavor = "multi_thread")]
async fn framework_events_flow_through_the_pipeline() {
    let collector = start_collector(MockProtocol::HttpBinary).await;
    let registry = registry(builder(&collector));
    let mut dispatcher = EventDispatcher::new();
    dispatcher.subscribe(TelemetryListener::new(&registry));

    block_in_place(|| {
        dispatcher.dispatch(&FrameworkEvent::QueryExecuted {
            sql: "select * from orders".into(),
            connection: "primary".into(),
            duration: Duration::from_millis(4),
        });
        dispatcher.dispatch(&FrameworkEvent::HttpClientRequest {
            method: "get".into(),
            url: "https://payments.internal/charges".into(),
            status: Some(200),
            duration: Duration::from_millis(12),
        });
        dispatcher.dispatch(&FrameworkEvent::ExceptionThrown {
            exception_type: "OrderNotFound".into(),
            message: "order 17 does not exist".into(),
        });
        registry.shutdown()
    })
    .unwrap();

    collector
        .with_collector(|c| {
            c.expect_span().assert_count(3);
            c.expect_span_with_name("SELECT")
                .with_attributes([
                    ("db.query.text", "select * from orders"),
                    ("db.namespace", "primary"),
                ])
                .assert_exists();
            c.expect_span_with_name("GET")
                .with_attribute("url.full", "https://payments.internal/charges")
                .assert_exists();
            c.expect_span_with_name("OrderNotFound").assert_exists();
        })
        .await;
    collector.shutdown().await.expect("Failed to shutdown server");
}
