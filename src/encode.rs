//! OTLP encoding of record batches.
//!
//! Records are grouped by resource and instrumentation scope in first-seen
//! order and converted to the standard OTLP collector requests from
//! `opentelemetry-proto`, so payloads are byte-compatible with any OTLP/HTTP
//! collector.

use crate::config::{Compression, Protocol};
use crate::error::EncodeError;
use crate::record::{
    Batch, InstrumentationScope, LogRecord, MetricPoint, MetricValue, Number, Signal, SpanRecord,
    TelemetryRecord,
};
use crate::resource::ResourceDescriptor;
use opentelemetry::trace::{SpanId, SpanKind, Status, TraceId};
use opentelemetry::{Array, KeyValue, Value};
use opentelemetry_proto::tonic::collector::{
    logs::v1::ExportLogsServiceRequest, metrics::v1::ExportMetricsServiceRequest,
    trace::v1::ExportTraceServiceRequest,
};
use opentelemetry_proto::tonic::common::v1::{
    AnyValue, ArrayValue, InstrumentationScope as ProtoScope, KeyValue as ProtoKeyValue,
    any_value,
};
use opentelemetry_proto::tonic::logs::v1::{
    LogRecord as ProtoLogRecord, ResourceLogs, ScopeLogs,
};
use opentelemetry_proto::tonic::metrics::v1::{
    AggregationTemporality, Gauge, Histogram, HistogramDataPoint, Metric, NumberDataPoint,
    ResourceMetrics, ScopeMetrics, Sum, metric, number_data_point,
};
use opentelemetry_proto::tonic::resource::v1::Resource as ProtoResource;
use opentelemetry_proto::tonic::trace::v1::{
    ResourceSpans, ScopeSpans, Span as ProtoSpan, Status as ProtoStatus, span, status,
};
use prost::Message;
use std::io::Write;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

const SAMPLED_FLAG: u32 = 0x01;

/// An OTLP export request for one signal.
#[derive(Debug, Clone)]
pub enum OtlpRequest {
    /// A traces export request.
    Traces(ExportTraceServiceRequest),
    /// A metrics export request.
    Metrics(ExportMetricsServiceRequest),
    /// A logs export request.
    Logs(ExportLogsServiceRequest),
}

impl OtlpRequest {
    /// Serialises the request to protobuf bytes.
    pub fn to_protobuf(&self) -> Vec<u8> {
        match self {
            Self::Traces(req) => req.encode_to_vec(),
            Self::Metrics(req) => req.encode_to_vec(),
            Self::Logs(req) => req.encode_to_vec(),
        }
    }

    /// Serialises the request to OTLP/JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialisation fails.
    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            Self::Traces(req) => serde_json::to_string(req),
            Self::Metrics(req) => serde_json::to_string(req),
            Self::Logs(req) => serde_json::to_string(req),
        }
    }

    /// Returns the serialised protobuf size in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Traces(req) => req.encoded_len(),
            Self::Metrics(req) => req.encoded_len(),
            Self::Logs(req) => req.encoded_len(),
        }
    }

    /// Returns the signal of the request.
    pub fn signal(&self) -> Signal {
        match self {
            Self::Traces(_) => Signal::Traces,
            Self::Metrics(_) => Signal::Metrics,
            Self::Logs(_) => Signal::Logs,
        }
    }

    /// Returns the number of spans, data points, or log records.
    pub fn item_count(&self) -> usize {
        match self {
            Self::Traces(req) => req
                .resource_spans
                .iter()
                .flat_map(|rs| &rs.scope_spans)
                .map(|ss| ss.spans.len())
                .sum(),
            Self::Metrics(req) => req
                .resource_metrics
                .iter()
                .flat_map(|rm| &rm.scope_metrics)
                .flat_map(|sm| &sm.metrics)
                .map(|m| match &m.data {
                    Some(metric::Data::Gauge(g)) => g.data_points.len(),
                    Some(metric::Data::Sum(s)) => s.data_points.len(),
                    Some(metric::Data::Histogram(h)) => h.data_points.len(),
                    Some(metric::Data::ExponentialHistogram(eh)) => eh.data_points.len(),
                    Some(metric::Data::Summary(s)) => s.data_points.len(),
                    None => 0,
                })
                .sum(),
            Self::Logs(req) => req
                .resource_logs
                .iter()
                .flat_map(|rl| &rl.scope_logs)
                .map(|sl| sl.log_records.len())
                .sum(),
        }
    }

    /// Produces the HTTP body for `protocol`, compressed per `compression`.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::Json`] or [`EncodeError::Compression`].
    pub fn to_payload(
        &self,
        protocol: Protocol,
        compression: Compression,
    ) -> Result<Vec<u8>, EncodeError> {
        let body = match protocol {
            Protocol::HttpBinary => self.to_protobuf(),
            Protocol::HttpJson => self
                .to_json()
                .map_err(|e| EncodeError::Json {
                    signal: self.signal(),
                    message: e.to_string(),
                })?
                .into_bytes(),
        };

        match compression {
            Compression::None => Ok(body),
            Compression::Gzip => gzip(&body),
        }
    }
}

fn gzip(body: &[u8]) -> Result<Vec<u8>, EncodeError> {
    use flate2::Compression as GzCompression;
    use flate2::write::GzEncoder;

    let to_error = |e: std::io::Error| EncodeError::Compression {
        message: e.to_string(),
    };

    let mut encoder = GzEncoder::new(Vec::new(), GzCompression::default());
    encoder.write_all(body).map_err(to_error)?;
    encoder.finish().map_err(to_error)
}

/// Result of encoding a batch.
#[derive(Debug)]
pub struct EncodedBatch {
    /// The request, `None` when every record was rejected or the batch was empty.
    pub request: Option<OtlpRequest>,
    /// Records rejected during encoding.
    pub rejected: Vec<EncodeError>,
}

/// Encodes a batch, dropping records that fail validation.
pub fn encode_batch(batch: Batch) -> EncodedBatch {
    let signal = batch.signal();
    let mut rejected = Vec::new();
    let mut accepted = Vec::with_capacity(batch.len());

    for record in batch.into_records() {
        match validate(&record) {
            Ok(()) => accepted.push(record),
            Err(e) => rejected.push(e),
        }
    }

    if accepted.is_empty() {
        return EncodedBatch {
            request: None,
            rejected,
        };
    }

    let request = match signal {
        Signal::Traces => OtlpRequest::Traces(encode_traces(accepted)),
        Signal::Metrics => OtlpRequest::Metrics(encode_metrics(accepted)),
        Signal::Logs => OtlpRequest::Logs(encode_logs(accepted)),
    };

    EncodedBatch {
        request: Some(request),
        rejected,
    }
}

/// Checks that a record can be represented on the wire.
///
/// # Errors
///
/// Returns the reason the record must be dropped.
pub fn validate(record: &TelemetryRecord) -> Result<(), EncodeError> {
    match record {
        TelemetryRecord::Span(span) => {
            if span.name.is_empty() {
                return Err(EncodeError::EmptyName {
                    signal: Signal::Traces,
                });
            }
            if span.trace_id == TraceId::INVALID || span.span_id == SpanId::INVALID {
                return Err(EncodeError::InvalidSpanContext);
            }
            if span.end_time < span.start_time {
                return Err(EncodeError::EndBeforeStart {
                    name: span.name.clone(),
                });
            }
            Ok(())
        }
        TelemetryRecord::Metric(point) => {
            if point.name.is_empty() {
                return Err(EncodeError::EmptyName {
                    signal: Signal::Metrics,
                });
            }
            let finite = match &point.value {
                MetricValue::Sum { value, .. } | MetricValue::Gauge(value) => value.is_finite(),
                MetricValue::Histogram { value, .. } => value.is_finite(),
            };
            if !finite {
                return Err(EncodeError::NonFiniteValue {
                    name: point.name.clone(),
                });
            }
            Ok(())
        }
        TelemetryRecord::Log(_) => Ok(()),
    }
}

type Groups<T> = Vec<(Arc<ResourceDescriptor>, Vec<(Arc<InstrumentationScope>, Vec<T>)>)>;

fn group<T>(items: impl IntoIterator<Item = (Arc<ResourceDescriptor>, Arc<InstrumentationScope>, T)>) -> Groups<T> {
    let mut groups: Groups<T> = Vec::new();

    for (resource, scope, item) in items {
        let idx = match groups
            .iter()
            .position(|(r, _)| Arc::ptr_eq(r, &resource) || **r == *resource)
        {
            Some(idx) => idx,
            None => {
                groups.push((resource, Vec::new()));
                groups.len() - 1
            }
        };
        let scopes = &mut groups[idx].1;

        match scopes.iter_mut().find(|(s, _)| **s == *scope) {
            Some((_, items)) => items.push(item),
            None => scopes.push((scope, vec![item])),
        }
    }

    groups
}

fn encode_traces(records: Vec<TelemetryRecord>) -> ExportTraceServiceRequest {
    let spans = records.into_iter().filter_map(|r| match r {
        TelemetryRecord::Span(span) => {
            Some((span.resource.clone(), span.scope.clone(), encode_span(span)))
        }
        _ => None,
    });

    ExportTraceServiceRequest {
        resource_spans: group(spans)
            .into_iter()
            .map(|(resource, scopes)| ResourceSpans {
                resource: Some(encode_resource(&resource)),
                scope_spans: scopes
                    .into_iter()
                    .map(|(scope, spans)| ScopeSpans {
                        scope: Some(encode_scope(&scope)),
                        spans,
                        schema_url: String::new(),
                    })
                    .collect(),
                schema_url: String::new(),
            })
            .collect(),
    }
}

fn encode_span(span: SpanRecord) -> ProtoSpan {
    let kind = match span.kind {
        SpanKind::Client => span::SpanKind::Client,
        SpanKind::Server => span::SpanKind::Server,
        SpanKind::Producer => span::SpanKind::Producer,
        SpanKind::Consumer => span::SpanKind::Consumer,
        SpanKind::Internal => span::SpanKind::Internal,
    };

    let status = match span.status {
        Status::Unset => ProtoStatus::default(),
        Status::Ok => ProtoStatus {
            code: status::StatusCode::Ok as i32,
            ..Default::default()
        },
        Status::Error { description } => ProtoStatus {
            code: status::StatusCode::Error as i32,
            message: description.into_owned(),
        },
    };

    ProtoSpan {
        trace_id: span.trace_id.to_bytes().to_vec(),
        span_id: span.span_id.to_bytes().to_vec(),
        parent_span_id: span
            .parent_span_id
            .map(|id| id.to_bytes().to_vec())
            .unwrap_or_default(),
        flags: SAMPLED_FLAG,
        name: span.name,
        kind: kind as i32,
        start_time_unix_nano: unix_nanos(span.start_time),
        end_time_unix_nano: unix_nanos(span.end_time),
        attributes: encode_attributes(&span.attributes),
        events: span
            .events
            .into_iter()
            .map(|event| span::Event {
                time_unix_nano: unix_nanos(event.time),
                name: event.name,
                attributes: encode_attributes(&event.attributes),
                dropped_attributes_count: 0,
            })
            .collect(),
        status: Some(status),
        ..Default::default()
    }
}

fn encode_metrics(records: Vec<TelemetryRecord>) -> ExportMetricsServiceRequest {
    let points = records.into_iter().filter_map(|r| match r {
        TelemetryRecord::Metric(point) => Some((point.resource.clone(), point.scope.clone(), point)),
        _ => None,
    });

    ExportMetricsServiceRequest {
        resource_metrics: group(points)
            .into_iter()
            .map(|(resource, scopes)| ResourceMetrics {
                resource: Some(encode_resource(&resource)),
                scope_metrics: scopes
                    .into_iter()
                    .map(|(scope, points)| {
                        let mut metrics = Vec::new();
                        for point in points {
                            push_metric_point(&mut metrics, point);
                        }
                        ScopeMetrics {
                            scope: Some(encode_scope(&scope)),
                            metrics,
                            schema_url: String::new(),
                        }
                    })
                    .collect(),
                schema_url: String::new(),
            })
            .collect(),
    }
}

/// Appends a point to the metric of the same name and shape, creating it if needed.
fn push_metric_point(metrics: &mut Vec<Metric>, point: MetricPoint) {
    let data = encode_metric_data(&point);
    let existing = metrics
        .iter_mut()
        .find(|m| m.name == point.name && same_shape(m.data.as_ref(), &data));

    match existing {
        Some(metric) => match (metric.data.as_mut(), data) {
            (Some(metric::Data::Sum(sum)), metric::Data::Sum(new)) => {
                sum.data_points.extend(new.data_points)
            }
            (Some(metric::Data::Gauge(gauge)), metric::Data::Gauge(new)) => {
                gauge.data_points.extend(new.data_points)
            }
            (Some(metric::Data::Histogram(hist)), metric::Data::Histogram(new)) => {
                hist.data_points.extend(new.data_points)
            }
            _ => {}
        },
        None => metrics.push(Metric {
            name: point.name,
            description: point.description,
            unit: point.unit,
            data: Some(data),
            ..Default::default()
        }),
    }
}

fn same_shape(existing: Option<&metric::Data>, new: &metric::Data) -> bool {
    match (existing, new) {
        (Some(metric::Data::Sum(a)), metric::Data::Sum(b)) => a.is_monotonic == b.is_monotonic,
        (Some(metric::Data::Gauge(_)), metric::Data::Gauge(_)) => true,
        (Some(metric::Data::Histogram(_)), metric::Data::Histogram(_)) => true,
        _ => false,
    }
}

fn encode_metric_data(point: &MetricPoint) -> metric::Data {
    let attributes = encode_attributes(&point.attributes);
    let start_time_unix_nano = unix_nanos(point.start_time);
    let time_unix_nano = unix_nanos(point.time);

    let number_point = |value: Number| NumberDataPoint {
        attributes: attributes.clone(),
        start_time_unix_nano,
        time_unix_nano,
        value: Some(match value {
            Number::I64(v) => number_data_point::Value::AsInt(v),
            Number::F64(v) => number_data_point::Value::AsDouble(v),
        }),
        ..Default::default()
    };

    match &point.value {
        MetricValue::Sum { value, monotonic } => metric::Data::Sum(Sum {
            data_points: vec![number_point(*value)],
            aggregation_temporality: AggregationTemporality::Delta as i32,
            is_monotonic: *monotonic,
        }),
        MetricValue::Gauge(value) => metric::Data::Gauge(Gauge {
            data_points: vec![number_point(*value)],
        }),
        MetricValue::Histogram { value, bounds } => {
            let mut bucket_counts = vec![0u64; bounds.len() + 1];
            let bucket = bounds
                .iter()
                .position(|bound| *value <= *bound)
                .unwrap_or(bounds.len());
            bucket_counts[bucket] = 1;

            metric::Data::Histogram(Histogram {
                data_points: vec![HistogramDataPoint {
                    attributes: attributes.clone(),
                    start_time_unix_nano,
                    time_unix_nano,
                    count: 1,
                    sum: Some(*value),
                    bucket_counts,
                    explicit_bounds: bounds.to_vec(),
                    min: Some(*value),
                    max: Some(*value),
                    ..Default::default()
                }],
                aggregation_temporality: AggregationTemporality::Delta as i32,
            })
        }
    }
}

fn encode_logs(records: Vec<TelemetryRecord>) -> ExportLogsServiceRequest {
    let logs = records.into_iter().filter_map(|r| match r {
        TelemetryRecord::Log(log) => Some((log.resource.clone(), log.scope.clone(), encode_log(log))),
        _ => None,
    });

    ExportLogsServiceRequest {
        resource_logs: group(logs)
            .into_iter()
            .map(|(resource, scopes)| ResourceLogs {
                resource: Some(encode_resource(&resource)),
                scope_logs: scopes
                    .into_iter()
                    .map(|(scope, log_records)| ScopeLogs {
                        scope: Some(encode_scope(&scope)),
                        log_records,
                        schema_url: String::new(),
                    })
                    .collect(),
                schema_url: String::new(),
            })
            .collect(),
    }
}

fn encode_log(log: LogRecord) -> ProtoLogRecord {
    let has_context = log.trace_id.is_some() && log.span_id.is_some();

    ProtoLogRecord {
        time_unix_nano: unix_nanos(log.time),
        observed_time_unix_nano: unix_nanos(log.observed_time),
        severity_number: log.severity.number(),
        severity_text: log.severity.text().to_string(),
        body: Some(string_value(log.body)),
        attributes: encode_attributes(&log.attributes),
        flags: if has_context { SAMPLED_FLAG } else { 0 },
        trace_id: log
            .trace_id
            .map(|id| id.to_bytes().to_vec())
            .unwrap_or_default(),
        span_id: log
            .span_id
            .map(|id| id.to_bytes().to_vec())
            .unwrap_or_default(),
        ..Default::default()
    }
}

fn encode_resource(resource: &ResourceDescriptor) -> ProtoResource {
    ProtoResource {
        attributes: resource
            .iter()
            .map(|(key, value)| ProtoKeyValue {
                key: key.to_string(),
                value: Some(any_value(value)),
            })
            .collect(),
        ..Default::default()
    }
}

fn encode_scope(scope: &InstrumentationScope) -> ProtoScope {
    ProtoScope {
        name: scope.name.clone(),
        version: scope.version.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn encode_attributes(attributes: &[KeyValue]) -> Vec<ProtoKeyValue> {
    attributes
        .iter()
        .map(|kv| ProtoKeyValue {
            key: kv.key.as_str().to_string(),
            value: Some(any_value(&kv.value)),
        })
        .collect()
}

fn string_value(s: String) -> AnyValue {
    AnyValue {
        value: Some(any_value::Value::StringValue(s)),
    }
}

fn any_value(value: &Value) -> AnyValue {
    let value = match value {
        Value::Bool(v) => any_value::Value::BoolValue(*v),
        Value::I64(v) => any_value::Value::IntValue(*v),
        Value::F64(v) => any_value::Value::DoubleValue(*v),
        Value::String(v) => any_value::Value::StringValue(v.to_string()),
        Value::Array(array) => any_value::Value::ArrayValue(ArrayValue {
            values: array_values(array),
        }),
        #[allow(unreachable_patterns)]
        other => any_value::Value::StringValue(other.to_string()),
    };
    AnyValue { value: Some(value) }
}

fn array_values(array: &Array) -> Vec<AnyValue> {
    let wrap = |value| AnyValue { value: Some(value) };
    match array {
        Array::Bool(values) => values
            .iter()
            .map(|v| wrap(any_value::Value::BoolValue(*v)))
            .collect(),
        Array::I64(values) => values
            .iter()
            .map(|v| wrap(any_value::Value::IntValue(*v)))
            .collect(),
        Array::F64(values) => values
            .iter()
            .map(|v| wrap(any_value::Value::DoubleValue(*v)))
            .collect(),
        Array::String(values) => values
            .iter()
            .map(|v| wrap(any_value::Value::StringValue(v.to_string())))
            .collect(),
        #[allow(unreachable_patterns)]
        _ => Vec::new(),
    }
}

fn unix_nanos(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::test_support::{log, resource, span};
    use crate::record::{MetricPoint, SpanEvent};
    use std::time::Duration;

    fn metric(name: &str, value: MetricValue) -> TelemetryRecord {
        let now = SystemTime::now();
        TelemetryRecord::Metric(MetricPoint {
            name: name.to_string(),
            description: String::new(),
            unit: "1".to_string(),
            value,
            attributes: vec![KeyValue::new("cache.store", "redis")],
            start_time: now,
            time: now,
            scope: Arc::new(InstrumentationScope::new("cache")),
            resource: resource(),
        })
    }

    fn batch(signal: Signal, records: Vec<TelemetryRecord>) -> Batch {
        let mut batch = Batch::new(signal);
        for record in records {
            batch.push(record).unwrap();
        }
        batch
    }

    #[test]
    fn spans_sharing_resource_and_scope_are_grouped() {
        let encoded = encode_batch(batch(Signal::Traces, vec![span("a"), span("b"), span("c")]));
        assert!(encoded.rejected.is_empty());

        let Some(OtlpRequest::Traces(req)) = encoded.request else {
            panic!("expected traces request");
        };
        assert_eq!(req.resource_spans.len(), 1);
        assert_eq!(req.resource_spans[0].scope_spans.len(), 1);

        let names: Vec<_> = req.resource_spans[0].scope_spans[0]
            .spans
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn resource_attributes_are_encoded_in_key_order() {
        let encoded = encode_batch(batch(Signal::Traces, vec![span("a")]));
        let Some(OtlpRequest::Traces(req)) = encoded.request else {
            panic!("expected traces request");
        };
        let keys: Vec<_> = req.resource_spans[0]
            .resource
            .as_ref()
            .unwrap()
            .attributes
            .iter()
            .map(|kv| kv.key.as_str())
            .collect();
        assert_eq!(keys, vec!["deployment.environment.name", "service.name"]);
    }

    #[test]
    fn invalid_span_is_dropped_and_rest_of_batch_kept() {
        let mut bad = span("bad");
        if let TelemetryRecord::Span(s) = &mut bad {
            s.trace_id = TraceId::INVALID;
        }
        let mut reversed = span("reversed");
        if let TelemetryRecord::Span(s) = &mut reversed {
            s.end_time = s.start_time - Duration::from_secs(1);
        }

        let encoded = encode_batch(batch(Signal::Traces, vec![span("ok"), bad, reversed]));

        assert_eq!(
            encoded.rejected,
            vec![
                EncodeError::InvalidSpanContext,
                EncodeError::EndBeforeStart {
                    name: "reversed".to_string()
                }
            ]
        );
        assert_eq!(encoded.request.unwrap().item_count(), 1);
    }

    #[test]
    fn all_invalid_batch_produces_no_request() {
        let encoded = encode_batch(batch(Signal::Traces, vec![span("")]));
        assert!(encoded.request.is_none());
        assert_eq!(encoded.rejected.len(), 1);
    }

    #[test]
    fn exception_events_and_error_status_are_encoded() {
        let mut record = span("query");
        if let TelemetryRecord::Span(s) = &mut record {
            s.status = Status::error("boom");
            s.events.push(SpanEvent {
                name: "exception".to_string(),
                time: s.end_time,
                attributes: vec![KeyValue::new("exception.message", "boom")],
            });
        }

        let Some(OtlpRequest::Traces(req)) = encode_batch(batch(Signal::Traces, vec![record])).request
        else {
            panic!("expected traces request");
        };
        let span = &req.resource_spans[0].scope_spans[0].spans[0];
        let status = span.status.as_ref().unwrap();
        assert_eq!(status.code, status::StatusCode::Error as i32);
        assert_eq!(status.message, "boom");
        assert_eq!(span.events[0].name, "exception");
    }

    #[test]
    fn points_of_same_instrument_share_one_metric() {
        let sum = || MetricValue::Sum {
            value: Number::I64(1),
            monotonic: true,
        };
        let encoded = encode_batch(batch(
            Signal::Metrics,
            vec![
                metric("cache.hits", sum()),
                metric("cache.hits", sum()),
                metric("cache.size", MetricValue::Gauge(Number::F64(3.0))),
            ],
        ));

        let Some(OtlpRequest::Metrics(req)) = encoded.request else {
            panic!("expected metrics request");
        };
        let metrics = &req.resource_metrics[0].scope_metrics[0].metrics;
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].name, "cache.hits");
        match &metrics[0].data {
            Some(metric::Data::Sum(sum)) => {
                assert_eq!(sum.data_points.len(), 2);
                assert!(sum.is_monotonic);
                assert_eq!(
                    sum.aggregation_temporality,
                    AggregationTemporality::Delta as i32
                );
            }
            other => panic!("expected sum, got {other:?}"),
        }
        assert_eq!(OtlpRequest::Metrics(req).item_count(), 3);
    }

    #[test]
    fn histogram_observation_lands_in_its_bucket() {
        let encoded = encode_batch(batch(
            Signal::Metrics,
            vec![metric(
                "db.duration",
                MetricValue::Histogram {
                    value: 7.0,
                    bounds: Arc::from(vec![1.0, 5.0, 10.0]),
                },
            )],
        ));

        let Some(OtlpRequest::Metrics(req)) = encoded.request else {
            panic!("expected metrics request");
        };
        match &req.resource_metrics[0].scope_metrics[0].metrics[0].data {
            Some(metric::Data::Histogram(h)) => {
                assert_eq!(h.data_points[0].bucket_counts, vec![0, 0, 1, 0]);
                assert_eq!(h.data_points[0].sum, Some(7.0));
            }
            other => panic!("expected histogram, got {other:?}"),
        }
    }

    #[test]
    fn non_finite_metric_is_rejected() {
        let encoded = encode_batch(batch(
            Signal::Metrics,
            vec![metric("bad", MetricValue::Gauge(Number::F64(f64::INFINITY)))],
        ));
        assert!(encoded.request.is_none());
        assert!(matches!(
            encoded.rejected[0],
            EncodeError::NonFiniteValue { .. }
        ));
    }

    #[test]
    fn logs_carry_severity_and_body() {
        let Some(OtlpRequest::Logs(req)) = encode_batch(batch(Signal::Logs, vec![log("hello")])).request
        else {
            panic!("expected logs request");
        };
        let record = &req.resource_logs[0].scope_logs[0].log_records[0];
        assert_eq!(record.severity_number, 9);
        assert_eq!(record.severity_text, "INFO");
        assert_eq!(
            record.body,
            Some(AnyValue {
                value: Some(any_value::Value::StringValue("hello".to_string()))
            })
        );
        assert!(record.trace_id.is_empty());
    }

    #[test]
    fn protobuf_payload_decodes_back_to_the_request() {
        let request = encode_batch(batch(Signal::Traces, vec![span("a")]))
            .request
            .unwrap();
        let body = request
            .to_payload(Protocol::HttpBinary, Compression::None)
            .unwrap();

        let decoded = ExportTraceServiceRequest::decode(body.as_slice()).unwrap();
        assert_eq!(decoded.resource_spans[0].scope_spans[0].spans[0].name, "a");
    }

    #[test]
    fn gzip_payload_has_gzip_magic() {
        let request = encode_batch(batch(Signal::Logs, vec![log("x")])).request.unwrap();
        let body = request
            .to_payload(Protocol::HttpBinary, Compression::Gzip)
            .unwrap();
        assert_eq!(&body[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn json_payload_contains_span_name() {
        let request = encode_batch(batch(Signal::Traces, vec![span("json-span")]))
            .request
            .unwrap();
        let body = request
            .to_payload(Protocol::HttpJson, Compression::None)
            .unwrap();
        assert!(String::from_utf8(body).unwrap().contains("json-span"));
    }
}
