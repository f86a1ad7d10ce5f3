//! Metric instruments.
//!
//! Every recorded value becomes one delta data point; no aggregation happens
//! in-process.

use crate::processor::{Processor, ProviderCore};
use crate::record::{InstrumentationScope, MetricPoint, MetricValue, Number};
use crate::resource::ResourceDescriptor;
use opentelemetry::KeyValue;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

/// Explicit histogram bucket boundaries used when none are configured.
pub const DEFAULT_HISTOGRAM_BOUNDARIES: [f64; 15] = [
    0.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0, 500.0, 750.0, 1000.0, 2500.0, 5000.0, 7500.0,
    10000.0,
];

/// Creates [`Meter`]s bound to the pipeline's resource and metric processor.
#[derive(Debug, Clone)]
pub struct MeterProvider {
    core: Arc<ProviderCore>,
}

impl MeterProvider {
    pub(crate) fn new(resource: Arc<ResourceDescriptor>, processor: Option<Processor>) -> Self {
        Self {
            core: ProviderCore::new(resource, processor),
        }
    }

    /// Returns a meter for the named instrumentation scope.
    pub fn meter(&self, name: impl Into<String>) -> Meter {
        self.meter_with_scope(InstrumentationScope::new(name))
    }

    /// Returns a meter for `scope`.
    pub fn meter_with_scope(&self, scope: InstrumentationScope) -> Meter {
        Meter {
            core: Arc::clone(&self.core),
            scope: Arc::new(scope),
        }
    }

    /// The metric processor, if metrics are enabled.
    #[must_use]
    pub fn processor(&self) -> Option<&Processor> {
        self.core.processor.as_ref()
    }

    pub(crate) fn core(&self) -> &ProviderCore {
        &self.core
    }
}

/// Creates instruments for one instrumentation scope.
#[derive(Debug, Clone)]
pub struct Meter {
    core: Arc<ProviderCore>,
    scope: Arc<InstrumentationScope>,
}

impl Meter {
    /// Monotonic `u64` counter.
    pub fn u64_counter(&self, name: impl Into<String>) -> InstrumentBuilder<Counter> {
        InstrumentBuilder::new(self, name)
    }

    /// Non-monotonic `i64` sum.
    pub fn i64_up_down_counter(&self, name: impl Into<String>) -> InstrumentBuilder<UpDownCounter> {
        InstrumentBuilder::new(self, name)
    }

    /// `f64` histogram.
    pub fn f64_histogram(&self, name: impl Into<String>) -> InstrumentBuilder<Histogram> {
        InstrumentBuilder::new(self, name)
    }

    /// `f64` gauge.
    pub fn f64_gauge(&self, name: impl Into<String>) -> InstrumentBuilder<Gauge> {
        InstrumentBuilder::new(self, name)
    }
}

#[derive(Debug)]
struct Instrument {
    core: Arc<ProviderCore>,
    scope: Arc<InstrumentationScope>,
    name: String,
    description: String,
    unit: String,
    last_observation: Mutex<SystemTime>,
}

impl Instrument {
    fn observe(&self, value: MetricValue, attributes: &[KeyValue]) {
        if self.core.processor.is_none() {
            return;
        }

        let time = SystemTime::now();
        let start_time = {
            let mut last = self
                .last_observation
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *last, time)
        };

        self.core.emit(
            MetricPoint {
                name: self.name.clone(),
                description: self.description.clone(),
                unit: self.unit.clone(),
                value,
                attributes: attributes.to_vec(),
                start_time,
                time,
                scope: Arc::clone(&self.scope),
                resource: Arc::clone(&self.core.resource),
            }
            .into(),
        );
    }
}

/// Configures an instrument before creating it.
#[derive(Debug)]
pub struct InstrumentBuilder<I> {
    meter: Meter,
    name: String,
    description: String,
    unit: String,
    boundaries: Option<Vec<f64>>,
    _kind: PhantomData<I>,
}

impl<I> InstrumentBuilder<I> {
    fn new(meter: &Meter, name: impl Into<String>) -> Self {
        Self {
            meter: meter.clone(),
            name: name.into(),
            description: String::new(),
            unit: String::new(),
            boundaries: None,
            _kind: PhantomData,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the unit, e.g. `ms` or `{hit}`.
    #[must_use]
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    fn into_instrument(self) -> Arc<Instrument> {
        Arc::new(Instrument {
            core: self.meter.core,
            scope: self.meter.scope,
            name: self.name,
            description: self.description,
            unit: self.unit,
            last_observation: Mutex::new(SystemTime::now()),
        })
    }
}

impl InstrumentBuilder<Counter> {
    /// Creates the counter.
    pub fn build(self) -> Counter {
        Counter(self.into_instrument())
    }
}

impl InstrumentBuilder<UpDownCounter> {
    /// Creates the counter.
    pub fn build(self) -> UpDownCounter {
        UpDownCounter(self.into_instrument())
    }
}

impl InstrumentBuilder<Gauge> {
    /// Creates the gauge.
    pub fn build(self) -> Gauge {
        Gauge(self.into_instrument())
    }
}

impl InstrumentBuilder<Histogram> {
    /// Sets the explicit bucket boundaries. Non-finite values are removed and
    /// the rest sorted.
    #[must_use]
    pub fn with_boundaries(mut self, boundaries: impl Into<Vec<f64>>) -> Self {
        let mut boundaries: Vec<f64> = boundaries
            .into()
            .into_iter()
            .filter(|b| b.is_finite())
            .collect();
        boundaries.sort_by(f64::total_cmp);
        boundaries.dedup();
        self.boundaries = Some(boundaries);
        self
    }

    /// Creates the histogram.
    pub fn build(mut self) -> Histogram {
        let boundaries = match self.boundaries.take() {
            Some(boundaries) => Arc::from(boundaries),
            None => Arc::from(DEFAULT_HISTOGRAM_BOUNDARIES),
        };
        Histogram {
            instrument: self.into_instrument(),
            boundaries,
        }
    }
}

/// Monotonic counter.
#[derive(Debug, Clone)]
pub struct Counter(Arc<Instrument>);

impl Counter {
    /// Adds `value`.
    pub fn add(&self, value: u64, attributes: &[KeyValue]) {
        self.0.observe(
            MetricValue::Sum {
                value: Number::from(value),
                monotonic: true,
            },
            attributes,
        );
    }
}

/// Sum that may go up or down.
#[derive(Debug, Clone)]
pub struct UpDownCounter(Arc<Instrument>);

impl UpDownCounter {
    /// Adds `value`, which may be negative.
    pub fn add(&self, value: i64, attributes: &[KeyValue]) {
        self.0.observe(
            MetricValue::Sum {
                value: Number::from(value),
                monotonic: false,
            },
            attributes,
        );
    }
}

/// Distribution of observed values.
#[derive(Debug, Clone)]
pub struct Histogram {
    instrument: Arc<Instrument>,
    boundaries: Arc<[f64]>,
}

impl Histogram {
    /// Records one observation.
    pub fn record(&self, value: f64, attributes: &[KeyValue]) {
        self.instrument.observe(
            MetricValue::Histogram {
                value,
                bounds: Arc::clone(&self.boundaries),
            },
            attributes,
        );
    }
}

/// Last observed value.
#[derive(Debug, Clone)]
pub struct Gauge(Arc<Instrument>);

impl Gauge {
    /// Records the current value.
    pub fn record(&self, value: f64, attributes: &[KeyValue]) {
        self.0.observe(MetricValue::Gauge(Number::from(value)), attributes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignalConfig;
    use crate::exporter::SignalExporter;
    use crate::fallback::ExportFallback;
    use crate::record::Signal;
    use crate::record::test_support::resource;
    use crate::transport::test_support::ScriptedTransport;
    use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
    use opentelemetry_proto::tonic::metrics::v1::{Metric, metric, number_data_point};
    use prost::Message;
    use std::time::Duration;

    fn provider() -> (MeterProvider, Arc<ScriptedTransport>) {
        let transport = ScriptedTransport::new();
        let exporter =
            SignalExporter::new(Signal::Metrics, "http://c/v1/metrics", transport.clone())
                .with_fallback(ExportFallback::None);
        let processor =
            Processor::new(exporter, &SignalConfig::simple(), Duration::from_secs(5)).unwrap();
        (MeterProvider::new(resource(), Some(processor)), transport)
    }

    fn exported(transport: &ScriptedTransport) -> Vec<Metric> {
        transport
            .sent()
            .iter()
            .flat_map(|sent| {
                ExportMetricsServiceRequest::decode(sent.body.as_slice())
                    .unwrap()
                    .resource_metrics
            })
            .flat_map(|rm| rm.scope_metrics)
            .flat_map(|sm| sm.metrics)
            .collect()
    }

    #[test]
    fn counter_exports_monotonic_delta() {
        let (provider, transport) = provider();
        let hits = provider
            .meter("cache")
            .u64_counter("cache.hits")
            .with_unit("{hit}")
            .build();

        hits.add(3, &[KeyValue::new("cache.store", "redis")]);

        let metrics = exported(&transport);
        assert_eq!(metrics[0].name, "cache.hits");
        assert_eq!(metrics[0].unit, "{hit}");
        match &metrics[0].data {
            Some(metric::Data::Sum(sum)) => {
                assert!(sum.is_monotonic);
                assert_eq!(
                    sum.data_points[0].value,
                    Some(number_data_point::Value::AsInt(3))
                );
            }
            other => panic!("expected sum, got {other:?}"),
        }
    }

    #[test]
    fn up_down_counter_is_not_monotonic() {
        let (provider, transport) = provider();
        let active = provider.meter("db").i64_up_down_counter("db.connections").build();

        active.add(-1, &[]);

        match &exported(&transport)[0].data {
            Some(metric::Data::Sum(sum)) => assert!(!sum.is_monotonic),
            other => panic!("expected sum, got {other:?}"),
        }
    }

    #[test]
    fn histogram_boundaries_are_sorted_and_finite() {
        let (provider, transport) = provider();
        let duration = provider
            .meter("http")
            .f64_histogram("http.client.duration")
            .with_boundaries(vec![100.0, f64::NAN, 10.0, 10.0])
            .build();

        duration.record(42.0, &[]);

        match &exported(&transport)[0].data {
            Some(metric::Data::Histogram(h)) => {
                assert_eq!(h.data_points[0].explicit_bounds, vec![10.0, 100.0]);
                assert_eq!(h.data_points[0].bucket_counts, vec![0, 1, 0]);
            }
            other => panic!("expected histogram, got {other:?}"),
        }
    }

    #[test]
    fn histogram_defaults_to_standard_boundaries() {
        let (provider, transport) = provider();
        provider.meter("m").f64_histogram("h").build().record(1.0, &[]);

        match &exported(&transport)[0].data {
            Some(metric::Data::Histogram(h)) => {
                assert_eq!(h.data_points[0].explicit_bounds, DEFAULT_HISTOGRAM_BOUNDARIES.to_vec());
            }
            other => panic!("expected histogram, got {other:?}"),
        }
    }

    #[test]
    fn consecutive_points_cover_adjacent_intervals() {
        let (provider, transport) = provider();
        let gauge = provider.meter("m").f64_gauge("queue.depth").build();

        gauge.record(1.0, &[]);
        gauge.record(2.0, &[]);

        let points: Vec<_> = exported(&transport)
            .into_iter()
            .flat_map(|m| match m.data {
                Some(metric::Data::Gauge(g)) => g.data_points,
                _ => Vec::new(),
            })
            .collect();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].start_time_unix_nano, points[0].time_unix_nano);
    }

    #[test]
    fn disabled_provider_records_nothing() {
        let provider = MeterProvider::new(resource(), None);
        let counter = provider.meter("m").u64_counter("c").build();
        counter.add(1, &[]);
        assert!(provider.processor().is_none());
    }
}
