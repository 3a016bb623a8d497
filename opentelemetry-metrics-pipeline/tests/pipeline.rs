use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use opentelemetry::KeyValue;
use opentelemetry_metrics_pipeline::{
    error::MetricError,
    metrics::{
        data::{AggregatedMetrics, Histogram, Metric, MetricData, ResourceMetrics, Sum},
        new_view, Aggregation, Instrument, ManualReader, MeterProviderBuilder, MetricReader,
        SdkMeterProvider, Stream, Temporality,
    },
    CollectContext, Resource,
};

struct Harness {
    reader: ManualReader,
    provider: SdkMeterProvider,
}

impl Harness {
    fn new(temporality: Temporality) -> Self {
        Self::with_provider(temporality, |builder| builder)
    }

    fn with_provider(
        temporality: Temporality,
        configure: impl FnOnce(MeterProviderBuilder) -> MeterProviderBuilder,
    ) -> Self {
        let reader = ManualReader::builder().with_temporality(temporality).build();
        let provider = configure(SdkMeterProvider::builder().with_reader(reader.clone())).build();
        Harness { reader, provider }
    }

    fn collect(&self) -> ResourceMetrics {
        let mut rm = ResourceMetrics::default();
        self.reader
            .collect(&CollectContext::new(), &mut rm)
            .expect("collection succeeds");
        rm
    }

    fn metrics(&self) -> Vec<Metric> {
        self.collect()
            .scope_metrics
            .into_iter()
            .flat_map(|scope| scope.metrics)
            .collect()
    }
}

fn u64_sum(metric: &Metric) -> &Sum<u64> {
    match &metric.data {
        AggregatedMetrics::U64(MetricData::Sum(sum)) => sum,
        other => panic!("expected u64 sum, got {other:?}"),
    }
}

fn f64_histogram(metric: &Metric) -> &Histogram<f64> {
    match &metric.data {
        AggregatedMetrics::F64(MetricData::Histogram(hist)) => hist,
        other => panic!("expected f64 histogram, got {other:?}"),
    }
}

#[test]
fn empty_pipeline_reports_resource_only() {
    let reader = ManualReader::builder().build();
    let provider = SdkMeterProvider::builder()
        .with_resource(Resource::builder_empty().with_service_name("billing").build())
        .with_reader(reader.clone())
        .build();
    let _meter = provider.meter("idle");

    let mut rm = ResourceMetrics::default();
    reader.collect(&CollectContext::new(), &mut rm).unwrap();

    assert!(rm.scope_metrics.is_empty());
    assert_eq!(
        rm.resource.get(&"service.name".into()),
        Some("billing".into())
    );
}

#[test]
fn cumulative_sum_reports_running_total() {
    let harness = Harness::new(Temporality::Cumulative);
    let counter = harness.provider.meter("app").u64_counter("foo").build();

    counter.add(5, &[]);
    let metrics = harness.metrics();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].name, "foo");
    let sum = u64_sum(&metrics[0]);
    assert_eq!(sum.data_points.len(), 1);
    assert_eq!(sum.data_points[0].value, 5);
    assert!(sum.is_monotonic);
    assert_eq!(sum.temporality, Temporality::Cumulative);

    counter.add(3, &[]);
    let metrics = harness.metrics();
    assert_eq!(u64_sum(&metrics[0]).data_points[0].value, 8);

    // No new measurements, total stays put.
    let metrics = harness.metrics();
    assert_eq!(u64_sum(&metrics[0]).data_points[0].value, 8);
}

#[test]
fn delta_sum_reports_change_and_resets() {
    let harness = Harness::new(Temporality::Delta);
    let counter = harness.provider.meter("app").u64_counter("foo").build();
    let attrs = [KeyValue::new("route", "/cart")];

    counter.add(5, &attrs);
    let metrics = harness.metrics();
    assert_eq!(u64_sum(&metrics[0]).data_points[0].value, 5);

    counter.add(3, &attrs);
    let metrics = harness.metrics();
    let sum = u64_sum(&metrics[0]);
    assert_eq!(sum.temporality, Temporality::Delta);
    assert_eq!(sum.data_points[0].value, 3);
    assert_eq!(sum.data_points[0].attributes, attrs.to_vec());

    // A cycle without measurements has no data points, so the stream is omitted.
    assert!(harness.metrics().is_empty());
}

#[test]
fn histogram_with_default_boundaries() {
    let harness = Harness::new(Temporality::Cumulative);
    let histogram = harness.provider.meter("app").f64_histogram("latency").build();

    for value in [23.0, 7.0, 101.0, 105.0] {
        histogram.record(value, &[]);
    }

    let metrics = harness.metrics();
    let hist = f64_histogram(&metrics[0]);
    let point = &hist.data_points[0];
    assert_eq!(point.count, 4);
    assert_eq!(point.sum, 236.0);
    assert_eq!(point.min, Some(7.0));
    assert_eq!(point.max, Some(105.0));
    assert_eq!(
        point.bounds,
        vec![
            0.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0, 500.0, 750.0, 1000.0, 2500.0,
            5000.0, 7500.0, 10000.0
        ]
    );
    // [5, 10) holds 7, [10, 25) holds 23, [100, 250) holds 101 and 105.
    let mut expected = vec![0; 16];
    expected[2] = 1;
    expected[3] = 1;
    expected[7] = 2;
    assert_eq!(point.bucket_counts, expected);
}

#[test]
fn two_matching_views_produce_two_streams() {
    let harness = Harness::with_provider(Temporality::Cumulative, |builder| {
        builder
            .with_view(
                new_view(
                    Instrument::new().name("latency"),
                    Stream::builder()
                        .with_name("latency.total")
                        .with_aggregation(Aggregation::Sum)
                        .build()
                        .unwrap(),
                )
                .unwrap(),
            )
            .with_view(
                new_view(
                    Instrument::new().name("latency"),
                    Stream::builder()
                        .with_name("latency.coarse")
                        .with_aggregation(Aggregation::ExplicitBucketHistogram {
                            boundaries: vec![50.0],
                            record_min_max: false,
                        })
                        .build()
                        .unwrap(),
                )
                .unwrap(),
            )
    });
    let histogram = harness.provider.meter("app").f64_histogram("latency").build();
    histogram.record(20.0, &[]);
    histogram.record(80.0, &[]);

    let metrics = harness.metrics();
    assert_eq!(metrics.len(), 2);

    let total = metrics.iter().find(|m| m.name == "latency.total").unwrap();
    match &total.data {
        AggregatedMetrics::F64(MetricData::Sum(sum)) => {
            assert_eq!(sum.data_points[0].value, 100.0)
        }
        other => panic!("expected f64 sum, got {other:?}"),
    }

    let coarse = metrics.iter().find(|m| m.name == "latency.coarse").unwrap();
    let point = &f64_histogram(coarse).data_points[0];
    assert_eq!(point.bucket_counts, vec![1, 1]);
    assert_eq!(point.min, None);
}

#[test]
fn conflicting_definitions_are_both_reported() {
    let harness = Harness::new(Temporality::Cumulative);
    let meter = harness.provider.meter("app");
    let millis = meter.u64_counter("elapsed").with_unit("ms").build();
    let seconds = meter.u64_counter("elapsed").with_unit("s").build();

    millis.add(1500, &[]);
    seconds.add(2, &[]);

    let metrics = harness.metrics();
    assert_eq!(metrics.len(), 2);
    assert!(metrics.iter().all(|m| m.name == "elapsed"));
    assert_eq!(metrics[0].unit, "ms");
    assert_eq!(u64_sum(&metrics[0]).data_points[0].value, 1500);
    assert_eq!(metrics[1].unit, "s");
    assert_eq!(u64_sum(&metrics[1]).data_points[0].value, 2);
}

#[test]
fn unregister_is_idempotent() {
    let harness = Harness::new(Temporality::Cumulative);
    let meter = harness.provider.meter("app");
    let queue_depth = meter.u64_observable_gauge("queue.depth").build();
    let calls = Arc::new(AtomicUsize::new(0));

    let registration = {
        let calls = Arc::clone(&calls);
        let queue_depth = queue_depth.clone();
        meter
            .register_callback(&[&queue_depth.clone()], move |_ctx| {
                calls.fetch_add(1, Ordering::SeqCst);
                queue_depth.observe(7, &[]);
                Ok(())
            })
            .unwrap()
    };

    harness.collect();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    for _ in 0..3 {
        registration.unregister().unwrap();
    }
    harness.collect();
    harness.collect();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn cancelled_collection_is_an_error() {
    let harness = Harness::new(Temporality::Cumulative);
    harness.provider.meter("app").u64_counter("foo").build().add(1, &[]);

    let ctx = CollectContext::new();
    ctx.cancel();
    let mut rm = ResourceMetrics::default();
    let result = harness.reader.collect(&ctx, &mut rm);

    assert!(matches!(result, Err(MetricError::Cancelled)));
    assert!(rm.scope_metrics.is_empty());

    // The next cycle still sees the recorded value.
    let metrics = harness.metrics();
    assert_eq!(u64_sum(&metrics[0]).data_points[0].value, 1);
}

#[test]
fn callback_cancelling_the_cycle_skips_the_rest() {
    let harness = Harness::new(Temporality::Cumulative);
    let meter = harness.provider.meter("app");
    let gauge = meter.u64_observable_gauge("g").build();
    let later_calls = Arc::new(AtomicUsize::new(0));

    let _first = meter
        .register_callback(&[&gauge], |ctx| {
            ctx.cancel();
            Ok(())
        })
        .unwrap();
    let _second = {
        let later_calls = Arc::clone(&later_calls);
        meter
            .register_callback(&[&gauge], move |_ctx| {
                later_calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap()
    };

    let mut rm = ResourceMetrics::default();
    let result = harness.reader.collect(&CollectContext::new(), &mut rm);
    assert!(matches!(result, Err(MetricError::Cancelled)));
    assert_eq!(later_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn expired_deadline_is_an_error() {
    let harness = Harness::new(Temporality::Cumulative);
    let ctx = CollectContext::new().with_deadline(Instant::now());

    let mut rm = ResourceMetrics::default();
    let result = harness.reader.collect(&ctx, &mut rm);
    assert!(matches!(result, Err(MetricError::DeadlineExceeded)));

    let ctx = CollectContext::new().with_timeout(Duration::from_secs(60));
    assert!(harness.reader.collect(&ctx, &mut rm).is_ok());
}

#[test]
fn concurrent_recording_registration_and_collection() {
    const THREADS: u64 = 4;
    const ADDS: u64 = 2_000;

    let harness = Harness::new(Temporality::Cumulative);
    let meter = harness.provider.meter("app");
    let counter = meter.u64_counter("hits").build();
    let observed = meter.u64_observable_counter("observed").build();

    thread::scope(|s| {
        for t in 0..THREADS {
            let counter = counter.clone();
            s.spawn(move || {
                let attrs = [KeyValue::new("thread", t as i64)];
                for _ in 0..ADDS {
                    counter.add(1, &attrs);
                }
            });
        }

        for _ in 0..2 {
            let meter = meter.clone();
            let observed = observed.clone();
            s.spawn(move || {
                for _ in 0..100 {
                    let inner = observed.clone();
                    let registration = meter
                        .register_callback(&[&observed], move |_ctx| {
                            inner.observe(1, &[]);
                            Ok(())
                        })
                        .unwrap();
                    registration.unregister().unwrap();
                }
            });
        }

        s.spawn(|| {
            for _ in 0..50 {
                harness.collect();
            }
        });
    });

    let metrics = harness.metrics();
    let hits = metrics.iter().find(|m| m.name == "hits").unwrap();
    let total: u64 = u64_sum(hits).data_points.iter().map(|dp| dp.value).sum();
    assert_eq!(total, THREADS * ADDS);
    assert_eq!(u64_sum(hits).data_points.len(), THREADS as usize);
}

#[test]
fn shutdown_stops_collection() {
    let harness = Harness::new(Temporality::Cumulative);
    let counter = harness.provider.meter("app").u64_counter("foo").build();
    counter.add(1, &[]);

    harness.provider.shutdown().unwrap();
    counter.add(1, &[]);

    let mut rm = ResourceMetrics::default();
    assert!(matches!(
        harness.reader.collect(&CollectContext::new(), &mut rm),
        Err(MetricError::AlreadyShutdown)
    ));
    assert!(matches!(
        harness.provider.shutdown(),
        Err(MetricError::AlreadyShutdown)
    ));
}

struct TwoReaders {
    a: ManualReader,
    b: ManualReader,
    provider: SdkMeterProvider,
}

impl TwoReaders {
    /// Two cumulative readers sharing a view that keeps only the `host` key.
    fn with_host_filter() -> Self {
        let a = ManualReader::builder().build();
        let b = ManualReader::builder().build();
        let host_only = Stream::builder()
            .with_allowed_attribute_keys(["host".into()])
            .build()
            .unwrap();
        let provider = SdkMeterProvider::builder()
            .with_reader(a.clone())
            .with_reader(b.clone())
            .with_view(new_view(Instrument::new().name("cpu.time"), host_only).unwrap())
            .build();
        TwoReaders { a, b, provider }
    }

    fn values(reader: &ManualReader) -> Vec<u64> {
        let mut rm = ResourceMetrics::default();
        reader.collect(&CollectContext::new(), &mut rm).unwrap();
        rm.scope_metrics
            .iter()
            .flat_map(|scope| &scope.metrics)
            .flat_map(|metric| u64_sum(metric).data_points.iter().map(|dp| dp.value))
            .collect()
    }
}

fn cpu_attrs(cpu: i64) -> [KeyValue; 2] {
    [KeyValue::new("host", "a"), KeyValue::new("cpu", cpu)]
}

#[test]
fn instrument_callbacks_only_feed_the_collecting_reader() {
    let readers = TwoReaders::with_host_filter();
    let _cpu_time = readers
        .provider
        .meter("host")
        .u64_observable_counter("cpu.time")
        .with_callback(|observer| {
            observer.observe(3, &cpu_attrs(0));
            observer.observe(4, &cpu_attrs(1));
        })
        .build();

    assert_eq!(TwoReaders::values(&readers.b), vec![7]);
    assert_eq!(TwoReaders::values(&readers.a), vec![7]);
    assert_eq!(TwoReaders::values(&readers.a), vec![7]);
    assert_eq!(TwoReaders::values(&readers.b), vec![7]);
}

#[test]
fn meter_callbacks_only_feed_the_collecting_reader() {
    let readers = TwoReaders::with_host_filter();
    let meter = readers.provider.meter("host");
    let cpu_time = meter.u64_observable_counter("cpu.time").build();

    let observed = cpu_time.clone();
    let _reg = meter
        .register_callback(&[&cpu_time], move |_| {
            observed.observe(3, &cpu_attrs(0));
            observed.observe(4, &cpu_attrs(1));
            Ok(())
        })
        .unwrap();

    assert_eq!(TwoReaders::values(&readers.b), vec![7]);
    assert_eq!(TwoReaders::values(&readers.a), vec![7]);
}

#[test]
fn synchronous_recording_reaches_every_reader() {
    let readers = TwoReaders::with_host_filter();
    let counter = readers.provider.meter("host").u64_counter("cpu.time").build();

    counter.add(3, &cpu_attrs(0));
    counter.add(4, &cpu_attrs(1));

    assert_eq!(TwoReaders::values(&readers.b), vec![7]);
    assert_eq!(TwoReaders::values(&readers.a), vec![7]);
}

#[test]
fn incompatible_view_keeps_other_streams_of_the_instrument() {
    let harness = Harness::with_provider(Temporality::Cumulative, |builder| {
        let renamed = Stream::builder()
            .with_name("requests_renamed")
            .build()
            .unwrap();
        let last_value = Stream::builder()
            .with_aggregation(Aggregation::LastValue)
            .build()
            .unwrap();
        builder
            .with_view(new_view(Instrument::new().name("requests"), renamed).unwrap())
            .with_view(new_view(Instrument::new().name("requests"), last_value).unwrap())
    });
    let counter = harness.provider.meter("app").u64_counter("requests").build();

    counter.add(5, &[]);

    let metrics = harness.metrics();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].name, "requests_renamed");
    assert_eq!(u64_sum(&metrics[0]).data_points[0].value, 5);
}
