use std::mem::replace;
use std::ops::DerefMut;
use std::sync::Mutex;

use opentelemetry::KeyValue;

use crate::metrics::data::{self, AggregatedMetrics, HistogramDataPoint, MetricData, Temporality};

use super::aggregate::{AggregateTime, AggregateTimeInitiator, AttributeSetFilter};
use super::{is_invalid_measurement, Aggregator, ComputeAggregation, Measure, Number, ValueMap};

struct HistogramTracker<T> {
    buckets: Mutex<Buckets<T>>,
}

impl<T> Aggregator for HistogramTracker<T>
where
    T: Number,
{
    /// Number of buckets
    type InitConfig = usize;
    /// Value and bucket index
    type PreComputedValue = (T, usize);

    fn create(count: &usize) -> Self {
        HistogramTracker {
            buckets: Mutex::new(Buckets::<T>::new(*count)),
        }
    }

    fn update(&self, (value, index): (T, usize)) {
        let mut buckets = self.buckets.lock().unwrap_or_else(|err| err.into_inner());

        buckets.bin(index, value);
        buckets.sum(value);
    }

    fn clone_and_reset(&self, count: &usize) -> Self {
        let mut current = self.buckets.lock().unwrap_or_else(|err| err.into_inner());
        let cloned = replace(current.deref_mut(), Buckets::new(*count));
        Self {
            buckets: Mutex::new(cloned),
        }
    }
}

#[derive(Default)]
struct Buckets<T> {
    counts: Vec<u64>,
    count: u64,
    total: T,
    min: T,
    max: T,
}

impl<T: Number> Buckets<T> {
    /// returns buckets with `n` bins.
    fn new(n: usize) -> Buckets<T> {
        Buckets {
            counts: vec![0; n],
            min: T::max(),
            max: T::min(),
            ..Default::default()
        }
    }

    fn sum(&mut self, value: T) {
        self.total = self.total.wrapping_add(value);
    }

    fn bin(&mut self, idx: usize, value: T) {
        self.counts[idx] += 1;
        self.count += 1;
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value
        }
    }
}

/// Summarizes a set of measurements as a histogram with explicitly defined
/// buckets.
pub(crate) struct Histogram<T: Number> {
    value_map: ValueMap<HistogramTracker<T>>,
    init_time: AggregateTimeInitiator,
    temporality: Temporality,
    filter: AttributeSetFilter,
    bounds: Vec<f64>,
    record_min_max: bool,
    record_sum: bool,
}

impl<T: Number> Histogram<T> {
    pub(crate) fn new(
        temporality: Temporality,
        filter: AttributeSetFilter,
        cardinality_limit: usize,
        mut bounds: Vec<f64>,
        record_min_max: bool,
        record_sum: bool,
    ) -> Self {
        bounds.retain(|v| v.is_finite());
        bounds.sort_by(|a, b| a.total_cmp(b));
        bounds.dedup();

        let buckets_count = bounds.len() + 1;
        Histogram {
            value_map: ValueMap::new(buckets_count, cardinality_limit),
            init_time: AggregateTimeInitiator::default(),
            temporality,
            filter,
            bounds,
            record_min_max,
            record_sum,
        }
    }

    /// Index of the bucket `value` falls into.
    ///
    /// Buckets include their lower boundary, so a value equal to a boundary
    /// lands in the bucket above it. Values past the last boundary land in the
    /// final bucket at `bounds.len()`.
    fn bucket_index(&self, value: f64) -> usize {
        self.bounds.partition_point(|&b| b <= value)
    }

    fn to_point(
        &self,
        attributes: Vec<KeyValue>,
        b: &Buckets<T>,
        time: &AggregateTime,
    ) -> HistogramDataPoint<T> {
        let record_min_max = self.record_min_max && b.count > 0;
        HistogramDataPoint {
            attributes,
            start_time: time.start,
            time: time.current,
            count: b.count,
            bounds: self.bounds.clone(),
            bucket_counts: b.counts.clone(),
            sum: if self.record_sum {
                b.total
            } else {
                T::default()
            },
            min: record_min_max.then_some(b.min),
            max: record_min_max.then_some(b.max),
        }
    }

    fn delta(&self) -> data::Histogram<T> {
        let time = self.init_time.delta();
        let mut data_points = Vec::new();

        self.value_map
            .collect_and_reset(&mut data_points, |attributes, aggr| {
                let b = aggr
                    .buckets
                    .into_inner()
                    .unwrap_or_else(|err| err.into_inner());
                self.to_point(attributes, &b, &time)
            });

        data::Histogram {
            data_points,
            temporality: Temporality::Delta,
        }
    }

    fn cumulative(&self) -> data::Histogram<T> {
        let time = self.init_time.cumulative();
        let mut data_points = Vec::new();

        self.value_map
            .collect_readonly(&mut data_points, |attributes, aggr| {
                let b = aggr.buckets.lock().unwrap_or_else(|err| err.into_inner());
                self.to_point(attributes, &b, &time)
            });

        data::Histogram {
            data_points,
            temporality: Temporality::Cumulative,
        }
    }
}

impl<T> Measure<T> for Histogram<T>
where
    T: Number,
{
    fn call(&self, measurement: T, attrs: &[KeyValue]) {
        if is_invalid_measurement(measurement, false) {
            return;
        }
        let index = self.bucket_index(measurement.into_float());
        self.filter.apply(attrs, |filtered, _| {
            self.value_map.measure((measurement, index), filtered);
        })
    }
}

impl<T> ComputeAggregation for Histogram<T>
where
    T: Number,
{
    fn call(&self) -> AggregatedMetrics {
        let data = match self.temporality {
            Temporality::Delta => self.delta(),
            _ => self.cumulative(),
        };
        T::make_aggregated_metrics(MetricData::Histogram(data))
    }
}
