use opentelemetry::KeyValue;

use crate::metrics::data::{self, AggregatedMetrics, MetricData, SumDataPoint, Temporality};

use super::aggregate::{AggregateTimeInitiator, AttributeSetFilter};
use super::{is_invalid_measurement, Aggregator, AtomicTracker, ComputeAggregation, Measure, Number};
use super::{AtomicallyUpdate, ValueMap};

struct Increment<T>
where
    T: AtomicallyUpdate<T>,
{
    value: T::AtomicTracker,
}

impl<T> Aggregator for Increment<T>
where
    T: Number,
{
    type InitConfig = ();
    type PreComputedValue = T;

    fn create(_init: &()) -> Self {
        Self {
            value: T::new_atomic_tracker(T::default()),
        }
    }

    fn update(&self, value: T) {
        self.value.add(value)
    }

    fn clone_and_reset(&self, _: &()) -> Self {
        Self {
            value: T::new_atomic_tracker(self.value.get_and_reset_value()),
        }
    }
}

/// Summarizes a set of measurements made as their arithmetic sum.
pub(crate) struct Sum<T: Number> {
    value_map: ValueMap<Increment<T>>,
    init_time: AggregateTimeInitiator,
    temporality: Temporality,
    filter: AttributeSetFilter,
    monotonic: bool,
}

impl<T: Number> Sum<T> {
    /// Returns an aggregator that summarizes a set of measurements as their
    /// arithmetic sum.
    ///
    /// Each sum is scoped by attributes and the aggregation cycle the measurements
    /// were made in.
    pub(crate) fn new(
        temporality: Temporality,
        filter: AttributeSetFilter,
        cardinality_limit: usize,
        monotonic: bool,
    ) -> Self {
        Sum {
            value_map: ValueMap::new((), cardinality_limit),
            init_time: AggregateTimeInitiator::default(),
            temporality,
            filter,
            monotonic,
        }
    }

    fn delta(&self) -> data::Sum<T> {
        let time = self.init_time.delta();
        let mut data_points = Vec::new();
        self.value_map
            .collect_and_reset(&mut data_points, |attributes, aggr| SumDataPoint {
                attributes,
                start_time: time.start,
                time: time.current,
                value: aggr.value.get_value(),
            });

        data::Sum {
            data_points,
            temporality: Temporality::Delta,
            is_monotonic: self.monotonic,
        }
    }

    fn cumulative(&self) -> data::Sum<T> {
        let time = self.init_time.cumulative();
        let mut data_points = Vec::new();
        self.value_map
            .collect_readonly(&mut data_points, |attributes, aggr| SumDataPoint {
                attributes,
                start_time: time.start,
                time: time.current,
                value: aggr.value.get_value(),
            });

        data::Sum {
            data_points,
            temporality: Temporality::Cumulative,
            is_monotonic: self.monotonic,
        }
    }
}

impl<T> Measure<T> for Sum<T>
where
    T: Number,
{
    fn call(&self, measurement: T, attrs: &[KeyValue]) {
        if is_invalid_measurement(measurement, self.monotonic) {
            return;
        }
        self.filter.apply(attrs, |filtered, _| {
            self.value_map.measure(measurement, filtered);
        })
    }
}

impl<T> ComputeAggregation for Sum<T>
where
    T: Number,
{
    fn call(&self) -> AggregatedMetrics {
        let data = match self.temporality {
            Temporality::Delta => self.delta(),
            _ => self.cumulative(),
        };
        T::make_aggregated_metrics(MetricData::Sum(data))
    }
}
