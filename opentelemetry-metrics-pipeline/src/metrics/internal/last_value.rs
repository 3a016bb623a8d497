use opentelemetry::KeyValue;

use crate::metrics::data::{self, AggregatedMetrics, GaugeDataPoint, MetricData, Temporality};

use super::aggregate::{AggregateTimeInitiator, AttributeSetFilter};
use super::{
    is_invalid_measurement, Aggregator, AtomicTracker, AtomicallyUpdate, ComputeAggregation,
    Measure, Number, ValueMap,
};

/// Holds the most recent value seen for an attribute set.
struct Assign<T>
where
    T: AtomicallyUpdate<T>,
{
    value: T::AtomicTracker,
}

impl<T> Aggregator for Assign<T>
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
        self.value.store(value)
    }

    fn clone_and_reset(&self, _: &()) -> Self {
        Self {
            value: T::new_atomic_tracker(self.value.get_and_reset_value()),
        }
    }
}

/// Summarizes a set of measurements as the last one made.
pub(crate) struct LastValue<T: Number> {
    value_map: ValueMap<Assign<T>>,
    init_time: AggregateTimeInitiator,
    temporality: Temporality,
    filter: AttributeSetFilter,
    /// Values come from callbacks; stale sets are dropped every cycle.
    observed: bool,
}

impl<T: Number> LastValue<T> {
    pub(crate) fn new(
        temporality: Temporality,
        filter: AttributeSetFilter,
        cardinality_limit: usize,
        observed: bool,
    ) -> Self {
        LastValue {
            value_map: ValueMap::new((), cardinality_limit),
            init_time: AggregateTimeInitiator::default(),
            temporality,
            filter,
            observed,
        }
    }
}

impl<T> Measure<T> for LastValue<T>
where
    T: Number,
{
    fn call(&self, measurement: T, attrs: &[KeyValue]) {
        if is_invalid_measurement(measurement, false) {
            return;
        }
        self.filter.apply(attrs, |filtered, _| {
            self.value_map.measure(measurement, filtered);
        })
    }
}

impl<T> ComputeAggregation for LastValue<T>
where
    T: Number,
{
    fn call(&self) -> AggregatedMetrics {
        let time = self.init_time.for_temporality(self.temporality);
        let mut data_points = Vec::new();
        let to_point = |attributes: Vec<KeyValue>, value: T| GaugeDataPoint {
            attributes,
            start_time: Some(time.start),
            time: time.current,
            value,
        };

        if self.observed {
            self.value_map
                .collect_and_reset(&mut data_points, |attributes, aggr| {
                    to_point(attributes, aggr.value.get_value())
                });
        } else {
            self.value_map
                .collect_readonly(&mut data_points, |attributes, aggr| {
                    to_point(attributes, aggr.value.get_value())
                });
        }

        T::make_aggregated_metrics(MetricData::Gauge(data::Gauge { data_points }))
    }
}
