use opentelemetry::KeyValue;

use crate::attributes::AttributeSet;
use crate::metrics::data::{self, AggregatedMetrics, MetricData, SumDataPoint, Temporality};

use super::aggregate::{AggregateTimeInitiator, AttributeSetFilter};
use super::{
    is_invalid_measurement, Aggregator, AtomicTracker, AtomicallyUpdate, ComputeAggregation,
    Measure, Number, ValueMap,
};
use std::{collections::HashMap, sync::Mutex};

/// A pre-computed total observed by a callback.
///
/// Observations normally replace the tracked value. When an attribute filter
/// removed keys, several observed sets map onto one tracked set and their
/// totals are added instead.
struct Observation<T>
where
    T: AtomicallyUpdate<T>,
{
    value: T::AtomicTracker,
}

impl<T> Aggregator for Observation<T>
where
    T: Number,
{
    type InitConfig = ();
    /// Value and whether to accumulate
    type PreComputedValue = (T, bool);

    fn create(_init: &()) -> Self {
        Self {
            value: T::new_atomic_tracker(T::default()),
        }
    }

    fn update(&self, (value, accumulate): (T, bool)) {
        if accumulate {
            self.value.add(value)
        } else {
            self.value.store(value)
        }
    }

    fn clone_and_reset(&self, _: &()) -> Self {
        Self {
            value: T::new_atomic_tracker(self.value.get_and_reset_value()),
        }
    }
}

/// Summarizes a set of pre-computed sums as their arithmetic sum.
///
/// Only the attribute sets observed since the previous collection are
/// reported. Delta temporality reports the change from the previously
/// reported total.
pub(crate) struct PrecomputedSum<T: Number> {
    value_map: ValueMap<Observation<T>>,
    init_time: AggregateTimeInitiator,
    temporality: Temporality,
    filter: AttributeSetFilter,
    monotonic: bool,
    reported: Mutex<HashMap<AttributeSet, T>>,
}

impl<T: Number> PrecomputedSum<T> {
    pub(crate) fn new(
        temporality: Temporality,
        filter: AttributeSetFilter,
        cardinality_limit: usize,
        monotonic: bool,
    ) -> Self {
        PrecomputedSum {
            value_map: ValueMap::new((), cardinality_limit),
            init_time: AggregateTimeInitiator::default(),
            temporality,
            filter,
            monotonic,
            reported: Mutex::new(Default::default()),
        }
    }

    fn delta(&self) -> data::Sum<T> {
        let time = self.init_time.delta();
        let mut data_points = Vec::new();

        let mut reported = match self.reported.lock() {
            Ok(r) => r,
            Err(_) => {
                return data::Sum {
                    data_points,
                    temporality: Temporality::Delta,
                    is_monotonic: self.monotonic,
                }
            }
        };
        let mut new_reported = HashMap::with_capacity(reported.len());

        self.value_map
            .collect_and_reset(&mut data_points, |attributes, aggr| {
                let key = AttributeSet::from(attributes.as_slice());
                let prev_value = reported.get(&key).copied().unwrap_or_default();
                let curr_value = aggr.value.get_value();
                new_reported.insert(key, curr_value);
                // a monotonic total going backwards means the source restarted
                let value = if self.monotonic && curr_value < prev_value {
                    curr_value
                } else {
                    curr_value.wrapping_sub(prev_value)
                };
                SumDataPoint {
                    attributes,
                    start_time: time.start,
                    time: time.current,
                    value,
                }
            });

        *reported = new_reported;

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
            .collect_and_reset(&mut data_points, |attributes, aggr| SumDataPoint {
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

impl<T> Measure<T> for PrecomputedSum<T>
where
    T: Number,
{
    fn call(&self, measurement: T, attrs: &[KeyValue]) {
        if is_invalid_measurement(measurement, self.monotonic) {
            return;
        }
        self.filter.apply(attrs, |filtered, removed| {
            self.value_map.measure((measurement, removed), filtered);
        })
    }
}

impl<T> ComputeAggregation for PrecomputedSum<T>
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
