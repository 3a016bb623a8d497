use std::{
    collections::HashSet,
    marker,
    mem::replace,
    ops::DerefMut,
    sync::{Arc, Mutex},
    time::SystemTime,
};

use opentelemetry::{Key, KeyValue};

use crate::metrics::data::{AggregatedMetrics, Temporality};

use super::{
    histogram::Histogram, last_value::LastValue, precomputed_sum::PrecomputedSum, sum::Sum,
    Number,
};

/// Default number of attribute sets a single stream tracks before folding
/// new sets into the overflow set.
pub(crate) const STREAM_CARDINALITY_LIMIT: usize = 2000;

/// Receives measurements to be aggregated.
pub(crate) trait Measure<T>: Send + Sync + 'static {
    fn call(&self, measurement: T, attrs: &[KeyValue]);
}

/// Produces the snapshot of an aggregation for one collection cycle.
pub(crate) trait ComputeAggregation: Send + Sync + 'static {
    /// Snapshot the current state. For delta aggregations this also resets
    /// the state, so measurements racing with the call land in the next cycle.
    fn call(&self) -> AggregatedMetrics;
}

/// Separate `measure` and `collect` functions for an aggregate.
pub(crate) struct AggregateFns<T> {
    pub(crate) measure: Arc<dyn Measure<T>>,
    pub(crate) collect: Arc<dyn ComputeAggregation>,
}

/// Creates aggregate functions out of aggregate instance
impl<A, T> From<A> for AggregateFns<T>
where
    A: Measure<T> + ComputeAggregation,
{
    fn from(value: A) -> Self {
        let inst = Arc::new(value);
        Self {
            measure: inst.clone(),
            collect: inst,
        }
    }
}

pub(crate) struct AggregateTime {
    pub(crate) start: SystemTime,
    pub(crate) current: SystemTime,
}

/// Tracks the start time of an aggregation across collection cycles.
pub(crate) struct AggregateTimeInitiator(Mutex<SystemTime>);

impl AggregateTimeInitiator {
    /// Starts a new cycle: returns the previous cycle start and moves it to now.
    pub(crate) fn delta(&self) -> AggregateTime {
        let current_time = SystemTime::now();
        let start_time = self
            .0
            .lock()
            .map(|mut start| replace(start.deref_mut(), current_time))
            .unwrap_or(current_time);
        AggregateTime {
            start: start_time,
            current: current_time,
        }
    }

    /// The start time never moves.
    pub(crate) fn cumulative(&self) -> AggregateTime {
        let current_time = SystemTime::now();
        let start_time = self.0.lock().map(|start| *start).unwrap_or(current_time);
        AggregateTime {
            start: start_time,
            current: current_time,
        }
    }

    pub(crate) fn for_temporality(&self, temporality: Temporality) -> AggregateTime {
        match temporality {
            Temporality::Delta => self.delta(),
            _ => self.cumulative(),
        }
    }
}

impl Default for AggregateTimeInitiator {
    fn default() -> Self {
        Self(Mutex::new(SystemTime::now()))
    }
}

/// Applies an attribute key allow-list to measurements.
/// No-op, if no allow-list is set.
#[derive(Clone, Default)]
pub(crate) struct AttributeSetFilter {
    allowed: Option<Arc<HashSet<Key>>>,
}

impl AttributeSetFilter {
    pub(crate) fn new(allowed: Option<Arc<HashSet<Key>>>) -> Self {
        Self { allowed }
    }

    /// Runs `run` with the filtered attributes and whether any attribute was
    /// removed.
    pub(crate) fn apply(&self, attrs: &[KeyValue], run: impl FnOnce(&[KeyValue], bool)) {
        if let Some(allowed) = &self.allowed {
            let filtered_attrs: Vec<KeyValue> = attrs
                .iter()
                .filter(|kv| allowed.contains(&kv.key))
                .cloned()
                .collect();
            let removed = filtered_attrs.len() != attrs.len();
            run(&filtered_attrs, removed);
        } else {
            run(attrs, false);
        };
    }
}

/// Builds aggregate functions
pub(crate) struct AggregateBuilder<T> {
    /// The temporality used for the returned aggregate functions.
    temporality: Temporality,

    /// The attribute filter the aggregate function will use on the input of
    /// measurements.
    filter: AttributeSetFilter,

    /// Maximum number of attribute sets per aggregation cycle.
    cardinality_limit: usize,

    _marker: marker::PhantomData<T>,
}

impl<T: Number> AggregateBuilder<T> {
    pub(crate) fn new(
        temporality: Temporality,
        filter: AttributeSetFilter,
        cardinality_limit: Option<usize>,
    ) -> Self {
        AggregateBuilder {
            temporality,
            filter,
            cardinality_limit: cardinality_limit.unwrap_or(STREAM_CARDINALITY_LIMIT),
            _marker: marker::PhantomData,
        }
    }

    /// Builds a last-value aggregate function input and output.
    ///
    /// With `observed` set, only values observed since the previous collection
    /// are reported.
    pub(crate) fn last_value(&self, observed: bool) -> AggregateFns<T> {
        LastValue::new(
            self.temporality,
            self.filter.clone(),
            self.cardinality_limit,
            observed,
        )
        .into()
    }

    /// Builds a precomputed sum aggregate function input and output.
    pub(crate) fn precomputed_sum(&self, monotonic: bool) -> AggregateFns<T> {
        PrecomputedSum::new(
            self.temporality,
            self.filter.clone(),
            self.cardinality_limit,
            monotonic,
        )
        .into()
    }

    /// Builds a sum aggregate function input and output.
    pub(crate) fn sum(&self, monotonic: bool) -> AggregateFns<T> {
        Sum::new(
            self.temporality,
            self.filter.clone(),
            self.cardinality_limit,
            monotonic,
        )
        .into()
    }

    /// Builds a histogram aggregate function input and output.
    pub(crate) fn explicit_bucket_histogram(
        &self,
        boundaries: Vec<f64>,
        record_min_max: bool,
        record_sum: bool,
    ) -> AggregateFns<T> {
        Histogram::new(
            self.temporality,
            self.filter.clone(),
            self.cardinality_limit,
            boundaries,
            record_min_max,
            record_sum,
        )
        .into()
    }
}
