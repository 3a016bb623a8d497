//! The document a collection cycle produces: one [ResourceMetrics] holding
//! per-scope groups of metrics, each with its data points.

use std::{borrow::Cow, time::SystemTime};

use opentelemetry::{InstrumentationScope, KeyValue};

use crate::Resource;

mod temporality;

pub use temporality::Temporality;

/// Everything one collection cycle produced, tagged with the pipeline's [Resource].
#[derive(Debug, Default)]
pub struct ResourceMetrics {
    /// Describes the process the metrics came from.
    pub resource: Resource,
    /// One entry per scope that reported data, in the order each scope first
    /// registered an instrument.
    pub scope_metrics: Vec<ScopeMetrics>,
}

/// The metrics of the instruments created under one scope.
#[derive(Default, Debug)]
pub struct ScopeMetrics {
    /// Identifies the library or component that created the instruments.
    pub scope: InstrumentationScope,
    /// Streams with at least one data point this cycle.
    pub metrics: Vec<Metric>,
}

/// One output stream: the time series of every attribute set it aggregated.
///
/// [Instrument]: crate::metrics::Instrument
#[derive(Debug)]
pub struct Metric {
    /// Stream name, after any view renames.
    pub name: Cow<'static, str>,
    /// Stream description. The first registration of a stream sets it.
    pub description: Cow<'static, str>,
    /// Unit of the reported values.
    pub unit: Cow<'static, str>,
    /// Data points, tagged with the numeric domain of the instrument.
    pub data: AggregatedMetrics,
}

/// Stream data in the numeric domain the instrument recorded in.
#[derive(Debug, Clone)]
pub enum AggregatedMetrics {
    /// Floating point instruments.
    F64(MetricData<f64>),
    /// Unsigned integer instruments.
    U64(MetricData<u64>),
    /// Signed integer instruments.
    I64(MetricData<i64>),
}

/// The shape of a stream's data, decided by its aggregation.
#[derive(Debug, Clone)]
pub enum MetricData<T> {
    /// Produced by the last value aggregation.
    Gauge(Gauge<T>),
    /// Produced by the sum aggregation.
    Sum(Sum<T>),
    /// Produced by the explicit bucket histogram aggregation.
    Histogram(Histogram<T>),
}

impl<T> MetricData<T> {
    /// The number of data points this aggregation holds.
    pub fn len(&self) -> usize {
        match self {
            MetricData::Gauge(gauge) => gauge.data_points.len(),
            MetricData::Sum(sum) => sum.data_points.len(),
            MetricData::Histogram(hist) => hist.data_points.len(),
        }
    }

    /// Returns `true` if there are no data points.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AggregatedMetrics {
    /// The number of data points, regardless of value type.
    pub fn len(&self) -> usize {
        match self {
            AggregatedMetrics::F64(data) => data.len(),
            AggregatedMetrics::U64(data) => data.len(),
            AggregatedMetrics::I64(data) => data.len(),
        }
    }

    /// Returns `true` if there are no data points.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<MetricData<f64>> for AggregatedMetrics {
    fn from(value: MetricData<f64>) -> Self {
        AggregatedMetrics::F64(value)
    }
}

impl From<MetricData<i64>> for AggregatedMetrics {
    fn from(value: MetricData<i64>) -> Self {
        AggregatedMetrics::I64(value)
    }
}

impl From<MetricData<u64>> for AggregatedMetrics {
    fn from(value: MetricData<u64>) -> Self {
        AggregatedMetrics::U64(value)
    }
}

impl<T> From<Gauge<T>> for MetricData<T> {
    fn from(value: Gauge<T>) -> Self {
        MetricData::Gauge(value)
    }
}

impl<T> From<Sum<T>> for MetricData<T> {
    fn from(value: Sum<T>) -> Self {
        MetricData::Sum(value)
    }
}

impl<T> From<Histogram<T>> for MetricData<T> {
    fn from(value: Histogram<T>) -> Self {
        MetricData::Histogram(value)
    }
}

/// The last value recorded for one attribute set.
#[derive(Debug, Clone, PartialEq)]
pub struct GaugeDataPoint<T> {
    /// The attribute set, sorted by key.
    pub attributes: Vec<KeyValue>,
    /// Start of the reporting window, when known.
    pub start_time: Option<SystemTime>,
    /// When the snapshot was taken.
    pub time: SystemTime,
    /// The aggregated value.
    pub value: T,
}

/// Last value data of a stream.
#[derive(Debug, Clone)]
pub struct Gauge<T> {
    /// One point per attribute set.
    pub data_points: Vec<GaugeDataPoint<T>>,
}

/// The sum for one attribute set.
#[derive(Debug, Clone, PartialEq)]
pub struct SumDataPoint<T> {
    /// The attribute set, sorted by key.
    pub attributes: Vec<KeyValue>,
    /// Start of the reporting window.
    pub start_time: SystemTime,
    /// When the snapshot was taken.
    pub time: SystemTime,
    /// The aggregated value.
    pub value: T,
}

/// Sum data of a stream.
#[derive(Debug, Clone)]
pub struct Sum<T> {
    /// One point per attribute set.
    pub data_points: Vec<SumDataPoint<T>>,
    /// Whether values are totals or per-cycle changes.
    pub temporality: Temporality,
    /// `true` for counters, `false` for up-down counters.
    pub is_monotonic: bool,
}

/// Histogram data of a stream.
#[derive(Debug, Clone)]
pub struct Histogram<T> {
    /// One point per attribute set.
    pub data_points: Vec<HistogramDataPoint<T>>,
    /// Whether values are totals or per-cycle changes.
    pub temporality: Temporality,
}

/// The distribution of values recorded for one attribute set.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramDataPoint<T> {
    /// The attribute set, sorted by key.
    pub attributes: Vec<KeyValue>,
    /// Start of the reporting window.
    pub start_time: SystemTime,
    /// When the snapshot was taken.
    pub time: SystemTime,
    /// Number of values recorded.
    pub count: u64,
    /// The boundaries between buckets, sorted ascending.
    ///
    /// Bucket `i` counts values `v` with `bounds[i-1] <= v < bounds[i]`; the
    /// first bucket has no lower bound and the last no upper bound.
    pub bounds: Vec<f64>,
    /// The count of each of the buckets, `bounds.len() + 1` entries.
    pub bucket_counts: Vec<u64>,

    /// Smallest value, if min/max recording is on and a value was seen.
    pub min: Option<T>,
    /// Largest value, if min/max recording is on and a value was seen.
    pub max: Option<T>,
    /// Sum of the values, zero if sum recording is off.
    pub sum: T,
}
