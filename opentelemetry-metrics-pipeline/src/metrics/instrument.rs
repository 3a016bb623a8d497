use std::{borrow::Cow, collections::HashSet, fmt, sync::Arc};

use opentelemetry::{InstrumentationScope, Key, KeyValue};

use crate::error::{MetricError, MetricResult};
use crate::metrics::{
    aggregation::Aggregation,
    internal::Measure,
    pipeline::{callback_pipeline, PipelineMeasures},
};

use super::meter::{validate_instrument_name, validate_instrument_unit};

/// The identifier of a group of instruments that all perform the same function.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum InstrumentKind {
    /// Identifies a group of instruments that record increasing values synchronously
    /// with the code path they are measuring.
    Counter,
    /// A group of instruments that record increasing and decreasing values
    /// synchronously with the code path they are measuring.
    UpDownCounter,
    /// A group of instruments that record a distribution of values synchronously with
    /// the code path they are measuring.
    Histogram,
    /// A group of instruments that record increasing values in an asynchronous
    /// callback.
    ObservableCounter,
    /// A group of instruments that record increasing and decreasing values in an
    /// asynchronous callback.
    ObservableUpDownCounter,
    /// A group of instruments that record current value synchronously with
    /// the code path they are measuring.
    Gauge,
    /// A group of instruments that record current values in an asynchronous callback.
    ObservableGauge,
}

/// Describes an instrument at creation and, with any field left empty, the
/// criteria a view matches instruments with.
///
/// Empty fields are wildcards: an `Instrument` with only a name set matches
/// instruments of every kind, unit and scope with that name.
///
/// # Example
///
/// ```
/// use opentelemetry_metrics_pipeline::metrics::{Instrument, InstrumentKind};
///
/// let criteria = Instrument::new()
///     .name("http.server.*")
///     .kind(InstrumentKind::Histogram);
/// # drop(criteria)
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
#[non_exhaustive]
pub struct Instrument {
    /// The human-readable identifier of the instrument.
    pub name: Cow<'static, str>,
    /// Describes the purpose of the instrument.
    pub description: Cow<'static, str>,
    /// The functional group of the instrument.
    pub kind: Option<InstrumentKind>,
    /// Unit is the unit of measurement recorded by the instrument.
    pub unit: Cow<'static, str>,
    /// The instrumentation that created the instrument.
    pub scope: InstrumentationScope,
}

impl Instrument {
    /// Create a new instrument with default values
    pub fn new() -> Self {
        Instrument::default()
    }

    /// Set the instrument name.
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the instrument description.
    pub fn description(mut self, description: impl Into<Cow<'static, str>>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the instrument kind.
    pub fn kind(mut self, kind: InstrumentKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Set the instrument unit.
    pub fn unit(mut self, unit: impl Into<Cow<'static, str>>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Set the instrument scope.
    pub fn scope(mut self, scope: InstrumentationScope) -> Self {
        self.scope = scope;
        self
    }

    /// empty returns if all fields of i are their default-value.
    pub(crate) fn is_empty(&self) -> bool {
        self.name.is_empty()
            && self.description.is_empty()
            && self.kind.is_none()
            && self.unit.is_empty()
            && self.scope == InstrumentationScope::default()
    }

    pub(crate) fn matches_description(&self, other: &Instrument) -> bool {
        self.description.is_empty() || self.description == other.description
    }

    pub(crate) fn matches_kind(&self, other: &Instrument) -> bool {
        self.kind.is_none() || self.kind == other.kind
    }

    pub(crate) fn matches_unit(&self, other: &Instrument) -> bool {
        self.unit.is_empty() || self.unit.as_ref() == other.unit.as_ref()
    }

    pub(crate) fn matches_scope(&self, other: &Instrument) -> bool {
        (self.scope.name().is_empty() || self.scope.name() == other.scope.name())
            && (self.scope.version().is_none()
                || self.scope.version() == other.scope.version())
            && (self.scope.schema_url().is_none()
                || self.scope.schema_url() == other.scope.schema_url())
    }
}

/// A builder for creating [Stream]s.
///
/// # Example
///
/// ```
/// use opentelemetry_metrics_pipeline::metrics::{Aggregation, Stream};
///
/// let stream = Stream::builder()
///     .with_name("my_stream")
///     .with_aggregation(Aggregation::Sum)
///     .with_cardinality_limit(100)
///     .build()
///     .unwrap();
/// # drop(stream)
/// ```
#[derive(Default, Debug)]
pub struct StreamBuilder {
    name: Option<Cow<'static, str>>,
    description: Option<Cow<'static, str>>,
    unit: Option<Cow<'static, str>>,
    aggregation: Option<Aggregation>,
    allowed_attribute_keys: Option<Arc<HashSet<Key>>>,
    cardinality_limit: Option<usize>,
}

impl StreamBuilder {
    pub(crate) fn new() -> Self {
        StreamBuilder::default()
    }

    /// Set the stream name. If this is not set, the instrument name is used.
    pub fn with_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the stream description. If this is not set, the instrument
    /// description is used.
    pub fn with_description(mut self, description: impl Into<Cow<'static, str>>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the stream unit. If this is not set, the instrument unit is used.
    pub fn with_unit(mut self, unit: impl Into<Cow<'static, str>>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Set the stream aggregation. If not set, the default aggregation for the
    /// instrument kind is used.
    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = Some(aggregation);
        self
    }

    /// Set the stream allowed attribute keys.
    ///
    /// Any attribute recorded for the stream with a key not in this set will be
    /// dropped. If the set is empty, all attributes will be dropped.
    /// If this method is not used, all attributes will be kept.
    pub fn with_allowed_attribute_keys(
        mut self,
        attribute_keys: impl IntoIterator<Item = Key>,
    ) -> Self {
        self.allowed_attribute_keys = Some(Arc::new(attribute_keys.into_iter().collect()));
        self
    }

    /// Set the stream cardinality limit. If this is not set, the default limit of 2000 will be used.
    pub fn with_cardinality_limit(mut self, limit: usize) -> Self {
        self.cardinality_limit = Some(limit);
        self
    }

    /// Validates the configuration and builds the [Stream].
    pub fn build(self) -> MetricResult<Stream> {
        if let Some(name) = &self.name {
            validate_instrument_name(name)?;
        }

        if let Some(unit) = &self.unit {
            validate_instrument_unit(unit)?;
        }

        if self.cardinality_limit == Some(0) {
            return Err(MetricError::Config(
                "cardinality limit must be greater than 0".into(),
            ));
        }

        if let Some(aggregation) = &self.aggregation {
            aggregation.validate()?;
        }

        Ok(Stream {
            name: self.name,
            description: self.description,
            unit: self.unit,
            aggregation: self.aggregation,
            allowed_attribute_keys: self.allowed_attribute_keys,
            cardinality_limit: self.cardinality_limit,
        })
    }
}

/// Describes the stream of data an instrument produces.
///
/// Returned by views to customize the output of matching instruments. Unset
/// fields fall back to the matched instrument's own values.
#[derive(Clone, Default, Debug)]
pub struct Stream {
    /// The human-readable identifier of the stream.
    pub(crate) name: Option<Cow<'static, str>>,
    /// Describes the purpose of the data.
    pub(crate) description: Option<Cow<'static, str>>,
    /// the unit of measurement recorded.
    pub(crate) unit: Option<Cow<'static, str>>,
    /// Aggregation the stream uses for an instrument.
    pub(crate) aggregation: Option<Aggregation>,
    /// An allow-list of attribute keys that will be preserved for the stream.
    ///
    /// Any attribute recorded for the stream with a key not in this set will be
    /// dropped. If the set is empty, all attributes will be dropped, if `None` all
    /// attributes will be kept.
    pub(crate) allowed_attribute_keys: Option<Arc<HashSet<Key>>>,
    /// Cardinality limit for the stream.
    pub(crate) cardinality_limit: Option<usize>,
}

impl Stream {
    /// Create a new stream builder with default values.
    pub fn builder() -> StreamBuilder {
        StreamBuilder::new()
    }
}

/// The identifying properties of a stream.
///
/// Two streams with the same id share one aggregator. The description is not
/// part of the id; the first one seen is reported.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct InstrumentId {
    /// The human-readable identifier of the stream.
    pub(crate) name: Cow<'static, str>,
    /// Defines the functional group of the instrument.
    pub(crate) kind: InstrumentKind,
    /// The unit of measurement recorded.
    pub(crate) unit: Cow<'static, str>,
    /// Number is the underlying data type of the instrument.
    pub(crate) number: Cow<'static, str>,
    /// Name of the resolved aggregation.
    pub(crate) aggregation: Cow<'static, str>,
    pub(crate) monotonic: bool,
}

impl InstrumentId {
    /// Instrument names are considered case-insensitive ASCII.
    ///
    /// Standardize the instrument name to always be lowercase so it can be compared
    /// via hash.
    pub(crate) fn normalize(&mut self) {
        if self.name.chars().any(|c| c.is_ascii_uppercase()) {
            self.name = self.name.to_ascii_lowercase().into();
        }
    }
}

/// The measures an instrument feeds, one per resolved stream per reader.
pub(crate) struct ResolvedMeasures<T> {
    pub(crate) measures: Vec<Arc<dyn Measure<T>>>,
}

impl<T: Copy + 'static> ResolvedMeasures<T> {
    pub(crate) fn new(measures: Vec<Arc<dyn Measure<T>>>) -> Self {
        ResolvedMeasures { measures }
    }

    fn measure(&self, val: T, attrs: &[KeyValue]) {
        for measure in &self.measures {
            measure.call(val, attrs)
        }
    }
}

/// Records observations made by callbacks of observable instruments.
pub trait AsyncInstrument<T>: Send + Sync {
    /// Records a measurement for the current collection cycle.
    fn observe(&self, measurement: T, attributes: &[KeyValue]);
}

/// Callback registered on a single observable instrument.
pub(crate) type Callback<T> = Box<dyn Fn(&dyn AsyncInstrument<T>) + Send + Sync>;

/// The measures of an observable instrument, kept per pipeline.
///
/// An observation made while a pipeline runs its callbacks only reaches that
/// pipeline's measures, so collecting one reader never feeds another. Any
/// other observation reaches every pipeline.
pub(crate) struct Observable<T> {
    pipelines: Vec<PipelineMeasures<T>>,
}

impl<T: Copy + 'static> Observable<T> {
    pub(crate) fn new(pipelines: Vec<PipelineMeasures<T>>) -> Self {
        Observable { pipelines }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.pipelines.iter().any(|p| !p.measures.is_empty())
    }
}

impl<T> Observable<T> {
    fn stream_count(&self) -> usize {
        self.pipelines.iter().map(|p| p.measures.len()).sum()
    }
}

impl<T: Copy + Send + Sync + 'static> AsyncInstrument<T> for Observable<T> {
    fn observe(&self, measurement: T, attrs: &[KeyValue]) {
        let running = callback_pipeline()
            .filter(|id| self.pipelines.iter().any(|p| p.pipeline == *id));

        for pipeline in &self.pipelines {
            if running.is_some_and(|id| id != pipeline.pipeline) {
                continue;
            }
            for measure in &pipeline.measures {
                measure.call(measurement, attrs)
            }
        }
    }
}

/// An observable instrument that can take part in a callback registered with
/// [SdkMeter::register_callback].
///
/// [SdkMeter::register_callback]: crate::metrics::SdkMeter::register_callback
pub trait ObservableInstrument: fmt::Debug + Send + Sync {
    /// Whether any reader aggregates the observations of this instrument.
    ///
    /// Instruments dropped by every view, or created invalid, are inactive.
    fn is_active(&self) -> bool;
}

macro_rules! sync_instrument {
    ($(#[$doc:meta])* $name:ident, $method:ident) => {
        $(#[$doc])*
        pub struct $name<T> {
            inner: Arc<ResolvedMeasures<T>>,
        }

        impl<T: Copy + 'static> $name<T> {
            pub(crate) fn new(inner: ResolvedMeasures<T>) -> Self {
                $name {
                    inner: Arc::new(inner),
                }
            }

            /// Records a measurement with the given attributes.
            ///
            /// Never fails; invalid measurements are dropped.
            pub fn $method(&self, value: T, attributes: &[KeyValue]) {
                self.inner.measure(value, attributes)
            }
        }

        impl<T> Clone for $name<T> {
            fn clone(&self) -> Self {
                $name {
                    inner: Arc::clone(&self.inner),
                }
            }
        }

        impl<T> fmt::Debug for $name<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("streams", &self.inner.measures.len())
                    .finish()
            }
        }
    };
}

sync_instrument!(
    /// An instrument that records increasing values.
    Counter,
    add
);
sync_instrument!(
    /// An instrument that records increasing and decreasing values.
    UpDownCounter,
    add
);
sync_instrument!(
    /// An instrument that records a distribution of values.
    Histogram,
    record
);
sync_instrument!(
    /// An instrument that records the current value.
    Gauge,
    record
);

macro_rules! observable_instrument {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        pub struct $name<T> {
            inner: Arc<Observable<T>>,
        }

        impl<T: Copy + Send + Sync + 'static> $name<T> {
            pub(crate) fn new(inner: Arc<Observable<T>>) -> Self {
                $name { inner }
            }

            /// Records an observation for the current collection cycle.
            ///
            /// Meant to be called from a callback registered with
            /// [SdkMeter::register_callback]; observations made outside a
            /// callback are reported by the next collection.
            ///
            /// [SdkMeter::register_callback]: crate::metrics::SdkMeter::register_callback
            pub fn observe(&self, value: T, attributes: &[KeyValue]) {
                self.inner.observe(value, attributes)
            }
        }

        impl<T: Copy + Send + Sync + 'static> ObservableInstrument for $name<T> {
            fn is_active(&self) -> bool {
                self.inner.is_active()
            }
        }

        impl<T> Clone for $name<T> {
            fn clone(&self) -> Self {
                $name {
                    inner: Arc::clone(&self.inner),
                }
            }
        }

        impl<T> fmt::Debug for $name<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("streams", &self.inner.stream_count())
                    .finish()
            }
        }
    };
}

observable_instrument!(
    /// An instrument that reports increasing totals from a callback.
    ObservableCounter
);
observable_instrument!(
    /// An instrument that reports totals that may go up and down from a callback.
    ObservableUpDownCounter
);
observable_instrument!(
    /// An instrument that reports current values from a callback.
    ObservableGauge
);
