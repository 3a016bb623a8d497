use core::fmt;
use std::{borrow::Cow, marker::PhantomData, sync::Arc};

use opentelemetry::{otel_warn, InstrumentationScope};

use crate::{
    error::{MetricError, MetricResult},
    metrics::{
        aggregation::validate_bucket_boundaries,
        instrument::{
            AsyncInstrument, Callback, Counter, Gauge, Histogram, Instrument, InstrumentKind,
            Observable, ObservableCounter, ObservableGauge, ObservableInstrument,
            ObservableUpDownCounter, ResolvedMeasures, UpDownCounter,
        },
        internal::Number,
        pipeline::{PipelineMeasures, Pipelines, Registration, Resolver, SharedConflictIndex},
    },
    CollectContext,
};

// maximum length of instrument name
const INSTRUMENT_NAME_MAX_LENGTH: usize = 255;
// maximum length of instrument unit name
const INSTRUMENT_UNIT_NAME_MAX_LENGTH: usize = 63;
const INSTRUMENT_NAME_ALLOWED_NON_ALPHANUMERIC_CHARS: [char; 4] = ['_', '.', '-', '/'];

// instrument validation error strings
pub(crate) const INSTRUMENT_NAME_EMPTY: &str = "instrument name must be non-empty";
pub(crate) const INSTRUMENT_NAME_LENGTH: &str = "instrument name must be less than 256 characters";
pub(crate) const INSTRUMENT_NAME_INVALID_CHAR: &str =
    "characters in instrument name must be ASCII and belong to the alphanumeric characters, '_', '.', '-' and '/'";
pub(crate) const INSTRUMENT_NAME_FIRST_ALPHABETIC: &str =
    "instrument name must start with an alphabetic character";
pub(crate) const INSTRUMENT_UNIT_LENGTH: &str = "instrument unit must be less than 64 characters";
pub(crate) const INSTRUMENT_UNIT_INVALID_CHAR: &str = "characters in instrument unit must be ASCII";

/// Handles the creation and coordination of all metric instruments.
///
/// A meter represents a single instrumentation scope; all metric telemetry
/// produced by an instrumentation scope will use metric instruments from a
/// single meter. Meters are obtained from [SdkMeterProvider::meter] and are
/// cheap to clone.
///
/// Instrument creation never fails. An instrument with an invalid name or
/// unit, or one created after the provider was shut down, records nothing.
///
/// [SdkMeterProvider::meter]: crate::metrics::SdkMeterProvider::meter
#[derive(Clone)]
pub struct SdkMeter {
    scope: InstrumentationScope,
    pipes: Arc<Pipelines>,
    resolvers: Arc<Resolvers>,
}

struct Resolvers {
    u64_resolver: Resolver<u64>,
    i64_resolver: Resolver<i64>,
    f64_resolver: Resolver<f64>,
}

impl SdkMeter {
    pub(crate) fn new(scope: InstrumentationScope, pipes: Arc<Pipelines>) -> Self {
        let conflicts: SharedConflictIndex = Default::default();

        let resolvers = Resolvers {
            u64_resolver: Resolver::new(&pipes, Arc::clone(&conflicts)),
            i64_resolver: Resolver::new(&pipes, Arc::clone(&conflicts)),
            f64_resolver: Resolver::new(&pipes, conflicts),
        };

        SdkMeter {
            scope,
            pipes,
            resolvers: Arc::new(resolvers),
        }
    }

    /// The scope this meter creates instruments for.
    pub fn scope(&self) -> &InstrumentationScope {
        &self.scope
    }

    /// Registers a callback run once per collection, before any aggregator is
    /// read.
    ///
    /// The callback should observe the given instruments, usually clones of
    /// them it captured. It receives the collection's [CollectContext] and
    /// should return early once that context is done. An error returned by
    /// the callback is logged and does not fail the collection.
    ///
    /// If none of `instruments` is aggregated by any reader, nothing is
    /// registered and the returned [Registration] is a no-op.
    pub fn register_callback<F>(
        &self,
        instruments: &[&dyn ObservableInstrument],
        callback: F,
    ) -> MetricResult<Registration>
    where
        F: Fn(&CollectContext) -> MetricResult<()> + Send + Sync + 'static,
    {
        if self.pipes.is_shutdown() {
            return Err(MetricError::AlreadyShutdown);
        }
        if !instruments.iter().any(|inst| inst.is_active()) {
            return Ok(Registration::noop());
        }

        Ok(self.pipes.register_callback(callback))
    }

    /// Resolves the measures of a new instrument per pipeline, or none if the
    /// instrument is invalid.
    fn measures<T: Number>(
        &self,
        resolver: &Resolver<T>,
        kind: InstrumentKind,
        config: InstrumentConfig,
    ) -> Vec<PipelineMeasures<T>> {
        if self.pipes.is_shutdown() {
            otel_warn!(
                name: "InstrumentCreationFailed",
                meter_name = self.scope.name(),
                instrument_name = config.name.as_ref(),
                message = "Measurements from this instrument will be ignored.",
                reason = "The meter provider is already shut down.",
            );
            return Vec::new();
        }

        let validation = validate_instrument_name(&config.name)
            .and_then(|_| validate_instrument_unit(config.unit.as_deref().unwrap_or_default()))
            .and_then(|_| match &config.boundaries {
                Some(boundaries) => validate_bucket_boundaries(boundaries),
                None => Ok(()),
            });
        if let Err(err) = validation {
            otel_warn!(
                name: "InstrumentCreationFailed",
                meter_name = self.scope.name(),
                instrument_name = config.name.as_ref(),
                message = "Measurements from this instrument will be ignored.",
                reason = format!("{err}"),
            );
            return Vec::new();
        }

        let inst = Instrument {
            name: config.name,
            description: config.description.unwrap_or_default(),
            unit: config.unit.unwrap_or_default(),
            kind: Some(kind),
            scope: self.scope.clone(),
        };
        let name = inst.name.clone();

        let (groups, err) = resolver.measures(inst, config.boundaries);
        if let Some(err) = err {
            otel_warn!(
                name: "InstrumentCreationFailed",
                meter_name = self.scope.name(),
                instrument_name = name.as_ref(),
                message = "Measurements for the streams that failed to resolve will be ignored.",
                reason = format!("{err}"),
            );
        }
        groups
    }

    fn sync_measures<T: Number>(
        &self,
        resolver: &Resolver<T>,
        kind: InstrumentKind,
        config: InstrumentConfig,
    ) -> ResolvedMeasures<T> {
        let measures = self
            .measures(resolver, kind, config)
            .into_iter()
            .flat_map(|group| group.measures)
            .collect();
        ResolvedMeasures::new(measures)
    }

    /// Creates the shared state of an observable instrument and binds its
    /// callbacks to every pipeline. These callbacks live as long as the
    /// provider, and each run only feeds the pipeline that ran it.
    fn observable<T: Number>(
        &self,
        resolver: &Resolver<T>,
        kind: InstrumentKind,
        config: InstrumentConfig,
        callbacks: Vec<Callback<T>>,
    ) -> Arc<Observable<T>> {
        let observable = Arc::new(Observable::new(self.measures(resolver, kind, config)));
        if !observable.is_active() {
            return observable;
        }

        for callback in callbacks {
            let cb_inst = Arc::clone(&observable);
            let _ = self.pipes.register_callback(move |_| {
                callback(cb_inst.as_ref());
                Ok(())
            });
        }

        observable
    }
}

impl fmt::Debug for SdkMeter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Meter").field("scope", &self.scope).finish()
    }
}

/// The user supplied parts of an instrument.
#[derive(Debug, Default)]
struct InstrumentConfig {
    name: Cow<'static, str>,
    description: Option<Cow<'static, str>>,
    unit: Option<Cow<'static, str>>,
    boundaries: Option<Vec<f64>>,
}

/// Configuration for a synchronous instrument, created by the `*_counter`,
/// `*_up_down_counter`, `*_histogram` and `*_gauge` methods of [SdkMeter].
pub struct InstrumentBuilder<'a, I> {
    meter: &'a SdkMeter,
    config: InstrumentConfig,
    _marker: PhantomData<I>,
}

impl<'a, I> InstrumentBuilder<'a, I> {
    fn new(meter: &'a SdkMeter, name: Cow<'static, str>) -> Self {
        InstrumentBuilder {
            meter,
            config: InstrumentConfig {
                name,
                ..Default::default()
            },
            _marker: PhantomData,
        }
    }

    /// Set the description for this instrument
    pub fn with_description(mut self, description: impl Into<Cow<'static, str>>) -> Self {
        self.config.description = Some(description.into());
        self
    }

    /// Set the unit for this instrument.
    ///
    /// Unit is case sensitive(`kb` is not the same as `kB`).
    ///
    /// Unit must be:
    /// - ASCII string
    /// - No longer than 63 characters
    pub fn with_unit(mut self, unit: impl Into<Cow<'static, str>>) -> Self {
        self.config.unit = Some(unit.into());
        self
    }
}

impl<T> InstrumentBuilder<'_, Histogram<T>> {
    /// Set the boundaries used when no view configures this histogram.
    ///
    /// Boundaries must be finite and strictly increasing, otherwise the
    /// instrument records nothing.
    pub fn with_boundaries(mut self, boundaries: Vec<f64>) -> Self {
        self.config.boundaries = Some(boundaries);
        self
    }
}

impl<I> fmt::Debug for InstrumentBuilder<'_, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentBuilder")
            .field("config", &self.config)
            .field("kind", &std::any::type_name::<I>())
            .finish()
    }
}

/// Configuration for an observable instrument.
pub struct AsyncInstrumentBuilder<'a, I, M> {
    meter: &'a SdkMeter,
    config: InstrumentConfig,
    callbacks: Vec<Callback<M>>,
    _marker: PhantomData<I>,
}

impl<'a, I, M> AsyncInstrumentBuilder<'a, I, M> {
    fn new(meter: &'a SdkMeter, name: Cow<'static, str>) -> Self {
        AsyncInstrumentBuilder {
            meter,
            config: InstrumentConfig {
                name,
                ..Default::default()
            },
            callbacks: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Set the description for this instrument
    pub fn with_description(mut self, description: impl Into<Cow<'static, str>>) -> Self {
        self.config.description = Some(description.into());
        self
    }

    /// Set the unit for this instrument.
    ///
    /// Unit is case sensitive(`kb` is not the same as `kB`).
    pub fn with_unit(mut self, unit: impl Into<Cow<'static, str>>) -> Self {
        self.config.unit = Some(unit.into());
        self
    }

    /// Set the callback to be called for this instrument on every collection.
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&dyn AsyncInstrument<M>) + Send + Sync + 'static,
    {
        self.callbacks.push(Box::new(callback));
        self
    }
}

impl<I, M> fmt::Debug for AsyncInstrumentBuilder<'_, I, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncInstrumentBuilder")
            .field("config", &self.config)
            .field("kind", &std::any::type_name::<I>())
            .field("callbacks_len", &self.callbacks.len())
            .finish()
    }
}

macro_rules! build_sync_instrument {
    ($inst:ident, $num:ty, $kind:expr, $resolver:ident) => {
        impl InstrumentBuilder<'_, $inst<$num>> {
            /// Validates the instrument configuration and creates a new instrument.
            pub fn build(self) -> $inst<$num> {
                let meter = self.meter;
                $inst::new(meter.sync_measures(&meter.resolvers.$resolver, $kind, self.config))
            }
        }
    };
}

macro_rules! build_async_instrument {
    ($inst:ident, $num:ty, $kind:expr, $resolver:ident) => {
        impl AsyncInstrumentBuilder<'_, $inst<$num>, $num> {
            /// Validates the instrument configuration, creates a new instrument
            /// and registers its callbacks.
            pub fn build(self) -> $inst<$num> {
                let meter = self.meter;
                $inst::new(meter.observable(
                    &meter.resolvers.$resolver,
                    $kind,
                    self.config,
                    self.callbacks,
                ))
            }
        }
    };
}

build_sync_instrument!(Counter, u64, InstrumentKind::Counter, u64_resolver);
build_sync_instrument!(Counter, f64, InstrumentKind::Counter, f64_resolver);
build_sync_instrument!(UpDownCounter, i64, InstrumentKind::UpDownCounter, i64_resolver);
build_sync_instrument!(UpDownCounter, f64, InstrumentKind::UpDownCounter, f64_resolver);
build_sync_instrument!(Histogram, u64, InstrumentKind::Histogram, u64_resolver);
build_sync_instrument!(Histogram, f64, InstrumentKind::Histogram, f64_resolver);
build_sync_instrument!(Gauge, u64, InstrumentKind::Gauge, u64_resolver);
build_sync_instrument!(Gauge, i64, InstrumentKind::Gauge, i64_resolver);
build_sync_instrument!(Gauge, f64, InstrumentKind::Gauge, f64_resolver);

build_async_instrument!(ObservableCounter, u64, InstrumentKind::ObservableCounter, u64_resolver);
build_async_instrument!(ObservableCounter, f64, InstrumentKind::ObservableCounter, f64_resolver);
build_async_instrument!(
    ObservableUpDownCounter,
    i64,
    InstrumentKind::ObservableUpDownCounter,
    i64_resolver
);
build_async_instrument!(
    ObservableUpDownCounter,
    f64,
    InstrumentKind::ObservableUpDownCounter,
    f64_resolver
);
build_async_instrument!(ObservableGauge, u64, InstrumentKind::ObservableGauge, u64_resolver);
build_async_instrument!(ObservableGauge, i64, InstrumentKind::ObservableGauge, i64_resolver);
build_async_instrument!(ObservableGauge, f64, InstrumentKind::ObservableGauge, f64_resolver);

macro_rules! instrument_constructors {
    ($($(#[$doc:meta])* $method:ident => $builder:ident, $inst:ty $(, $m:ty)?;)*) => {
        impl SdkMeter {
            $(
                $(#[$doc])*
                pub fn $method(
                    &self,
                    name: impl Into<Cow<'static, str>>,
                ) -> $builder<'_, $inst $(, $m)?> {
                    $builder::new(self, name.into())
                }
            )*
        }
    };
}

instrument_constructors! {
    /// creates an instrument builder for recording increasing values.
    u64_counter => InstrumentBuilder, Counter<u64>;
    /// creates an instrument builder for recording increasing values.
    f64_counter => InstrumentBuilder, Counter<f64>;
    /// creates an instrument builder for recording changes of a value.
    i64_up_down_counter => InstrumentBuilder, UpDownCounter<i64>;
    /// creates an instrument builder for recording changes of a value.
    f64_up_down_counter => InstrumentBuilder, UpDownCounter<f64>;
    /// creates an instrument builder for recording a distribution of values.
    u64_histogram => InstrumentBuilder, Histogram<u64>;
    /// creates an instrument builder for recording a distribution of values.
    f64_histogram => InstrumentBuilder, Histogram<f64>;
    /// creates an instrument builder for recording independent values.
    u64_gauge => InstrumentBuilder, Gauge<u64>;
    /// creates an instrument builder for recording independent values.
    i64_gauge => InstrumentBuilder, Gauge<i64>;
    /// creates an instrument builder for recording independent values.
    f64_gauge => InstrumentBuilder, Gauge<f64>;
    /// creates an instrument builder for recording increasing totals via callback.
    u64_observable_counter => AsyncInstrumentBuilder, ObservableCounter<u64>, u64;
    /// creates an instrument builder for recording increasing totals via callback.
    f64_observable_counter => AsyncInstrumentBuilder, ObservableCounter<f64>, f64;
    /// creates an instrument builder for recording totals via callback.
    i64_observable_up_down_counter => AsyncInstrumentBuilder, ObservableUpDownCounter<i64>, i64;
    /// creates an instrument builder for recording totals via callback.
    f64_observable_up_down_counter => AsyncInstrumentBuilder, ObservableUpDownCounter<f64>, f64;
    /// creates an instrument builder for recording the current value via callback.
    u64_observable_gauge => AsyncInstrumentBuilder, ObservableGauge<u64>, u64;
    /// creates an instrument builder for recording the current value via callback.
    i64_observable_gauge => AsyncInstrumentBuilder, ObservableGauge<i64>, i64;
    /// creates an instrument builder for recording the current value via callback.
    f64_observable_gauge => AsyncInstrumentBuilder, ObservableGauge<f64>, f64;
}

pub(crate) fn validate_instrument_name(name: &str) -> MetricResult<()> {
    if name.is_empty() {
        return Err(MetricError::InvalidInstrumentConfiguration(
            INSTRUMENT_NAME_EMPTY,
        ));
    }
    if name.len() > INSTRUMENT_NAME_MAX_LENGTH {
        return Err(MetricError::InvalidInstrumentConfiguration(
            INSTRUMENT_NAME_LENGTH,
        ));
    }
    if name.starts_with(|c: char| !c.is_ascii_alphabetic()) {
        return Err(MetricError::InvalidInstrumentConfiguration(
            INSTRUMENT_NAME_FIRST_ALPHABETIC,
        ));
    }
    if name.contains(|c: char| {
        !c.is_ascii_alphanumeric() && !INSTRUMENT_NAME_ALLOWED_NON_ALPHANUMERIC_CHARS.contains(&c)
    }) {
        return Err(MetricError::InvalidInstrumentConfiguration(
            INSTRUMENT_NAME_INVALID_CHAR,
        ));
    }
    Ok(())
}

pub(crate) fn validate_instrument_unit(unit: &str) -> MetricResult<()> {
    if unit.len() > INSTRUMENT_UNIT_NAME_MAX_LENGTH {
        return Err(MetricError::InvalidInstrumentConfiguration(
            INSTRUMENT_UNIT_LENGTH,
        ));
    }
    if unit.contains(|c: char| !c.is_ascii()) {
        return Err(MetricError::InvalidInstrumentConfiguration(
            INSTRUMENT_UNIT_INVALID_CHAR,
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::metrics::{ManualReader, SdkMeterProvider};

    fn expect(result: MetricResult<()>, expected_error: &str) {
        if expected_error.is_empty() {
            assert!(result.is_ok());
        } else {
            assert!(matches!(
                result.unwrap_err(),
                MetricError::InvalidInstrumentConfiguration(msg) if msg == expected_error
            ));
        }
    }

    #[rstest]
    #[case("validateName", "")]
    #[case("_startWithNoneAlphabet", INSTRUMENT_NAME_FIRST_ALPHABETIC)]
    #[case("utf8char锈", INSTRUMENT_NAME_INVALID_CHAR)]
    #[case("", INSTRUMENT_NAME_EMPTY)]
    #[case("invalid name", INSTRUMENT_NAME_INVALID_CHAR)]
    #[case("allow/slash", "")]
    #[case("allow_under_score", "")]
    #[case("allow.dots.ok", "")]
    #[case("allow-dash", "")]
    fn instrument_name_validation(#[case] name: &str, #[case] expected_error: &str) {
        expect(validate_instrument_name(name), expected_error);
    }

    #[test]
    fn instrument_name_length() {
        expect(validate_instrument_name(&"a".repeat(255)), "");
        expect(validate_instrument_name(&"a".repeat(256)), INSTRUMENT_NAME_LENGTH);
    }

    #[rstest]
    #[case(
        "0123456789012345678901234567890123456789012345678901234567890123",
        INSTRUMENT_UNIT_LENGTH
    )]
    #[case("utf8char锈", INSTRUMENT_UNIT_INVALID_CHAR)]
    #[case("kb", "")]
    #[case("Kb/sec", "")]
    #[case("%", "")]
    #[case("", "")]
    fn instrument_unit_validation(#[case] unit: &str, #[case] expected_error: &str) {
        expect(validate_instrument_unit(unit), expected_error);
    }

    fn provider() -> SdkMeterProvider {
        SdkMeterProvider::builder()
            .with_reader(ManualReader::builder().build())
            .build()
    }

    #[test]
    fn invalid_instruments_are_noops() {
        let provider = provider();
        let meter = provider.meter("test");

        let counter = meter.u64_counter("_bad").build();
        let gauge = meter.f64_gauge("temperature").with_unit("°C").build();
        let observable = meter.u64_observable_counter("").build();

        assert_eq!(format!("{counter:?}"), "Counter { streams: 0 }");
        assert_eq!(format!("{gauge:?}"), "Gauge { streams: 0 }");
        assert!(!observable.is_active());
    }

    #[rstest]
    #[case(vec![1.0, 1.0])]
    #[case(vec![1.0, 2.0, 3.0, 2.0])]
    #[case(vec![1.0, 2.0, 3.0, f64::INFINITY, 4.0])]
    #[case(vec![1.0, 2.0, 3.0, f64::NAN])]
    #[case(vec![f64::NEG_INFINITY, 2.0, 3.0])]
    fn invalid_histogram_boundaries_are_noops(#[case] boundaries: Vec<f64>) {
        let provider = provider();
        let histogram = provider
            .meter("test")
            .f64_histogram("latency")
            .with_boundaries(boundaries)
            .build();

        assert_eq!(format!("{histogram:?}"), "Histogram { streams: 0 }");
    }

    #[test]
    fn instruments_after_shutdown_are_noops() {
        let provider = provider();
        let meter = provider.meter("test");
        provider.shutdown().unwrap();

        let counter = meter.u64_counter("requests").build();
        assert_eq!(format!("{counter:?}"), "Counter { streams: 0 }");
        assert!(matches!(
            meter.register_callback(&[], |_| Ok(())),
            Err(MetricError::AlreadyShutdown)
        ));
    }

    #[test]
    fn callback_without_active_instruments_is_noop() {
        let provider = provider();
        let meter = provider.meter("test");
        let inactive = meter.i64_observable_gauge("bad name").build();

        let reg = meter
            .register_callback(&[&inactive], |_| Ok(()))
            .unwrap();
        assert_eq!(format!("{reg:?}"), "Registration { pipelines: 0 }");

        let active = meter.i64_observable_gauge("queue.depth").build();
        assert!(active.is_active());
        let reg = meter
            .register_callback(&[&inactive, &active], |_| Ok(()))
            .unwrap();
        assert_eq!(format!("{reg:?}"), "Registration { pipelines: 1 }");
    }
}
