use core::fmt;
use std::{
    borrow::Cow,
    cell::Cell,
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};

use opentelemetry::{otel_debug, otel_warn, InstrumentationScope};

use crate::{
    error::{MetricError, MetricResult},
    metrics::{
        aggregation::{Aggregation, DEFAULT_HISTOGRAM_BOUNDARIES},
        data::{Metric, ResourceMetrics, ScopeMetrics},
        instrument::{Instrument, InstrumentId, InstrumentKind, Stream},
        internal::{self, AggregateBuilder, AggregateFns, AttributeSetFilter, Number},
        reader::{MetricReader, SdkProducer},
        view::View,
    },
    CollectContext, Resource,
};

/// Connects all of the instruments created by a meter provider to a [MetricReader].
///
/// This is the object that will be registered when a meter provider is
/// created.
///
/// As instruments are created the instrument should be checked if it exists in
/// the views of a the reader, and if so each aggregate function should be added
/// to the pipeline.
#[doc(hidden)]
pub struct Pipeline {
    id: PipelineId,
    pub(crate) resource: Resource,
    reader: Box<dyn MetricReader>,
    views: Vec<Arc<dyn View>>,
    inner: Mutex<PipelineInner>,
    callbacks: Mutex<BTreeMap<u64, GenericCallback>>,
    next_callback_id: AtomicU64,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pipeline")
    }
}

/// Identifies a pipeline for the lifetime of the process.
pub(crate) type PipelineId = u64;

static NEXT_PIPELINE_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// The pipeline whose callbacks this thread is running.
    static CALLBACK_PIPELINE: Cell<Option<PipelineId>> = const { Cell::new(None) };
}

/// The pipeline whose callbacks the current thread is running, if any.
///
/// Observable instruments use it to send observations made by a callback
/// only to the pipeline that ran it.
pub(crate) fn callback_pipeline() -> Option<PipelineId> {
    CALLBACK_PIPELINE.with(Cell::get)
}

/// Marks the current thread as running the callbacks of one pipeline until
/// dropped, restoring the previous mark.
struct CallbackScope {
    previous: Option<PipelineId>,
}

impl CallbackScope {
    fn enter(pipeline: PipelineId) -> Self {
        CallbackScope {
            previous: CALLBACK_PIPELINE.with(|current| current.replace(Some(pipeline))),
        }
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        CALLBACK_PIPELINE.with(|current| current.set(self.previous));
    }
}

/// Single or multi-instrument callbacks
pub(crate) type GenericCallback =
    Arc<dyn Fn(&CollectContext) -> MetricResult<()> + Send + Sync>;

/// Aggregators grouped by scope, scopes in the order they first registered.
#[derive(Default)]
struct PipelineInner {
    scope_index: HashMap<InstrumentationScope, usize>,
    aggregations: Vec<(InstrumentationScope, Vec<Arc<InstrumentSync>>)>,
}

impl Pipeline {
    pub(crate) fn new(
        resource: Resource,
        reader: Box<dyn MetricReader>,
        views: Vec<Arc<dyn View>>,
    ) -> Self {
        Pipeline {
            id: NEXT_PIPELINE_ID.fetch_add(1, Ordering::Relaxed),
            resource,
            reader,
            views,
            inner: Mutex::new(PipelineInner::default()),
            callbacks: Mutex::new(BTreeMap::new()),
            next_callback_id: AtomicU64::new(0),
        }
    }

    /// Adds the [InstrumentSync] to pipeline with scope.
    ///
    /// This method is not idempotent. Duplicate calls will result in duplicate
    /// additions, it is the callers responsibility to ensure this is called with
    /// unique values.
    fn add_sync(&self, scope: InstrumentationScope, i_sync: InstrumentSync) {
        let _ = self.inner.lock().map(|mut guard| {
            otel_debug!(
                name: "InstrumentCreated",
                instrument_name = i_sync.name.as_ref(),
            );
            let inner = &mut *guard;
            let idx = match inner.scope_index.get(&scope) {
                Some(idx) => *idx,
                None => {
                    let idx = inner.aggregations.len();
                    inner.scope_index.insert(scope.clone(), idx);
                    inner.aggregations.push((scope, Vec::new()));
                    idx
                }
            };
            inner.aggregations[idx].1.push(Arc::new(i_sync));
        });
    }

    /// Registers a callback to be run when `produce` is called. Returns the id
    /// to remove it with.
    fn add_callback(&self, callback: GenericCallback) -> u64 {
        let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .callbacks
            .lock()
            .map(|mut callbacks| callbacks.insert(id, callback));
        id
    }

    fn remove_callback(&self, id: u64) -> MetricResult<()> {
        self.callbacks.lock()?.remove(&id);
        Ok(())
    }

    /// Send accumulated telemetry
    fn force_flush(&self) -> MetricResult<()> {
        self.reader.force_flush()
    }

    /// Shut down pipeline
    fn shutdown(&self) -> MetricResult<()> {
        self.reader.shutdown()
    }

    /// Runs the callbacks registered when the cycle started, in registration
    /// order. Stops at the first sign of cancellation.
    fn run_callbacks(&self, ctx: &CollectContext) -> MetricResult<()> {
        // Snapshot so callbacks may register or unregister without deadlocking
        // and without changing this cycle's list.
        let callbacks: Vec<GenericCallback> = self.callbacks.lock()?.values().cloned().collect();
        otel_debug!(
            name: "MeterProvider.InvokingObservableCallbacks",
            count = callbacks.len(),
        );

        let _scope = CallbackScope::enter(self.id);
        for cb in &callbacks {
            ctx.check()?;
            if let Err(err) = cb(ctx) {
                otel_warn!(
                    name: "Pipeline.CallbackFailed",
                    error = format!("{err}"),
                );
            }
        }

        ctx.check()
    }
}

impl SdkProducer for Pipeline {
    /// Returns aggregated metrics from a single collection.
    fn produce(&self, ctx: &CollectContext, rm: &mut ResourceMetrics) -> MetricResult<()> {
        rm.resource = self.resource.clone();
        rm.scope_metrics.clear();

        if let Err(err) = self.run_callbacks(ctx) {
            otel_warn!(
                name: "Pipeline.CollectCancelled",
                reason = format!("{err}"),
            );
            return Err(err);
        }

        let aggregations: Vec<(InstrumentationScope, Vec<Arc<InstrumentSync>>)> =
            self.inner.lock()?.aggregations.clone();

        for (scope, instruments) in aggregations {
            let metrics: Vec<Metric> = instruments
                .iter()
                .filter_map(|inst| {
                    let data = inst.comp_agg.call();
                    (!data.is_empty()).then(|| Metric {
                        name: inst.name.clone(),
                        description: inst.description.clone(),
                        unit: inst.unit.clone(),
                        data,
                    })
                })
                .collect();

            if !metrics.is_empty() {
                rm.scope_metrics.push(ScopeMetrics { scope, metrics });
            }
        }

        Ok(())
    }
}

/// A synchronization point between a [Pipeline] and an instrument's aggregate function.
struct InstrumentSync {
    name: Cow<'static, str>,
    description: Cow<'static, str>,
    unit: Cow<'static, str>,
    comp_agg: Arc<dyn internal::ComputeAggregation>,
}

impl fmt::Debug for InstrumentSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentSync")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("unit", &self.unit)
            .finish()
    }
}

type Cache<T> = Mutex<HashMap<InstrumentId, Option<Arc<dyn internal::Measure<T>>>>>;

/// The stream ids a meter has created, keyed by lowercase name.
///
/// Shared by the inserters of every number type and every pipeline of one
/// meter, so a conflict is reported once however many readers see it.
#[derive(Default)]
pub(crate) struct ConflictIndex {
    first_seen: HashMap<Cow<'static, str>, InstrumentId>,
    reported: HashSet<InstrumentId>,
}

impl ConflictIndex {
    /// Records `id` and returns the earlier id it conflicts with, the first
    /// time that conflict is seen.
    fn record(&mut self, id: &InstrumentId) -> Option<InstrumentId> {
        match self.first_seen.get(&id.name) {
            None => {
                self.first_seen.insert(id.name.clone(), id.clone());
                None
            }
            Some(existing) if existing == id => None,
            Some(existing) => self.reported.insert(id.clone()).then(|| existing.clone()),
        }
    }
}

pub(crate) type SharedConflictIndex = Arc<Mutex<ConflictIndex>>;

/// A [Stream] with every field resolved against the instrument it was
/// matched for.
struct ResolvedStream {
    name: Cow<'static, str>,
    description: Cow<'static, str>,
    unit: Cow<'static, str>,
    aggregation: Aggregation,
    allowed_attribute_keys: AttributeSetFilter,
    cardinality_limit: Option<usize>,
}

impl ResolvedStream {
    fn new(inst: &Instrument, kind: InstrumentKind, stream: Stream) -> Self {
        let aggregation = match stream.aggregation {
            None | Some(Aggregation::Default) => default_aggregation_selector(kind),
            Some(agg) => agg,
        };
        ResolvedStream {
            name: stream.name.unwrap_or_else(|| inst.name.clone()),
            description: stream
                .description
                .unwrap_or_else(|| inst.description.clone()),
            unit: stream.unit.unwrap_or_else(|| inst.unit.clone()),
            aggregation,
            allowed_attribute_keys: AttributeSetFilter::new(stream.allowed_attribute_keys),
            cardinality_limit: stream.cardinality_limit,
        }
    }
}

/// Facilitates inserting of new instruments from a single scope into a pipeline.
struct Inserter<T> {
    /// A cache that holds aggregate function inputs whose
    /// outputs have been inserted into the underlying reader pipeline.
    ///
    /// This cache ensures no duplicate aggregate functions are inserted into
    /// the reader pipeline and if a new request during an instrument creation
    /// asks for the same aggregate function input the same instance is
    /// returned.
    aggregators: Cache<T>,

    /// Stream ids of every instrument the owning meter has created.
    conflicts: SharedConflictIndex,

    pipeline: Arc<Pipeline>,
}

impl<T> Inserter<T>
where
    T: Number,
{
    fn new(pipeline: Arc<Pipeline>, conflicts: SharedConflictIndex) -> Self {
        Inserter {
            aggregators: Default::default(),
            conflicts,
            pipeline,
        }
    }

    /// Inserts the provided instrument into a pipeline.
    ///
    /// Every view the pipeline contains is matched against, and each matching
    /// view that resolves to a distinct stream id adds one aggregator. When no
    /// view matches, the instrument is reported as-is with its default
    /// aggregation, using `boundaries` for histograms if given.
    ///
    /// Streams that resolve to [Aggregation::Drop] are neither inserted nor
    /// returned. An incompatible aggregation is an error for that stream only;
    /// the other streams are still inserted.
    fn instrument(
        &self,
        inst: Instrument,
        boundaries: Option<&[f64]>,
    ) -> (Vec<Arc<dyn internal::Measure<T>>>, Vec<MetricError>) {
        let kind = match inst.kind {
            Some(kind) => kind,
            None => {
                return (
                    Vec::new(),
                    vec![MetricError::Other("instrument must have a kind".into())],
                )
            }
        };

        let mut streams: Vec<ResolvedStream> = self
            .pipeline
            .views
            .iter()
            .filter_map(|v| v.match_inst(&inst))
            .map(|stream| ResolvedStream::new(&inst, kind, stream))
            .collect();

        // Apply implicit default view if no explicit matched.
        if streams.is_empty() {
            let mut stream = ResolvedStream::new(&inst, kind, Stream::default());
            if let (Some(boundaries), Aggregation::ExplicitBucketHistogram { .. }) =
                (boundaries, &stream.aggregation)
            {
                stream.aggregation = Aggregation::ExplicitBucketHistogram {
                    boundaries: boundaries.to_vec(),
                    record_min_max: true,
                };
            }
            streams.push(stream);
        }

        // The cache returns the same aggregator for the same id. Use ids to
        // keep one measure per stream.
        let mut seen = HashSet::new();
        let mut measures = vec![];
        let mut errs = vec![];
        for stream in streams {
            let id = self.inst_id(kind, &stream);
            if !seen.insert(id.clone()) {
                continue;
            }

            match self.cached_aggregator(&inst.scope, kind, id, stream) {
                Ok(Some(measure)) => measures.push(measure),
                Ok(None) => {} // Drop aggregator.
                Err(err) => errs.push(err),
            }
        }

        (measures, errs)
    }

    /// Returns the appropriate aggregate functions for a resolved stream.
    ///
    /// If a stream with the same id has already been created for this
    /// pipeline, that aggregate function instance is returned. Otherwise a new
    /// one is bound into the pipeline, cached and returned.
    ///
    /// A stream whose name is already taken by a stream with a different id
    /// still gets its own aggregate function; the conflict is logged once.
    fn cached_aggregator(
        &self,
        scope: &InstrumentationScope,
        kind: InstrumentKind,
        id: InstrumentId,
        stream: ResolvedStream,
    ) -> MetricResult<Option<Arc<dyn internal::Measure<T>>>> {
        if let Err(err) = is_aggregator_compatible(&kind, &stream.aggregation) {
            return Err(MetricError::Other(format!(
                "creating aggregator with instrumentKind: {:?}, aggregation {}: {}",
                kind, stream.aggregation, err,
            )));
        }

        self.log_conflict(&id, &stream);

        let mut cache = self.aggregators.lock()?;
        if let Some(cached) = cache.get(&id) {
            return Ok(cached.clone());
        }

        let b = AggregateBuilder::new(
            self.pipeline.reader.temporality(kind),
            stream.allowed_attribute_keys.clone(),
            stream.cardinality_limit,
        );
        let measure = aggregate_fn(b, &stream.aggregation, kind)?.map(
            |AggregateFns { measure, collect }| {
                self.pipeline.add_sync(
                    scope.clone(),
                    InstrumentSync {
                        name: stream.name,
                        description: stream.description,
                        unit: stream.unit,
                        comp_agg: collect,
                    },
                );
                measure
            },
        );

        cache.insert(id, measure.clone());
        Ok(measure)
    }

    /// Validates if an instrument with the same name as id has already been created.
    ///
    /// If that instrument conflicts with id, a warning is logged.
    fn log_conflict(&self, id: &InstrumentId, stream: &ResolvedStream) {
        let existing = match self.conflicts.lock() {
            Ok(mut conflicts) => conflicts.record(id),
            Err(_) => None,
        };
        if let Some(existing) = existing {
            otel_warn!(
                name: "Instrument.DuplicateMetricStreamDefinitions",
                message = "duplicate metric stream definitions",
                reason = format!(
                    "names: ({} and {}), kinds: ({:?} and {:?}), units: ({:?} and {:?}), numbers: ({} and {}), aggregations: ({} and {}), description: {:?}",
                    existing.name, stream.name,
                    existing.kind, id.kind,
                    existing.unit, id.unit,
                    existing.number, id.number,
                    existing.aggregation, id.aggregation,
                    stream.description,
                ),
            );
        }
    }

    fn inst_id(&self, kind: InstrumentKind, stream: &ResolvedStream) -> InstrumentId {
        let mut id = InstrumentId {
            name: stream.name.clone(),
            kind,
            unit: stream.unit.clone(),
            number: Cow::Borrowed(std::any::type_name::<T>()),
            aggregation: Cow::Owned(stream.aggregation.to_string()),
            monotonic: is_monotonic(kind, &stream.aggregation),
        };
        // Requests for the same instrument with different name casing share
        // the first-seen aggregator.
        id.normalize();
        id
    }
}

/// Whether a sum over this instrument can only grow.
fn is_monotonic(kind: InstrumentKind, agg: &Aggregation) -> bool {
    matches!(agg, Aggregation::Sum)
        && matches!(
            kind,
            InstrumentKind::Counter | InstrumentKind::ObservableCounter | InstrumentKind::Histogram
        )
}

/// The default aggregation and parameters for an instrument of [InstrumentKind].
///
/// * Counter ⇨ Sum
/// * Observable Counter ⇨ Sum
/// * UpDownCounter ⇨ Sum
/// * Observable UpDownCounter ⇨ Sum
/// * Gauge ⇨ LastValue
/// * Observable Gauge ⇨ LastValue
/// * Histogram ⇨ ExplicitBucketHistogram
fn default_aggregation_selector(kind: InstrumentKind) -> Aggregation {
    match kind {
        InstrumentKind::Counter
        | InstrumentKind::UpDownCounter
        | InstrumentKind::ObservableCounter
        | InstrumentKind::ObservableUpDownCounter => Aggregation::Sum,
        InstrumentKind::Gauge | InstrumentKind::ObservableGauge => Aggregation::LastValue,
        InstrumentKind::Histogram => Aggregation::ExplicitBucketHistogram {
            boundaries: DEFAULT_HISTOGRAM_BOUNDARIES.to_vec(),
            record_min_max: true,
        },
    }
}

/// Returns new aggregate functions for the given params.
///
/// If the aggregation is unknown or temporality is invalid, an error is returned.
fn aggregate_fn<T: Number>(
    b: AggregateBuilder<T>,
    agg: &Aggregation,
    kind: InstrumentKind,
) -> MetricResult<Option<AggregateFns<T>>> {
    match agg {
        Aggregation::Default => aggregate_fn(b, &default_aggregation_selector(kind), kind),
        Aggregation::Drop => Ok(None),
        Aggregation::LastValue => match kind {
            InstrumentKind::Gauge => Ok(Some(b.last_value(false))),
            InstrumentKind::ObservableGauge => Ok(Some(b.last_value(true))),
            _ => Err(MetricError::Other(format!(
                "LastValue aggregation is only available for Gauge or ObservableGauge, but not for {kind:?}"
            ))),
        },
        Aggregation::Sum => {
            let fns = match kind {
                InstrumentKind::ObservableCounter => b.precomputed_sum(true),
                InstrumentKind::ObservableUpDownCounter => b.precomputed_sum(false),
                InstrumentKind::Counter | InstrumentKind::Histogram => b.sum(true),
                _ => b.sum(false),
            };
            Ok(Some(fns))
        }
        Aggregation::ExplicitBucketHistogram {
            boundaries,
            record_min_max,
        } => {
            let record_sum = !matches!(
                kind,
                InstrumentKind::UpDownCounter
                    | InstrumentKind::ObservableUpDownCounter
                    | InstrumentKind::ObservableGauge
            );
            Ok(Some(b.explicit_bucket_histogram(
                boundaries.to_vec(),
                *record_min_max,
                record_sum,
            )))
        }
    }
}

/// Checks if the aggregation can be used by the instrument.
///
/// Current compatibility:
///
/// | Instrument Kind          | Drop | LastValue | Sum | Histogram |
/// |--------------------------|------|-----------|-----|-----------|
/// | Counter                  | ✓    |           | ✓   | ✓         |
/// | UpDownCounter            | ✓    |           | ✓   | ✓         |
/// | Histogram                | ✓    |           | ✓   | ✓         |
/// | Observable Counter       | ✓    |           | ✓   | ✓         |
/// | Observable UpDownCounter | ✓    |           | ✓   | ✓         |
/// | Gauge                    | ✓    | ✓         |     | ✓         |
/// | Observable Gauge         | ✓    | ✓         |     | ✓         |
fn is_aggregator_compatible(kind: &InstrumentKind, agg: &Aggregation) -> MetricResult<()> {
    match agg {
        Aggregation::Default | Aggregation::Drop | Aggregation::ExplicitBucketHistogram { .. } => {
            Ok(())
        }
        Aggregation::Sum => match kind {
            InstrumentKind::ObservableCounter
            | InstrumentKind::ObservableUpDownCounter
            | InstrumentKind::Counter
            | InstrumentKind::Histogram
            | InstrumentKind::UpDownCounter => Ok(()),
            _ => Err(MetricError::Other("incompatible aggregation".into())),
        },
        Aggregation::LastValue => match kind {
            InstrumentKind::Gauge | InstrumentKind::ObservableGauge => Ok(()),
            _ => Err(MetricError::Other("incompatible aggregation".into())),
        },
    }
}

/// The group of pipelines connecting Readers with instrument measurement.
#[derive(Debug)]
pub(crate) struct Pipelines {
    pub(crate) pipes: Vec<Arc<Pipeline>>,
    is_shutdown: AtomicBool,
}

impl Pipelines {
    pub(crate) fn new(
        res: Resource,
        readers: Vec<Box<dyn MetricReader>>,
        views: Vec<Arc<dyn View>>,
    ) -> Self {
        let mut pipes = Vec::with_capacity(readers.len());
        for r in readers {
            let p = Arc::new(Pipeline::new(res.clone(), r, views.clone()));
            p.reader.register_pipeline(Arc::downgrade(&p));
            pipes.push(p);
        }

        Pipelines {
            pipes,
            is_shutdown: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::Acquire)
    }

    /// Registers `callback` with every pipeline.
    pub(crate) fn register_callback<F>(&self, callback: F) -> Registration
    where
        F: Fn(&CollectContext) -> MetricResult<()> + Send + Sync + 'static,
    {
        let cb: GenericCallback = Arc::new(callback);
        let entries = self
            .pipes
            .iter()
            .map(|pipe| (Arc::downgrade(pipe), pipe.add_callback(Arc::clone(&cb))))
            .collect();
        Registration::new(entries)
    }

    /// Force flush all pipelines
    pub(crate) fn force_flush(&self) -> MetricResult<()> {
        let errs: Vec<MetricError> = self
            .pipes
            .iter()
            .filter_map(|pipeline| pipeline.force_flush().err())
            .collect();

        if errs.is_empty() {
            Ok(())
        } else {
            Err(MetricError::Other(format!("{errs:?}")))
        }
    }

    /// Shut down all pipelines. Only the first call does any work.
    pub(crate) fn shutdown(&self) -> MetricResult<()> {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            return Err(MetricError::AlreadyShutdown);
        }

        let errs: Vec<MetricError> = self
            .pipes
            .iter()
            .filter_map(|pipeline| pipeline.shutdown().err())
            .collect();

        if errs.is_empty() {
            Ok(())
        } else {
            Err(MetricError::Other(format!("{errs:?}")))
        }
    }
}

/// resolver facilitates resolving aggregate functions an instrument calls to
/// aggregate measurements with while updating all pipelines that need to pull from
/// those aggregations.
pub(crate) struct Resolver<T> {
    inserters: Vec<Inserter<T>>,
}

impl<T> Resolver<T>
where
    T: Number,
{
    pub(crate) fn new(pipelines: &Pipelines, conflicts: SharedConflictIndex) -> Self {
        let inserters = pipelines
            .pipes
            .iter()
            .map(|pipe| Inserter::new(Arc::clone(pipe), Arc::clone(&conflicts)))
            .collect();

        Resolver { inserters }
    }

    /// The measures that must be updated by the instrument defined by key,
    /// one group per pipeline.
    ///
    /// Streams that fail to resolve are reported in the returned error; the
    /// measures of every other stream are still returned.
    pub(crate) fn measures(
        &self,
        inst: Instrument,
        boundaries: Option<Vec<f64>>,
    ) -> (Vec<PipelineMeasures<T>>, Option<MetricError>) {
        let mut groups = Vec::with_capacity(self.inserters.len());
        let mut errs = vec![];

        for inserter in &self.inserters {
            let (measures, stream_errs) = inserter.instrument(inst.clone(), boundaries.as_deref());
            errs.extend(stream_errs);
            groups.push(PipelineMeasures {
                pipeline: inserter.pipeline.id,
                measures,
            });
        }

        let err = (!errs.is_empty()).then(|| MetricError::Other(format!("{errs:?}")));
        (groups, err)
    }
}

/// The measures one pipeline resolved for an instrument.
pub(crate) struct PipelineMeasures<T> {
    pub(crate) pipeline: PipelineId,
    pub(crate) measures: Vec<Arc<dyn internal::Measure<T>>>,
}

/// The handle returned when a callback is registered.
///
/// Unregistering stops the callback from being run on any collection that
/// starts afterwards. A run that already started is allowed to finish.
pub struct Registration {
    entries: Mutex<Vec<(Weak<Pipeline>, u64)>>,
}

impl Registration {
    fn new(entries: Vec<(Weak<Pipeline>, u64)>) -> Self {
        Registration {
            entries: Mutex::new(entries),
        }
    }

    /// A registration that is not bound to any pipeline.
    pub(crate) fn noop() -> Self {
        Registration::new(Vec::new())
    }

    /// Removes the callback from every pipeline it was registered with.
    ///
    /// Calling this more than once, or from several threads at once, has the
    /// same effect as calling it once.
    pub fn unregister(&self) -> MetricResult<()> {
        let entries: Vec<(Weak<Pipeline>, u64)> = self.entries.lock()?.drain(..).collect();
        for (pipe, id) in entries {
            if let Some(pipe) = pipe.upgrade() {
                pipe.remove_callback(id)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered = self.entries.lock().map(|e| e.len()).unwrap_or_default();
        f.debug_struct("Registration")
            .field("pipelines", &registered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use opentelemetry::KeyValue;

    use super::*;
    use crate::metrics::{
        data::{AggregatedMetrics, MetricData, Temporality},
        new_view, ManualReader,
    };

    fn test_pipeline(views: Vec<Arc<dyn View>>) -> Arc<Pipeline> {
        Arc::new(Pipeline::new(
            Resource::empty(),
            Box::new(ManualReader::builder().build()),
            views,
        ))
    }

    fn sum_sync(name: &'static str) -> (Arc<dyn internal::Measure<i64>>, InstrumentSync) {
        let AggregateFns { measure, collect } = AggregateBuilder::<i64>::new(
            Temporality::Cumulative,
            AttributeSetFilter::default(),
            None,
        )
        .sum(false);
        let sync = InstrumentSync {
            name: name.into(),
            description: "".into(),
            unit: "".into(),
            comp_agg: collect,
        };
        (measure, sync)
    }

    fn resolve<T: Number>(
        resolver: &Resolver<T>,
        inst: Instrument,
    ) -> Vec<Arc<dyn internal::Measure<T>>> {
        let (groups, err) = resolver.measures(inst, None);
        assert!(err.is_none(), "{err:?}");
        groups.into_iter().flat_map(|g| g.measures).collect()
    }

    fn produce(pipe: &Pipeline) -> MetricResult<ResourceMetrics> {
        let mut rm = ResourceMetrics::default();
        pipe.produce(&CollectContext::new(), &mut rm)?;
        Ok(rm)
    }

    #[test]
    fn empty_pipeline() {
        let pipe = test_pipeline(vec![]);

        let rm = produce(&pipe).unwrap();
        assert!(rm.scope_metrics.is_empty());

        let (measure, sync) = sum_sync("foo");
        measure.call(1, &[]);
        pipe.add_sync(InstrumentationScope::builder("test").build(), sync);
        pipe.add_callback(Arc::new(|_: &CollectContext| Ok(())));

        let rm = produce(&pipe).unwrap();
        assert_eq!(rm.scope_metrics.len(), 1);
        assert_eq!(rm.scope_metrics[0].scope.name(), "test");
        assert_eq!(rm.scope_metrics[0].metrics.len(), 1);
    }

    #[test]
    fn pipeline_uses_resource() {
        let res = Resource::builder_empty()
            .with_attributes(vec![KeyValue::new("service.name", "x")])
            .build();
        let pipe = Pipeline::new(res.clone(), Box::new(ManualReader::builder().build()), vec![]);

        let mut rm = ResourceMetrics::default();
        pipe.produce(&CollectContext::new(), &mut rm).unwrap();
        assert_eq!(rm.resource, res);
    }

    #[test]
    fn aggregators_without_data_are_omitted() {
        let pipe = test_pipeline(vec![]);
        let (_measure, sync) = sum_sync("idle");
        pipe.add_sync(InstrumentationScope::builder("test").build(), sync);

        assert!(produce(&pipe).unwrap().scope_metrics.is_empty());
    }

    #[test]
    fn scopes_keep_registration_order() {
        let pipe = test_pipeline(vec![]);
        for scope in ["c", "a", "b"] {
            let (measure, sync) = sum_sync("foo");
            measure.call(1, &[]);
            pipe.add_sync(InstrumentationScope::builder(scope).build(), sync);
        }

        let rm = produce(&pipe).unwrap();
        let scopes: Vec<&str> = rm.scope_metrics.iter().map(|sm| sm.scope.name()).collect();
        assert_eq!(scopes, vec!["c", "a", "b"]);
    }

    #[test]
    fn pipeline_concurrency() {
        let pipe = test_pipeline(vec![]);
        let scope = InstrumentationScope::builder("test").build();

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let mut rm = ResourceMetrics::default();
                    let _ = pipe.produce(&CollectContext::new(), &mut rm);
                });
                s.spawn(|| {
                    let (measure, sync) = sum_sync("foo");
                    measure.call(1, &[]);
                    pipe.add_sync(scope.clone(), sync);
                });
                s.spawn(|| {
                    pipe.add_callback(Arc::new(|_: &CollectContext| Ok(())));
                });
            }
        });

        let rm = produce(&pipe).unwrap();
        assert_eq!(rm.scope_metrics.len(), 1);
        assert_eq!(rm.scope_metrics[0].metrics.len(), 8);
    }

    #[test]
    fn callbacks_registered_during_a_cycle_run_next_cycle() {
        let pipe = test_pipeline(vec![]);
        let runs = Arc::new(AtomicUsize::new(0));

        let inner_pipe = Arc::clone(&pipe);
        let inner_runs = Arc::clone(&runs);
        pipe.add_callback(Arc::new(move |_: &CollectContext| {
            let runs = Arc::clone(&inner_runs);
            inner_pipe.add_callback(Arc::new(move |_: &CollectContext| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
            Ok(())
        }));

        produce(&pipe).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        produce(&pipe).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_callback_does_not_fail_collection() {
        let pipe = test_pipeline(vec![]);
        let runs = Arc::new(AtomicUsize::new(0));
        pipe.add_callback(Arc::new(|_: &CollectContext| {
            Err(MetricError::Other("boom".into()))
        }));
        let counted = Arc::clone(&runs);
        pipe.add_callback(Arc::new(move |_: &CollectContext| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        assert!(produce(&pipe).is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_collection_skips_callbacks_and_keeps_delta_state() {
        let pipe = test_pipeline(vec![]);
        let AggregateFns { measure, collect } = AggregateBuilder::<u64>::new(
            Temporality::Delta,
            AttributeSetFilter::default(),
            None,
        )
        .sum(true);
        measure.call(5, &[]);
        pipe.add_sync(
            InstrumentationScope::builder("test").build(),
            InstrumentSync {
                name: "foo".into(),
                description: "".into(),
                unit: "".into(),
                comp_agg: collect,
            },
        );

        let runs = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&runs);
        pipe.add_callback(Arc::new(move |ctx: &CollectContext| {
            counted.fetch_add(1, Ordering::SeqCst);
            ctx.cancel();
            Ok(())
        }));
        let counted = Arc::clone(&runs);
        pipe.add_callback(Arc::new(move |_: &CollectContext| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let mut rm = ResourceMetrics::default();
        let err = pipe.produce(&CollectContext::new(), &mut rm).unwrap_err();
        assert!(matches!(err, MetricError::Cancelled));
        assert!(rm.scope_metrics.is_empty());
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // The cancelled cycle did not drain the delta aggregator; the next
        // cycle's first callback cancels again, so read it directly.
        let data = {
            let inner = pipe.inner.lock().unwrap();
            inner.aggregations[0].1[0].comp_agg.call()
        };
        let AggregatedMetrics::U64(MetricData::Sum(sum)) = data else {
            panic!("expected u64 sum");
        };
        assert_eq!(sum.data_points[0].value, 5);
    }

    #[test]
    fn expired_deadline_is_reported() {
        let pipe = test_pipeline(vec![]);
        let ctx = CollectContext::new().with_deadline(std::time::Instant::now());

        let mut rm = ResourceMetrics::default();
        let err = pipe.produce(&ctx, &mut rm).unwrap_err();
        assert!(matches!(err, MetricError::DeadlineExceeded));
    }

    #[test]
    fn unregister_is_idempotent() {
        let pipes = Pipelines::new(
            Resource::empty(),
            vec![Box::new(ManualReader::builder().build())],
            vec![],
        );
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&runs);
        let reg = pipes.register_callback(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        produce(&pipes.pipes[0]).unwrap();
        reg.unregister().unwrap();
        reg.unregister().unwrap();
        produce(&pipes.pipes[0]).unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(Registration::noop().unregister().is_ok());
    }

    #[test]
    fn second_shutdown_is_rejected() {
        let pipes = Pipelines::new(
            Resource::empty(),
            vec![Box::new(ManualReader::builder().build())],
            vec![],
        );
        assert!(pipes.shutdown().is_ok());
        assert!(pipes.is_shutdown());
        assert!(matches!(pipes.shutdown(), Err(MetricError::AlreadyShutdown)));
    }

    fn default_view_helper<T: Number>() {
        let criteria = Instrument::new().name("foo");
        let mask = Stream::builder().with_name("bar").build().unwrap();
        let no_match: Arc<dyn View> = Arc::new(new_view(criteria, mask).unwrap());

        for views in [vec![], vec![no_match]] {
            let pipes = Pipelines::new(
                Resource::empty(),
                vec![Box::new(ManualReader::builder().build())],
                views,
            );
            let resolver = Resolver::<T>::new(&pipes, Default::default());
            let inst = Instrument::new()
                .name("requests")
                .kind(InstrumentKind::Counter)
                .scope(InstrumentationScope::builder("test").build());

            let measures = resolve(&resolver, inst);
            assert_eq!(measures.len(), 1);

            let inner = pipes.pipes[0].inner.lock().unwrap();
            assert_eq!(inner.aggregations.len(), 1);
            assert_eq!(inner.aggregations[0].1[0].name, "requests");
        }
    }

    #[test]
    fn default_view_is_implicit() {
        default_view_helper::<u64>();
        default_view_helper::<i64>();
        default_view_helper::<f64>();
    }

    #[test]
    fn matching_views_fan_out_and_dedupe() {
        let rename = |name: &'static str| -> Arc<dyn View> {
            let mask = Stream::builder().with_name(name).build().unwrap();
            Arc::new(new_view(Instrument::new().name("requests"), mask).unwrap())
        };
        let pipes = Pipelines::new(
            Resource::empty(),
            vec![Box::new(ManualReader::builder().build())],
            vec![rename("a"), rename("b"), rename("A")],
        );
        let resolver = Resolver::<u64>::new(&pipes, Default::default());
        let inst = Instrument::new()
            .name("requests")
            .kind(InstrumentKind::Counter)
            .scope(InstrumentationScope::builder("test").build());

        let measures = resolve(&resolver, inst);
        assert_eq!(measures.len(), 2);
    }

    #[test]
    fn conflicting_streams_get_separate_aggregators() {
        let pipes = Pipelines::new(
            Resource::empty(),
            vec![Box::new(ManualReader::builder().build())],
            vec![],
        );
        let conflicts = SharedConflictIndex::default();
        let resolver = Resolver::<u64>::new(&pipes, Arc::clone(&conflicts));
        let inst = |unit: &'static str| {
            Instrument::new()
                .name("requests")
                .kind(InstrumentKind::Counter)
                .unit(unit)
                .scope(InstrumentationScope::builder("test").build())
        };

        let ms = resolve(&resolver, inst("ms"));
        let s = resolve(&resolver, inst("s"));
        let again = resolve(&resolver, inst("s"));

        assert!(!Arc::ptr_eq(&ms[0], &s[0]));
        assert!(Arc::ptr_eq(&s[0], &again[0]));
        assert_eq!(conflicts.lock().unwrap().reported.len(), 1);
        assert_eq!(pipes.pipes[0].inner.lock().unwrap().aggregations[0].1.len(), 2);
    }

    #[test]
    fn incompatible_aggregation_is_an_error() {
        let mask = Stream::builder()
            .with_aggregation(Aggregation::LastValue)
            .build()
            .unwrap();
        let view: Arc<dyn View> = Arc::new(new_view(Instrument::new().name("*"), mask).unwrap());
        let pipes = Pipelines::new(
            Resource::empty(),
            vec![Box::new(ManualReader::builder().build())],
            vec![view],
        );
        let resolver = Resolver::<u64>::new(&pipes, Default::default());
        let inst = Instrument::new()
            .name("requests")
            .kind(InstrumentKind::Counter);

        let (groups, err) = resolver.measures(inst, None);
        assert!(err.is_some());
        assert_eq!(groups.len(), 1);
        assert!(groups[0].measures.is_empty());
    }

    #[test]
    fn incompatible_stream_keeps_the_valid_ones() {
        let renamed = Stream::builder().with_name("requests_renamed").build().unwrap();
        let last_value = Stream::builder()
            .with_aggregation(Aggregation::LastValue)
            .build()
            .unwrap();
        let views: Vec<Arc<dyn View>> = vec![
            Arc::new(new_view(Instrument::new().name("requests"), renamed).unwrap()),
            Arc::new(new_view(Instrument::new().name("requests"), last_value).unwrap()),
        ];
        let pipes = Pipelines::new(
            Resource::empty(),
            vec![Box::new(ManualReader::builder().build())],
            views,
        );
        let resolver = Resolver::<u64>::new(&pipes, Default::default());
        let inst = Instrument::new()
            .name("requests")
            .kind(InstrumentKind::Counter)
            .scope(InstrumentationScope::builder("test").build());

        let (groups, err) = resolver.measures(inst, None);
        assert!(err.is_some());
        assert_eq!(groups[0].measures.len(), 1);

        groups[0].measures[0].call(5, &[]);
        let rm = produce(&pipes.pipes[0]).unwrap();
        let metric = &rm.scope_metrics[0].metrics[0];
        assert_eq!(metric.name, "requests_renamed");
        let AggregatedMetrics::U64(MetricData::Sum(sum)) = &metric.data else {
            panic!("expected u64 sum");
        };
        assert_eq!(sum.data_points[0].value, 5);
    }

    #[test]
    fn measures_are_grouped_per_pipeline() {
        let pipes = Pipelines::new(
            Resource::empty(),
            vec![
                Box::new(ManualReader::builder().build()),
                Box::new(ManualReader::builder().build()),
            ],
            vec![],
        );
        let resolver = Resolver::<u64>::new(&pipes, Default::default());
        let inst = Instrument::new()
            .name("requests")
            .kind(InstrumentKind::Counter);

        let (groups, err) = resolver.measures(inst, None);
        assert!(err.is_none());
        let ids: Vec<PipelineId> = groups.iter().map(|g| g.pipeline).collect();
        assert_eq!(ids, vec![pipes.pipes[0].id, pipes.pipes[1].id]);
        assert_ne!(ids[0], ids[1]);
        assert!(groups.iter().all(|g| g.measures.len() == 1));
    }

    #[test]
    fn callbacks_run_marked_with_their_pipeline() {
        let pipes = Pipelines::new(
            Resource::empty(),
            vec![
                Box::new(ManualReader::builder().build()),
                Box::new(ManualReader::builder().build()),
            ],
            vec![],
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&seen);
        let _reg = pipes.register_callback(move |_| {
            recorded.lock().unwrap().push(callback_pipeline());
            Ok(())
        });

        assert_eq!(callback_pipeline(), None);
        produce(&pipes.pipes[1]).unwrap();
        produce(&pipes.pipes[0]).unwrap();
        assert_eq!(callback_pipeline(), None);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Some(pipes.pipes[1].id), Some(pipes.pipes[0].id)]
        );
    }

    #[test]
    fn drop_aggregation_returns_no_measure() {
        let mask = Stream::builder()
            .with_aggregation(Aggregation::Drop)
            .build()
            .unwrap();
        let view: Arc<dyn View> = Arc::new(new_view(Instrument::new().name("*"), mask).unwrap());
        let pipes = Pipelines::new(
            Resource::empty(),
            vec![Box::new(ManualReader::builder().build())],
            vec![view],
        );
        let resolver = Resolver::<f64>::new(&pipes, Default::default());
        let inst = Instrument::new()
            .name("latency")
            .kind(InstrumentKind::Histogram);

        assert!(resolve(&resolver, inst).is_empty());
        assert!(pipes.pipes[0].inner.lock().unwrap().aggregations.is_empty());
    }

    #[test]
    fn aggregator_compatibility() {
        use InstrumentKind::*;

        for kind in [Counter, UpDownCounter, Histogram, ObservableCounter, ObservableUpDownCounter] {
            assert!(is_aggregator_compatible(&kind, &Aggregation::Sum).is_ok());
            assert!(is_aggregator_compatible(&kind, &Aggregation::LastValue).is_err());
        }
        for kind in [Gauge, ObservableGauge] {
            assert!(is_aggregator_compatible(&kind, &Aggregation::Sum).is_err());
            assert!(is_aggregator_compatible(&kind, &Aggregation::LastValue).is_ok());
        }
        let histogram = default_aggregation_selector(Histogram);
        for kind in [Counter, UpDownCounter, Histogram, ObservableCounter, ObservableUpDownCounter, Gauge, ObservableGauge] {
            assert!(is_aggregator_compatible(&kind, &histogram).is_ok());
            assert!(is_aggregator_compatible(&kind, &Aggregation::Drop).is_ok());
        }
    }
}
