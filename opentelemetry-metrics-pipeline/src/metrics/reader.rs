//! The boundary between a pipeline and whatever exports its output.
use std::{fmt, sync::Weak};

use crate::{error::MetricResult, CollectContext};

use super::{data::ResourceMetrics, pipeline::Pipeline, InstrumentKind, Temporality};

/// Decides when a pipeline is collected and what happens to the result.
///
/// The provider builds one [Pipeline] per reader and hands it over through
/// `register_pipeline`; from then on the reader pulls snapshots with
/// `collect`, while the provider drives `force_flush` and `shutdown`.
/// Each call to `collect` runs exactly one collection cycle.
pub trait MetricReader: fmt::Debug + Send + Sync + 'static {
    /// Called once by the provider with the pipeline this reader collects.
    ///
    /// Only a weak reference is held so the provider stays the owner.
    fn register_pipeline(&self, pipeline: Weak<Pipeline>);

    /// Runs one collection cycle and writes the result into `rm`.
    ///
    /// `ctx` bounds the observable callbacks of the cycle. Fails after
    /// shutdown, and with the context's error if it was done before any
    /// aggregator was read.
    fn collect(&self, ctx: &CollectContext, rm: &mut ResourceMetrics) -> MetricResult<()>;

    /// Pushes out anything the reader buffered.
    fn force_flush(&self) -> MetricResult<()>;

    /// Stops the reader. Later calls to `collect` return
    /// [MetricError::AlreadyShutdown].
    ///
    /// [MetricError::AlreadyShutdown]: crate::error::MetricError::AlreadyShutdown
    fn shutdown(&self) -> MetricResult<()>;

    /// Temporality used for streams of instruments of `kind`.
    fn temporality(&self, kind: InstrumentKind) -> Temporality;
}

/// The collecting side of a [Pipeline], as seen by a reader.
pub(crate) trait SdkProducer: fmt::Debug + Send + Sync {
    /// Runs callbacks, then snapshots every aggregator into `rm`.
    fn produce(&self, ctx: &CollectContext, rm: &mut ResourceMetrics) -> MetricResult<()>;
}
