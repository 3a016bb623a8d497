use std::{
    fmt,
    sync::{Arc, Mutex, Weak},
};

use opentelemetry::otel_warn;

use crate::{
    error::{MetricError, MetricResult},
    CollectContext,
};

use super::{
    data::{ResourceMetrics, Temporality},
    instrument::InstrumentKind,
    pipeline::Pipeline,
    reader::{MetricReader, SdkProducer},
};

type TemporalitySelector = Arc<dyn Fn(InstrumentKind) -> Temporality + Send + Sync>;

/// A simple [MetricReader] that allows an application to read metrics on demand.
///
/// Clones share the same registration, so one clone can be handed to the
/// meter provider while another is kept to call [MetricReader::collect].
///
/// See [ManualReaderBuilder] for configuration options.
///
/// # Example
///
/// ```
/// use opentelemetry_metrics_pipeline::metrics::ManualReader;
///
/// // can specify additional reader configuration
/// let reader = ManualReader::builder().build();
/// # drop(reader)
/// ```
#[derive(Clone)]
pub struct ManualReader {
    inner: Arc<Mutex<ManualReaderInner>>,
    temporality_selector: TemporalitySelector,
}

impl Default for ManualReader {
    fn default() -> Self {
        ManualReader::builder().build()
    }
}

impl fmt::Debug for ManualReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ManualReader")
    }
}

#[derive(Debug, Default)]
struct ManualReaderInner {
    sdk_producer: Option<Weak<dyn SdkProducer>>,
    is_shutdown: bool,
}

impl ManualReader {
    /// Configuration for this reader
    pub fn builder() -> ManualReaderBuilder {
        ManualReaderBuilder::default()
    }

    /// A [MetricReader] which is directly called to collect metrics.
    pub(crate) fn new(temporality_selector: TemporalitySelector) -> Self {
        ManualReader {
            inner: Arc::new(Mutex::new(ManualReaderInner::default())),
            temporality_selector,
        }
    }
}

impl MetricReader for ManualReader {
    ///  Register a pipeline which enables the caller to read metrics from the SDK
    ///  on demand.
    fn register_pipeline(&self, pipeline: Weak<Pipeline>) {
        let _ = self.inner.lock().map(|mut inner| {
            // Only register once. If producer is already set, do nothing.
            if inner.sdk_producer.is_none() {
                inner.sdk_producer = Some(pipeline);
            } else {
                otel_warn!(
                    name: "ManualReader.DuplicateRegistration",
                    message = "The pipeline is already registered to the Reader. Registering pipeline multiple times is not allowed.",
                );
            }
        });
    }

    /// Gathers all metrics from the SDK, calling any callbacks necessary and
    /// returning the results.
    ///
    /// Returns an error if called after shutdown or before the reader was
    /// handed to a meter provider.
    fn collect(&self, ctx: &CollectContext, rm: &mut ResourceMetrics) -> MetricResult<()> {
        // Release the lock before producing so a slow callback does not block
        // shutdown of this reader.
        let producer = {
            let inner = self.inner.lock()?;
            if inner.is_shutdown {
                return Err(MetricError::AlreadyShutdown);
            }
            inner.sdk_producer.as_ref().and_then(|w| w.upgrade())
        };

        match producer {
            Some(producer) => producer.produce(ctx, rm),
            None => Err(MetricError::Other(
                "reader is not registered with a meter provider".into(),
            )),
        }
    }

    /// ForceFlush is a no-op, it always returns Ok.
    fn force_flush(&self) -> MetricResult<()> {
        Ok(())
    }

    /// Closes any connections and frees any resources used by the reader.
    fn shutdown(&self) -> MetricResult<()> {
        let mut inner = self.inner.lock()?;
        if inner.is_shutdown {
            return Err(MetricError::AlreadyShutdown);
        }

        // Any future call to collect will now return an error.
        inner.sdk_producer = None;
        inner.is_shutdown = true;

        Ok(())
    }

    fn temporality(&self, kind: InstrumentKind) -> Temporality {
        (self.temporality_selector)(kind)
    }
}

/// Configuration for a [ManualReader]
pub struct ManualReaderBuilder {
    temporality_selector: TemporalitySelector,
}

impl fmt::Debug for ManualReaderBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ManualReaderBuilder")
    }
}

impl Default for ManualReaderBuilder {
    fn default() -> Self {
        ManualReaderBuilder {
            temporality_selector: Arc::new(|_| Temporality::Cumulative),
        }
    }
}

impl ManualReaderBuilder {
    /// New manual builder configuration
    pub fn new() -> Self {
        Default::default()
    }

    /// Set the [Temporality] of the exporter, for every instrument kind.
    pub fn with_temporality(self, temporality: Temporality) -> Self {
        self.with_temporality_selector(move |_| temporality)
    }

    /// Sets the [Temporality] per [InstrumentKind]. If this option is not
    /// used, every instrument is reported with cumulative temporality.
    pub fn with_temporality_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn(InstrumentKind) -> Temporality + Send + Sync + 'static,
    {
        self.temporality_selector = Arc::new(selector);
        self
    }

    /// Create a new [ManualReader] from this configuration.
    pub fn build(self) -> ManualReader {
        ManualReader::new(self.temporality_selector)
    }
}
