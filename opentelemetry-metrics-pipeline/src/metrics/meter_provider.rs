use core::fmt;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use opentelemetry::{otel_debug, otel_error, otel_info, InstrumentationScope};

use crate::{error::MetricResult, Resource};

use super::{meter::SdkMeter, pipeline::Pipelines, reader::MetricReader, view::View};

/// The SDK context: owns one pipeline per [MetricReader] and hands out
/// [SdkMeter]s that record into all of them.
///
/// Every meter shares the provider's [Resource] and [View]s. Clones are
/// handles to the same provider. The provider shuts down when `shutdown` is
/// called or the last handle is dropped, whichever comes first.
#[derive(Clone, Debug)]
pub struct SdkMeterProvider {
    inner: Arc<SdkMeterProviderInner>,
}

#[derive(Debug)]
struct SdkMeterProviderInner {
    pipes: Arc<Pipelines>,
    meters: Mutex<HashMap<InstrumentationScope, SdkMeter>>,
}

impl Default for SdkMeterProvider {
    fn default() -> Self {
        SdkMeterProvider::builder().build()
    }
}

impl SdkMeterProvider {
    /// Starts configuring a provider.
    pub fn builder() -> MeterProviderBuilder {
        MeterProviderBuilder::default()
    }

    /// Returns the meter for the scope named `name`.
    pub fn meter(&self, name: &'static str) -> SdkMeter {
        let scope = InstrumentationScope::builder(name).build();
        self.meter_with_scope(scope)
    }

    /// Returns the meter for `scope`, creating it on first use. Later calls
    /// with an equal scope return a meter that shares its instruments.
    ///
    /// Meters obtained after shutdown create instruments that record nothing.
    pub fn meter_with_scope(&self, scope: InstrumentationScope) -> SdkMeter {
        if scope.name().is_empty() {
            otel_info!(name: "MeterNameEmpty", message = "Meter name is empty; consider providing a meaningful name. Meter will function normally and the provided name will be used as-is.");
        };

        let mut meters = match self.inner.meters.lock() {
            Ok(meters) => meters,
            Err(err) => err.into_inner(),
        };
        if let Some(existing_meter) = meters.get(&scope) {
            otel_debug!(
                name: "MeterProvider.ExistingMeterReturned",
                meter_name = scope.name(),
            );
            return existing_meter.clone();
        }

        let new_meter = SdkMeter::new(scope.clone(), Arc::clone(&self.inner.pipes));
        otel_debug!(
            name: "MeterProvider.NewMeterCreated",
            meter_name = scope.name(),
        );
        meters.insert(scope, new_meter.clone());
        new_meter
    }

    /// Flushes every reader. Fails with
    /// [MetricError::AlreadyShutdown] after shutdown.
    ///
    /// [MetricError::AlreadyShutdown]: crate::error::MetricError::AlreadyShutdown
    pub fn force_flush(&self) -> MetricResult<()> {
        self.inner.force_flush()
    }

    /// Shuts down every reader. Only the first call does anything; later calls
    /// return [MetricError::AlreadyShutdown].
    ///
    /// Instruments keep accepting measurements afterwards but nothing collects
    /// them.
    ///
    /// [MetricError::AlreadyShutdown]: crate::error::MetricError::AlreadyShutdown
    pub fn shutdown(&self) -> MetricResult<()> {
        otel_info!(
            name: "MeterProvider.Shutdown",
            message = "User initiated shutdown of MeterProvider."
        );
        self.inner.shutdown()
    }
}

impl SdkMeterProviderInner {
    fn force_flush(&self) -> MetricResult<()> {
        if self.pipes.is_shutdown() {
            Err(crate::error::MetricError::AlreadyShutdown)
        } else {
            self.pipes.force_flush()
        }
    }

    fn shutdown(&self) -> MetricResult<()> {
        let result = self.pipes.shutdown();
        if let Err(err) = &result {
            otel_debug!(
                name: "MeterProvider.ShutdownFailed",
                reason = format!("{err}"),
            );
        }
        result
    }
}

impl Drop for SdkMeterProviderInner {
    fn drop(&mut self) {
        if self.pipes.is_shutdown() {
            otel_debug!(
                name: "MeterProvider.AlreadyShutdown",
                message = "MeterProvider was already shut down; drop will not attempt shutdown again."
            );
        } else {
            otel_info!(
                name: "MeterProvider.Dropped",
                message = "Last reference of MeterProvider dropped, initiating shutdown."
            );
            if let Err(err) = self.shutdown() {
                otel_error!(
                    name: "MeterProvider.ShutdownFailed",
                    message = "Shutdown attempt failed during drop of MeterProvider.",
                    reason = format!("{}", err)
                );
            }
        }
    }
}

/// Collects the resource, readers and views of a [SdkMeterProvider].
#[derive(Default)]
pub struct MeterProviderBuilder {
    resource: Option<Resource>,
    readers: Vec<Box<dyn MetricReader>>,
    views: Vec<Arc<dyn View>>,
}

impl MeterProviderBuilder {
    /// Sets the [Resource] attached to every collection. Defaults to an empty
    /// resource.
    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Adds a reader. Each reader gets its own pipeline with its own
    /// aggregators, so readers never see each other's delta resets.
    pub fn with_reader<T: MetricReader>(mut self, reader: T) -> Self {
        self.readers.push(Box::new(reader));
        self
    }

    /// Appends a view. Every view that matches an instrument adds a stream;
    /// an instrument no view matches is reported as-is.
    pub fn with_view<T: View>(mut self, view: T) -> Self {
        self.views.push(Arc::new(view));
        self
    }

    /// Builds the provider and registers a pipeline with each reader.
    pub fn build(self) -> SdkMeterProvider {
        otel_debug!(
            name: "MeterProvider.Building",
            builder = format!("{:?}", &self),
        );

        let meter_provider = SdkMeterProvider {
            inner: Arc::new(SdkMeterProviderInner {
                pipes: Arc::new(Pipelines::new(
                    self.resource.unwrap_or_default(),
                    self.readers,
                    self.views,
                )),
                meters: Default::default(),
            }),
        };

        otel_info!(
            name: "MeterProvider.Built",
        );
        meter_provider
    }
}

impl fmt::Debug for MeterProviderBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeterProviderBuilder")
            .field("resource", &self.resource)
            .field("readers", &self.readers)
            .field("views", &self.views.len())
            .finish()
    }
}
