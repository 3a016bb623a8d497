//! The metrics aggregation pipeline.
//!
//! ## Configuration
//!
//! The configuration is stored with each [SdkMeterProvider]: the [Resource],
//! the [View]s and one [MetricReader] per pipeline. There is no global state.
//!
//! ### Example
//!
//! ```
//! use opentelemetry::KeyValue;
//! use opentelemetry_metrics_pipeline::{
//!     metrics::{new_view, Aggregation, Instrument, ManualReader, SdkMeterProvider, Stream},
//!     Resource,
//! };
//!
//! // Report request latency with coarser buckets than the default.
//! let view = new_view(
//!     Instrument::new().name("http.server.duration"),
//!     Stream::builder()
//!         .with_aggregation(Aggregation::ExplicitBucketHistogram {
//!             boundaries: vec![0.1, 0.5, 1.0],
//!             record_min_max: true,
//!         })
//!         .build()
//!         .unwrap(),
//! )
//! .unwrap();
//!
//! let meter_provider = SdkMeterProvider::builder()
//!     .with_resource(Resource::builder_empty().with_service_name("my_app").build())
//!     .with_reader(ManualReader::builder().build())
//!     .with_view(view)
//!     .build();
//!
//! // Create instruments scoped to a meter
//! let meter = meter_provider.meter("my_app");
//! let counter = meter
//!     .u64_counter("power_consumption")
//!     .with_unit("kWh")
//!     .build();
//!
//! // use instruments to record measurements
//! counter.add(10, &[KeyValue::new("rate", "standard")]);
//!
//! meter_provider.shutdown().unwrap();
//! ```
//!
//! [Resource]: crate::Resource

pub(crate) mod aggregation;
pub mod data;
pub(crate) mod instrument;
pub(crate) mod internal;
pub(crate) mod manual_reader;
pub(crate) mod meter;
mod meter_provider;
pub(crate) mod pipeline;
pub mod reader;
pub(crate) mod view;

pub use aggregation::Aggregation;
pub use data::Temporality;
pub use instrument::{
    AsyncInstrument, Counter, Gauge, Histogram, Instrument, InstrumentKind, ObservableCounter,
    ObservableGauge, ObservableInstrument, ObservableUpDownCounter, Stream, StreamBuilder,
    UpDownCounter,
};
pub use manual_reader::{ManualReader, ManualReaderBuilder};
pub use meter::{AsyncInstrumentBuilder, InstrumentBuilder, SdkMeter};
pub use meter_provider::{MeterProviderBuilder, SdkMeterProvider};
pub use pipeline::{Pipeline, Registration};
pub use reader::MetricReader;
pub use view::{new_view, View};
