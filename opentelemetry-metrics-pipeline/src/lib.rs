//! # OpenTelemetry Metrics Pipeline
//!
//! The in-process aggregation core of a metrics SDK. Application code records
//! measurements through typed instruments; every measurement is routed straight
//! to the aggregators that the configured [views] resolved for it, one set per
//! reader. Readers pull a [`ResourceMetrics`] snapshot on demand, which runs the
//! registered observable callbacks and then gathers every aggregator's data,
//! grouped by instrumentation scope.
//!
//! ```
//! use opentelemetry::KeyValue;
//! use opentelemetry_metrics_pipeline::{
//!     metrics::{data::ResourceMetrics, ManualReader, MetricReader, SdkMeterProvider, Temporality},
//!     CollectContext, Resource,
//! };
//!
//! let reader = ManualReader::builder()
//!     .with_temporality(Temporality::Delta)
//!     .build();
//! let provider = SdkMeterProvider::builder()
//!     .with_resource(Resource::builder_empty().with_service_name("checkout").build())
//!     .with_reader(reader.clone())
//!     .build();
//!
//! let meter = provider.meter("checkout.http");
//! let requests = meter.u64_counter("requests").with_unit("{request}").build();
//! requests.add(1, &[KeyValue::new("route", "/cart")]);
//!
//! let mut rm = ResourceMetrics::default();
//! reader.collect(&CollectContext::new(), &mut rm).unwrap();
//! assert_eq!(rm.scope_metrics.len(), 1);
//!
//! provider.shutdown().unwrap();
//! ```
//!
//! [views]: crate::metrics::View
//! [`ResourceMetrics`]: crate::metrics::data::ResourceMetrics
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

pub(crate) mod attributes;
mod context;
pub mod error;
pub mod metrics;
pub mod resource;

pub use context::CollectContext;
pub use resource::Resource;
