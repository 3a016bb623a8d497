//! Errors returned by configuration and collection operations.
//!
//! Recording measurements never returns an error; see the crate docs.
use std::result;
use std::sync::PoisonError;
use thiserror::Error;

/// A specialized `Result` type for metric operations.
pub type MetricResult<T> = result::Result<T, MetricError>;

/// Errors returned by the metrics pipeline.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum MetricError {
    /// Other errors not covered by specific cases.
    #[error("Metrics error: {0}")]
    Other(String),
    /// Invalid configuration
    #[error("Config error {0}")]
    Config(String),
    /// Invalid instrument configuration such as an invalid instrument name or
    /// unit.
    #[error("Invalid instrument configuration: {0}")]
    InvalidInstrumentConfiguration(&'static str),
    /// The provider or reader was already shut down.
    #[error("metrics pipeline is already shut down")]
    AlreadyShutdown,
    /// The collection was cancelled through its [CollectContext].
    ///
    /// [CollectContext]: crate::CollectContext
    #[error("collection cancelled before any snapshot was taken")]
    Cancelled,
    /// The collection deadline passed before any snapshot was taken.
    #[error("collection deadline exceeded before any snapshot was taken")]
    DeadlineExceeded,
}

impl<T> From<PoisonError<T>> for MetricError {
    fn from(err: PoisonError<T>) -> Self {
        MetricError::Other(err.to_string())
    }
}
