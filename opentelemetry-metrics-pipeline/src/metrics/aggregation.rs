use std::fmt;

use crate::error::{MetricError, MetricResult};

/// The default explicit bucket boundaries used by histogram instruments.
pub(crate) const DEFAULT_HISTOGRAM_BOUNDARIES: [f64; 15] = [
    0.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0, 500.0, 750.0, 1000.0, 2500.0, 5000.0,
    7500.0, 10000.0,
];

/// The way recorded measurements are summarized.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Aggregation {
    /// An aggregation that drops all recorded data.
    Drop,

    /// An aggregation that uses the default instrument kind selection mapping to
    /// select another aggregation.
    ///
    /// * Counter, UpDownCounter and their observable forms ⇨ Sum
    /// * Gauge and Observable Gauge ⇨ LastValue
    /// * Histogram ⇨ ExplicitBucketHistogram with the default boundaries
    Default,

    /// An aggregation that summarizes a set of measurements as their arithmetic
    /// sum.
    Sum,

    /// An aggregation that summarizes a set of measurements as the last one made.
    LastValue,

    /// An aggregation that summarizes a set of measurements as a histogram with
    /// explicitly defined buckets.
    ExplicitBucketHistogram {
        /// The strictly increasing bucket boundary values.
        ///
        /// Buckets are inclusive of their lower boundary and exclusive of their
        /// upper boundary. Boundaries defined as:
        ///
        /// vec![0.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0, 500.0, 750.0,
        /// 1000.0, 2500.0, 5000.0, 7500.0, 10000.0];
        ///
        /// Will define these buckets:
        ///
        /// (-∞, 0), [0, 5.0), [5.0, 10.0), [10.0, 25.0), [25.0, 50.0), [50.0,
        ///  75.0), [75.0, 100.0), [100.0, 250.0), [250.0, 500.0), [500.0,
        ///  750.0), [750.0, 1000.0), [1000.0, 2500.0), [2500.0, 5000.0),
        ///  [5000.0, 7500.0), [7500.0, 10000.0), [10000.0, +∞)
        boundaries: Vec<f64>,

        /// Indicates whether to record the min and max of the distribution.
        ///
        /// For cumulative data they represent the entire life of the
        /// instrument; for delta data they are reset each collection cycle.
        record_min_max: bool,
    },
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // used for stream id comparisons
        let name = match self {
            Aggregation::Drop => "Drop",
            Aggregation::Default => "Default",
            Aggregation::Sum => "Sum",
            Aggregation::LastValue => "LastValue",
            Aggregation::ExplicitBucketHistogram { .. } => "ExplicitBucketHistogram",
        };

        f.write_str(name)
    }
}

impl Aggregation {
    /// Validate that this aggregation has correct configuration
    pub fn validate(&self) -> MetricResult<()> {
        match self {
            Aggregation::Drop => Ok(()),
            Aggregation::Default => Ok(()),
            Aggregation::Sum => Ok(()),
            Aggregation::LastValue => Ok(()),
            Aggregation::ExplicitBucketHistogram { boundaries, .. } => {
                validate_bucket_boundaries(boundaries)
            }
        }
    }
}

pub(crate) fn validate_bucket_boundaries(boundaries: &[f64]) -> MetricResult<()> {
    if boundaries.iter().any(|b| !b.is_finite()) {
        return Err(MetricError::Config(format!(
            "aggregation: explicit bucket histogram: boundaries must be finite: {boundaries:?}",
        )));
    }

    for x in boundaries.windows(2) {
        if x[0] >= x[1] {
            return Err(MetricError::Config(format!(
                "aggregation: explicit bucket histogram: non-monotonic boundaries: {boundaries:?}",
            )));
        }
    }

    Ok(())
}
