/// Whether reported values cover the whole life of a stream or only the
/// interval since the previous collection.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Temporality {
    /// Totals since the stream was created. Aggregator state is never reset,
    /// so consecutive reports of a monotonic sum never decrease.
    #[default]
    Cumulative,

    /// Changes since the previous collection. Aggregator state is drained on
    /// every collection, so an attribute set that saw no measurements in a
    /// cycle is absent from that cycle's report.
    Delta,
}
