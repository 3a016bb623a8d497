use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{MetricError, MetricResult};

/// The cancellation budget of a single collection.
///
/// A context carries an optional deadline and a [CancellationToken]. It is
/// passed to [`MetricReader::collect`], through the pipeline, to every
/// observable callback. Callbacks run synchronously; a long running callback
/// should poll [`CollectContext::is_done`] and return early.
///
/// ```
/// use std::time::Duration;
/// use opentelemetry_metrics_pipeline::CollectContext;
///
/// let ctx = CollectContext::new().with_timeout(Duration::from_secs(5));
/// assert!(!ctx.is_done());
/// ctx.cancel();
/// assert!(ctx.is_done());
/// ```
///
/// [`MetricReader::collect`]: crate::metrics::MetricReader::collect
#[derive(Clone, Debug, Default)]
pub struct CollectContext {
    deadline: Option<Instant>,
    token: CancellationToken,
}

impl CollectContext {
    /// A context that is never done unless explicitly cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the deadline to `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Sets an absolute deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Uses `token` for cancellation, so the caller can cancel a collection
    /// that is already running.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline. `None` if there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Cancels this context and every clone sharing its token.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns `true` once cancelled or past the deadline.
    pub fn is_done(&self) -> bool {
        self.check().is_err()
    }

    /// Returns the reason this context is done, if it is.
    pub fn check(&self) -> MetricResult<()> {
        if self.token.is_cancelled() {
            return Err(MetricError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(MetricError::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}
