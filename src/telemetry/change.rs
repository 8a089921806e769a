//! Change dispatch span helpers.
//!
//! Every business handler invocation runs inside a `change.process` span;
//! the retry decision is recorded on it once the handler returns.

use tracing::Span;

use crate::model::Change;

/// What the controller did with a change after its handler returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handler succeeded; backoff history forgotten.
    Succeeded,
    /// Handler failed; re-enqueued with backoff.
    Requeued,
    /// Handler failed with no retries left; change dropped.
    Dropped,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Requeued => "requeued",
            Outcome::Dropped => "dropped",
        }
    }
}

/// Start a span for one handler invocation.
///
/// The `change.outcome` field is declared empty and filled in by
/// [`record_outcome`].
pub fn start_change_span(change: &Change, worker: usize, requeues: u32) -> Span {
    tracing::info_span!(
        "change.process",
        "change.action" = %change.action,
        "change.key" = %change.key,
        "change.requeues" = requeues,
        worker,
        "change.outcome" = tracing::field::Empty,
    )
}

/// Record the outcome on the span and emit a debug event scoped to it.
pub fn record_outcome(span: &Span, outcome: Outcome) {
    span.record("change.outcome", outcome.as_str());
    span.in_scope(|| {
        tracing::debug!(outcome = outcome.as_str(), "change processed");
    });
}
