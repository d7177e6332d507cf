//! Span helpers for queued units and debounced send rounds.
//!
//! Provides span creation and state-transition recording for work
//! flowing through the queue and the updater.

use crate::model::{UnitId, UnitOutcome};
use tracing::Span;

/// Start a span for one unit of work.
///
/// The `unit.outcome` field is declared empty and filled in by
/// [`record_outcome`] when the unit finishes.
pub fn start_unit_span(id: &UnitId) -> Span {
    tracing::info_span!(
        "queue.unit",
        "unit.id" = %id,
        "unit.outcome" = tracing::field::Empty,
    )
}

/// Record how a unit ended on its span.
pub fn record_outcome(span: &Span, outcome: UnitOutcome) {
    span.record("unit.outcome", outcome.as_str());
}

/// Start a span for one debounced send round of `key`.
pub fn start_round_span(key: &str, unit: &UnitId) -> Span {
    tracing::info_span!(
        "update.round",
        "update.key" = key,
        "unit.id" = %unit,
    )
}

/// Record a key phase transition as an event scoped to the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::debug!(from = from, to = to, "state_transition");
    });
}
