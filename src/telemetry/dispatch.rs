//! Dispatch loop span helpers.
//!
//! The worker thread runs inside a `dispatch.loop` span for its whole
//! lifetime; each executed item gets a short `dispatch.item` span.

use tracing::Span;

use crate::model::{LoopId, LoopState};

/// Span covering one worker thread's lifetime.
///
/// `dispatch.state` is declared empty and updated via
/// [`record_lifecycle_transition`].
pub fn start_loop_span(loop_id: LoopId, thread_name: &str) -> Span {
    tracing::info_span!(
        "dispatch.loop",
        "dispatch.loop_id" = %loop_id,
        "dispatch.thread" = thread_name,
        "dispatch.state" = tracing::field::Empty,
    )
}

/// Span for one work item taken off the queue.
pub fn start_item_span(kind: &'static str, sequence: u64) -> Span {
    tracing::debug_span!(
        "dispatch.item",
        "dispatch.kind" = kind,
        "dispatch.sequence" = sequence,
        "dispatch.late_ms" = tracing::field::Empty,
    )
}

/// Record how far past its due instant an item started.
pub fn record_lateness(span: &Span, late_ms: f64) {
    span.record("dispatch.late_ms", late_ms);
}

/// Record a lifecycle transition on the given span.
///
/// Emits a tracing `info` event scoped to the span.
pub fn record_lifecycle_transition(span: &Span, from: LoopState, to: LoopState) {
    span.record("dispatch.state", to.as_str());
    span.in_scope(|| {
        tracing::info!(from = from.as_str(), to = to.as_str(), "lifecycle_transition");
    });
}
