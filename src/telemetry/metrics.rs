//! Metric instruments for dispatch-loop.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments come from the `"dispatch-loop"` meter. When no provider
//! is installed they are no-ops.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};

use crate::failure::FailureOrigin;
use crate::model::SubmitKind;

/// Returns the shared meter for dispatch-loop instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("dispatch-loop")
}

/// Counter: work items accepted by the queue.
/// Labels: `kind` ("post" | "send" | "send_async" | "spawn").
pub fn items_submitted() -> Counter<u64> {
    meter()
        .u64_counter("dispatch.items.submitted")
        .with_description("Number of work items accepted by the queue")
        .build()
}

/// Counter: work items executed by the worker.
/// Labels: `kind`.
pub fn items_executed() -> Counter<u64> {
    meter()
        .u64_counter("dispatch.items.executed")
        .with_description("Number of work items executed on the worker thread")
        .build()
}

/// Counter: work items dropped without running (shutdown or refusal).
/// Labels: `reason` ("stopped" | "refused").
pub fn items_discarded() -> Counter<u64> {
    meter()
        .u64_counter("dispatch.items.discarded")
        .with_description("Number of work items discarded without execution")
        .build()
}

/// Counter: unhandled failures reported to observers.
/// Labels: `origin` ("callback" | "delivery").
pub fn unhandled_failures() -> Counter<u64> {
    meter()
        .u64_counter("dispatch.failures.unhandled")
        .with_description("Number of failures with no caller to receive them")
        .build()
}

/// Histogram: callback execution time in milliseconds.
/// Labels: `kind`.
pub fn callback_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("dispatch.callback.duration_ms")
        .with_description("Callback execution time on the worker thread")
        .with_unit("ms")
        .build()
}

/// Instruments held by one loop so the hot path does not rebuild them.
#[derive(Clone)]
pub struct DispatchMetrics {
    submitted: Counter<u64>,
    executed: Counter<u64>,
    discarded: Counter<u64>,
    failures: Counter<u64>,
    duration: Histogram<f64>,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self {
            submitted: items_submitted(),
            executed: items_executed(),
            discarded: items_discarded(),
            failures: unhandled_failures(),
            duration: callback_duration_ms(),
        }
    }

    pub fn submitted(&self, kind: SubmitKind) {
        self.submitted.add(1, &[KeyValue::new("kind", kind.as_str())]);
    }

    pub fn executed(&self, kind: SubmitKind, duration_ms: f64) {
        let attrs = [KeyValue::new("kind", kind.as_str())];
        self.executed.add(1, &attrs);
        self.duration.record(duration_ms, &attrs);
    }

    pub fn discarded(&self, reason: &'static str, count: u64) {
        if count > 0 {
            self.discarded.add(count, &[KeyValue::new("reason", reason)]);
        }
    }

    pub fn unhandled(&self, origin: FailureOrigin) {
        self.failures.add(1, &[KeyValue::new("origin", origin.as_str())]);
    }
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}
