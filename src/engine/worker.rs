//! The worker thread's dispatch cycle.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, mpsc};

use tracing::{Span, debug};

use crate::error::panic_message;
use crate::failure::FailureOrigin;
use crate::queue::WorkItem;
use crate::telemetry::dispatch::{record_lateness, start_item_span};

use super::dispatch::Shared;
use super::work::Work;

/// Body of the worker thread. Returns once the queue is closed.
pub(crate) fn run(shared: Arc<Shared>, span: Span, ready: mpsc::Sender<()>) {
    let _entered = span.enter();
    // Before any item runs, so reentrant calls are recognised from the first one.
    shared.claim_worker_thread();
    debug!("worker entering dispatch cycle");
    // start() is blocked on this; it only goes away if start() unwound.
    let _ = ready.send(());
    drop(ready);

    loop {
        let peek = shared.queue.next_due();
        if peek.closed {
            break;
        }

        let Some(key) = peek.head else {
            shared.queue.wait_for_change(peek.epoch, None);
            continue;
        };

        if key.due > shared.clock.now() {
            // Woken early by an enqueue or by close; either way look again.
            shared.queue.wait_for_change(peek.epoch, Some(key.due));
            continue;
        }

        if let Some(item) = shared.queue.remove(key) {
            execute(&shared, item);
        }
    }

    debug!("worker leaving dispatch cycle");
    shared.finish();
}

fn execute(shared: &Arc<Shared>, item: WorkItem<Box<dyn Work>>) {
    let WorkItem { key, work } = item;
    let kind = work.kind();
    let span = start_item_span(kind.as_str(), key.sequence);
    let _entered = span.enter();

    let started = shared.clock.now();
    record_lateness(
        &span,
        started.saturating_duration_since(key.due).as_secs_f64() * 1000.0,
    );

    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| work.run(shared))) {
        shared.report(
            FailureOrigin::Callback,
            format!("work item unwound: {}", panic_message(payload.as_ref())),
        );
    }

    let elapsed = shared.clock.now().saturating_duration_since(started);
    shared.metrics.executed(kind, elapsed.as_secs_f64() * 1000.0);
}
