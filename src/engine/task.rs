//! Futures driven by the dispatch loop.
//!
//! A spawned future is only ever polled on the worker thread. Its waker may
//! fire from any thread; waking enqueues a [`PollTask`] item, so polls are
//! ordered with every other submission.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};

use parking_lot::Mutex;
use tracing::trace;

use crate::error::Error;
use crate::executor::Executor;
use crate::model::SubmitKind;
use crate::sink::ResultSink;

use super::dispatch::Shared;
use super::work::{BoxFuture, PollTask, Work, deliver};

/// Type-erased view used by the loop to fail parked tasks on shutdown.
pub(crate) trait ParkedTask: Send + Sync {
    fn abandon(&self, reason: Error);
}

pub(crate) struct FutureTask<T> {
    id: u64,
    future: Mutex<Option<BoxFuture<T>>>,
    sink: Mutex<Option<ResultSink<T>>>,
    resume: Arc<dyn Executor>,
    /// Set while a poll item for this task sits in the queue.
    scheduled: AtomicBool,
    home: Weak<Shared>,
}

impl<T: Send + 'static> FutureTask<T> {
    /// Create a task and register it with the loop.
    pub(crate) fn spawn(
        shared: &Arc<Shared>,
        future: BoxFuture<T>,
        sink: ResultSink<T>,
        resume: Arc<dyn Executor>,
    ) -> Arc<Self> {
        let task = Arc::new(Self {
            id: shared.next_task_id(),
            future: Mutex::new(Some(future)),
            sink: Mutex::new(Some(sink)),
            resume,
            scheduled: AtomicBool::new(false),
            home: Arc::downgrade(shared),
        });
        let parked: Weak<dyn ParkedTask> = Arc::downgrade(&task) as Weak<dyn ParkedTask>;
        shared.track_task(task.id, parked);
        task
    }

    /// Poll once on the worker thread.
    pub(crate) fn poll_once(self: &Arc<Self>, shared: &Arc<Shared>) {
        self.scheduled.store(false, Ordering::Release);

        // Polled outside the lock: a wake during poll may need to abandon.
        let Some(mut future) = self.future.lock().take() else {
            return;
        };

        let waker = Waker::from(Arc::clone(self));
        let mut cx = Context::from_waker(&waker);
        let outcome = catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));

        let result = match outcome {
            Ok(Poll::Pending) => {
                if self.sink.lock().is_some() {
                    *self.future.lock() = Some(future);
                }
                return;
            }
            Ok(Poll::Ready(value)) => Ok(value),
            Err(payload) => Err(Error::from_panic(payload)),
        };

        drop(future);
        shared.untrack_task(self.id);
        if let Some(sink) = self.sink.lock().take() {
            deliver(shared, &self.resume, sink, result);
        }
    }

    fn schedule(self: Arc<Self>) {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(shared) = self.home.upgrade() else {
            self.abandon(Error::Stopped);
            return;
        };

        let work: Box<dyn Work> = Box::new(PollTask::new(Arc::clone(&self)));
        if let Err(refused) = shared.resubmit(SubmitKind::Spawn, work) {
            trace!(reason = %refused.reason, "spawned future woken after loop stopped");
            refused.work.abandon(&shared, refused.reason);
        }
    }
}

impl<T: Send + 'static> ParkedTask for FutureTask<T> {
    /// Give up on the task and resolve its reader with `reason`.
    fn abandon(&self, reason: Error) {
        // Dropped outside the lock: a future may wake itself on drop.
        let future = self.future.lock().take();
        drop(future);
        if let Some(shared) = self.home.upgrade() {
            shared.untrack_task(self.id);
        }
        if let Some(sink) = self.sink.lock().take() {
            sink.fail(reason);
        }
    }
}

impl<T: Send + 'static> Wake for FutureTask<T> {
    fn wake(self: Arc<Self>) {
        self.schedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        Arc::clone(self).schedule();
    }
}
