//! Work item payloads: what the worker does with each kind of submission.
//!
//! Every payload either runs on the worker thread or is abandoned (loop
//! stopped, queue refused it). Abandoning a payload that carries a result
//! sink always resolves that sink.

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;

use tracing::trace;

use crate::error::{Error, Result, panic_message};
use crate::executor::{Executor, Job};
use crate::failure::FailureOrigin;
use crate::model::SubmitKind;
use crate::sink::ResultSink;

use super::dispatch::Shared;
use super::task::{FutureTask, ParkedTask};

pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// A payload owned by the scheduling queue.
pub(crate) trait Work: Send {
    fn kind(&self) -> SubmitKind;

    /// Execute on the worker thread. Must not unwind.
    fn run(self: Box<Self>, shared: &Arc<Shared>);

    /// Dispose of an item the worker will never run, resolving any attached
    /// sink with `reason`.
    fn abandon(self: Box<Self>, shared: &Arc<Shared>, reason: Error);

    /// Hand back a raw continuation, if this payload is one.
    fn into_continuation(self: Box<Self>) -> Option<Job> {
        None
    }
}

// ---------------------------------------------------------------------------
// post / try_post
// ---------------------------------------------------------------------------

/// Fire-and-forget callback. Failures only reach the observers.
pub(crate) struct Posted {
    callback: Box<dyn FnOnce() -> std::result::Result<(), String> + Send>,
}

impl Posted {
    pub(crate) fn new<F>(callback: F) -> Self
    where
        F: FnOnce() -> std::result::Result<(), String> + Send + 'static,
    {
        Self {
            callback: Box::new(callback),
        }
    }
}

impl Work for Posted {
    fn kind(&self) -> SubmitKind {
        SubmitKind::Post
    }

    fn run(self: Box<Self>, shared: &Arc<Shared>) {
        let failure = match catch_unwind(AssertUnwindSafe(self.callback)) {
            Ok(Ok(())) => return,
            Ok(Err(message)) => Error::Callback(message),
            Err(payload) => Error::from_panic(payload),
        };
        shared.report(FailureOrigin::Callback, failure.to_string());
    }

    fn abandon(self: Box<Self>, _shared: &Arc<Shared>, reason: Error) {
        trace!(%reason, "posted callback discarded");
    }
}

// ---------------------------------------------------------------------------
// send
// ---------------------------------------------------------------------------

/// Blocking call: the submitter waits on `sink`.
pub(crate) struct Sent<T> {
    callback: Box<dyn FnOnce() -> T + Send>,
    sink: ResultSink<T>,
}

impl<T> Sent<T> {
    pub(crate) fn new<F>(callback: F, sink: ResultSink<T>) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self {
            callback: Box::new(callback),
            sink,
        }
    }
}

impl<T: Send + 'static> Work for Sent<T> {
    fn kind(&self) -> SubmitKind {
        SubmitKind::Send
    }

    fn run(self: Box<Self>, _shared: &Arc<Shared>) {
        let Self { callback, sink } = *self;
        let result = catch_unwind(AssertUnwindSafe(callback)).map_err(Error::from_panic);
        sink.complete(result);
    }

    fn abandon(self: Box<Self>, _shared: &Arc<Shared>, reason: Error) {
        self.sink.fail(reason);
    }
}

// ---------------------------------------------------------------------------
// send_async
// ---------------------------------------------------------------------------

/// Non-blocking call: the outcome goes back through `resume`.
pub(crate) struct Resumed<T> {
    callback: Box<dyn FnOnce() -> T + Send>,
    sink: ResultSink<T>,
    resume: Arc<dyn Executor>,
}

impl<T> Resumed<T> {
    pub(crate) fn new<F>(callback: F, sink: ResultSink<T>, resume: Arc<dyn Executor>) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self {
            callback: Box::new(callback),
            sink,
            resume,
        }
    }
}

impl<T: Send + 'static> Work for Resumed<T> {
    fn kind(&self) -> SubmitKind {
        SubmitKind::SendAsync
    }

    fn run(self: Box<Self>, shared: &Arc<Shared>) {
        let Self {
            callback,
            sink,
            resume,
        } = *self;
        let result = catch_unwind(AssertUnwindSafe(callback)).map_err(Error::from_panic);
        deliver(shared, &resume, sink, result);
    }

    fn abandon(self: Box<Self>, _shared: &Arc<Shared>, reason: Error) {
        self.sink.fail(reason);
    }
}

// ---------------------------------------------------------------------------
// spawn
// ---------------------------------------------------------------------------

/// Asynchronous callback: builds its future on the worker thread and is
/// then polled there until it completes.
pub(crate) struct SpawnFuture<T> {
    factory: Box<dyn FnOnce() -> BoxFuture<T> + Send>,
    sink: ResultSink<T>,
    resume: Arc<dyn Executor>,
}

impl<T> SpawnFuture<T> {
    pub(crate) fn new<F, Fut>(factory: F, sink: ResultSink<T>, resume: Arc<dyn Executor>) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        Self {
            factory: Box::new(move || Box::pin(factory()) as BoxFuture<T>),
            sink,
            resume,
        }
    }
}

impl<T: Send + 'static> Work for SpawnFuture<T> {
    fn kind(&self) -> SubmitKind {
        SubmitKind::Spawn
    }

    fn run(self: Box<Self>, shared: &Arc<Shared>) {
        let Self {
            factory,
            sink,
            resume,
        } = *self;
        match catch_unwind(AssertUnwindSafe(factory)) {
            Ok(future) => {
                let task = FutureTask::spawn(shared, future, sink, resume);
                task.poll_once(shared);
            }
            Err(payload) => deliver(shared, &resume, sink, Err(Error::from_panic(payload))),
        }
    }

    fn abandon(self: Box<Self>, _shared: &Arc<Shared>, reason: Error) {
        self.sink.fail(reason);
    }
}

/// Re-poll of a spawned future after its waker fired.
pub(crate) struct PollTask<T> {
    task: Arc<FutureTask<T>>,
}

impl<T> PollTask<T> {
    pub(crate) fn new(task: Arc<FutureTask<T>>) -> Self {
        Self { task }
    }
}

impl<T: Send + 'static> Work for PollTask<T> {
    fn kind(&self) -> SubmitKind {
        SubmitKind::Spawn
    }

    fn run(self: Box<Self>, shared: &Arc<Shared>) {
        self.task.poll_once(shared);
    }

    fn abandon(self: Box<Self>, _shared: &Arc<Shared>, reason: Error) {
        self.task.abandon(reason);
    }
}

// ---------------------------------------------------------------------------
// continuations run on the loop as a resumption context
// ---------------------------------------------------------------------------

/// A continuation scheduled through the loop's [`Executor`] impl.
pub(crate) struct Continuation {
    job: Job,
}

impl Continuation {
    pub(crate) fn new(job: Job) -> Self {
        Self { job }
    }
}

impl Work for Continuation {
    fn kind(&self) -> SubmitKind {
        SubmitKind::Post
    }

    fn run(self: Box<Self>, shared: &Arc<Shared>) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(self.job)) {
            shared.report(
                FailureOrigin::Delivery,
                format!("continuation panicked: {}", panic_message(payload.as_ref())),
            );
        }
    }

    /// A continuation carries a result the loop already produced, so it
    /// still runs (on the stopping thread) rather than being dropped.
    fn abandon(self: Box<Self>, shared: &Arc<Shared>, reason: Error) {
        trace!(%reason, "running continuation outside the loop");
        self.run(shared);
    }

    fn into_continuation(self: Box<Self>) -> Option<Job> {
        Some(self.job)
    }
}

// ---------------------------------------------------------------------------
// result delivery
// ---------------------------------------------------------------------------

/// Complete `sink` with `result` on the captured resumption context.
///
/// A rejected continuation is reported as a delivery failure and then run
/// on the current thread, so the reader is resolved either way.
pub(crate) fn deliver<T: Send + 'static>(
    shared: &Arc<Shared>,
    resume: &Arc<dyn Executor>,
    sink: ResultSink<T>,
    result: Result<T>,
) {
    if sink.is_reader_gone() {
        trace!("result dropped: reader went away");
        return;
    }

    let home = Arc::downgrade(shared);
    let job: Job = Box::new(move || {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(move || sink.complete(result))) {
            if let Some(shared) = home.upgrade() {
                shared.report(
                    FailureOrigin::Delivery,
                    format!("result delivery panicked: {}", panic_message(payload.as_ref())),
                );
            }
        }
    });

    if let Err(rejected) = resume.execute(job) {
        shared.report(
            FailureOrigin::Delivery,
            format!(
                "{} executor rejected result delivery: {}",
                resume.label(),
                rejected.reason
            ),
        );
        if let Some(job) = rejected.job {
            job();
        }
    }
}
