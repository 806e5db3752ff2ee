//! The dispatch loop: one worker thread, any number of submitters.
//!
//! [`DispatchLoop`] owns the loop and disposes it on drop. [`LoopHandle`] is
//! a cheap clone that can be moved into callbacks and other threads; it
//! carries the whole submission and lifecycle API. A handle is also an
//! [`Executor`], which is how a loop-affine caller gets its results back on
//! the loop.

use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak, mpsc};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{Span, debug, error, info, trace, warn};

use crate::clock::{Clock, MonotonicClock};
use crate::config::LoopConfig;
use crate::error::{Error, Result};
use crate::executor::{Executor, Job, Rejected, ThreadExecutor, TokioExecutor};
use crate::failure::{FailureOrigin, ObserverId, Observers, UnhandledFailure};
use crate::model::{LoopId, LoopState, SubmitKind};
use crate::queue::{Refused, ScheduleQueue};
use crate::sink::{self, Pending};
use crate::telemetry::dispatch::{record_lifecycle_transition, start_loop_span};
use crate::telemetry::metrics::DispatchMetrics;

use super::task::ParkedTask;
use super::work::{Continuation, Posted, Resumed, Sent, SpawnFuture, Work};
use super::worker;

struct Lifecycle {
    state: LoopState,
    worker: Option<JoinHandle<()>>,
    disposed: bool,
    span: Span,
}

impl Lifecycle {
    fn transition(&mut self, to: LoopState) {
        debug_assert!(
            self.state.can_transition_to(to),
            "illegal lifecycle transition {} -> {}",
            self.state,
            to
        );
        record_lifecycle_transition(&self.span, self.state, to);
        self.state = to;
    }
}

/// State shared by every handle and the worker thread.
pub(crate) struct Shared {
    pub(crate) id: LoopId,
    pub(crate) config: LoopConfig,
    pub(crate) queue: ScheduleQueue<Box<dyn Work>>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) metrics: DispatchMetrics,
    observers: Observers,
    default_executor: Arc<dyn Executor>,
    owner: RwLock<Option<ThreadId>>,
    lifecycle: Mutex<Lifecycle>,
    lifecycle_changed: Condvar,
    /// Spawned futures not yet finished, including ones parked on a waker.
    tasks: Mutex<HashMap<u64, Weak<dyn ParkedTask>>>,
    next_task_id: AtomicU64,
}

impl Shared {
    /// Enqueue `work` to run `delay` from now. Subject to `max_pending`.
    pub(crate) fn submit(
        &self,
        kind: SubmitKind,
        delay: Duration,
        work: Box<dyn Work>,
    ) -> std::result::Result<(), Refused<Box<dyn Work>>> {
        self.admit(kind, delay, work, true)
    }

    /// Enqueue work that continues an accepted item: a re-poll of a spawned
    /// future or a result continuation. Ignores `max_pending`.
    pub(crate) fn resubmit(
        &self,
        kind: SubmitKind,
        work: Box<dyn Work>,
    ) -> std::result::Result<(), Refused<Box<dyn Work>>> {
        self.admit(kind, Duration::ZERO, work, false)
    }

    fn admit(
        &self,
        kind: SubmitKind,
        delay: Duration,
        work: Box<dyn Work>,
        bounded: bool,
    ) -> std::result::Result<(), Refused<Box<dyn Work>>> {
        let due = self.clock.due_after(delay);
        let admitted = if bounded {
            self.queue.enqueue(due, work)
        } else {
            self.queue.enqueue_unbounded(due, work)
        };
        match admitted {
            Ok(key) => {
                self.metrics.submitted(kind);
                trace!(
                    loop_id = %self.id,
                    kind = kind.as_str(),
                    sequence = key.sequence,
                    delay_ms = delay.as_millis() as u64,
                    "work enqueued"
                );
                Ok(())
            }
            Err(refused) => {
                self.metrics.discarded("refused", 1);
                debug!(
                    loop_id = %self.id,
                    kind = kind.as_str(),
                    reason = %refused.reason,
                    "work refused"
                );
                Err(refused)
            }
        }
    }

    pub(crate) fn report(&self, origin: FailureOrigin, message: String) -> UnhandledFailure {
        self.metrics.unhandled(origin);
        self.observers.report(origin, message)
    }

    pub(crate) fn is_worker_thread(&self) -> bool {
        *self.owner.read() == Some(thread::current().id())
    }

    /// Record the calling thread as the owner. The worker does this before
    /// it signals readiness or takes its first item.
    pub(crate) fn claim_worker_thread(&self) {
        *self.owner.write() = Some(thread::current().id());
    }

    fn state(&self) -> LoopState {
        self.lifecycle.lock().state
    }

    /// Drop every pending item, resolving attached sinks with `reason`.
    fn discard_pending(self: &Arc<Self>, reason: fn() -> Error) -> usize {
        let drained = self.queue.drain();
        let count = drained.len();
        self.metrics.discarded("stopped", count as u64);
        for item in drained {
            item.work.abandon(self, reason());
        }
        count
    }

    pub(crate) fn next_task_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn track_task(&self, id: u64, task: Weak<dyn ParkedTask>) {
        self.tasks.lock().insert(id, task);
    }

    pub(crate) fn untrack_task(&self, id: u64) {
        self.tasks.lock().remove(&id);
    }

    /// Final step of a shutdown. Runs on the worker as it leaves its cycle,
    /// or on the stopping thread if the worker unwound.
    pub(crate) fn finish(self: &Arc<Self>) {
        let discarded = self.discard_pending(|| Error::Stopped);
        let parked: Vec<_> = self.tasks.lock().drain().map(|(_, task)| task).collect();
        for task in parked.iter().filter_map(Weak::upgrade) {
            task.abandon(Error::Stopped);
        }
        *self.owner.write() = None;

        let mut life = self.lifecycle.lock();
        if life.state == LoopState::Terminating {
            life.transition(LoopState::Stopped);
        }
        drop(life);
        self.lifecycle_changed.notify_all();

        info!(loop_id = %self.id, discarded, "dispatch loop stopped");
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable handle to a dispatch loop.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    pub fn id(&self) -> LoopId {
        self.shared.id
    }

    pub fn config(&self) -> &LoopConfig {
        &self.shared.config
    }

    pub fn state(&self) -> LoopState {
        self.shared.state()
    }

    /// Whether the calling thread is this loop's worker thread.
    pub fn is_worker_thread(&self) -> bool {
        self.shared.is_worker_thread()
    }

    /// Number of items waiting in the queue.
    pub fn pending_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Spawn the worker thread and wait until it is in its dispatch cycle.
    ///
    /// Idempotent while running. A loop that is still terminating is waited
    /// for, then restarted.
    pub fn start(&self) -> Result<()> {
        let shared = &self.shared;
        let mut life = shared.lifecycle.lock();
        loop {
            match life.state {
                LoopState::Running => return Ok(()),
                LoopState::Stopped => break,
                LoopState::Terminating => {
                    if shared.is_worker_thread() {
                        return Err(Error::Other(
                            "cannot restart a dispatch loop from its own worker thread".to_string(),
                        ));
                    }
                    shared.lifecycle_changed.wait(&mut life);
                }
            }
        }
        if life.disposed {
            return Err(Error::Disposed);
        }

        // A worker that stopped itself was never joined.
        if let Some(previous) = life.worker.take() {
            if previous.join().is_err() {
                warn!(loop_id = %shared.id, "previous worker thread had panicked");
            }
        }

        shared.queue.open();
        let span = start_loop_span(shared.id, &shared.config.thread_name);
        let (ready_tx, ready_rx) = mpsc::channel();

        let mut builder = thread::Builder::new().name(shared.config.thread_name.clone());
        if let Some(size) = shared.config.stack_size {
            builder = builder.stack_size(size);
        }
        let worker_shared = Arc::clone(shared);
        let worker_span = span.clone();
        let handle = match builder.spawn(move || worker::run(worker_shared, worker_span, ready_tx)) {
            Ok(handle) => handle,
            Err(e) => {
                shared.queue.close();
                shared.discard_pending(|| Error::NotRunning);
                return Err(Error::Spawn(e));
            }
        };

        life.worker = Some(handle);
        life.span = span;
        life.transition(LoopState::Running);
        drop(life);
        shared.lifecycle_changed.notify_all();

        ready_rx
            .recv()
            .map_err(|_| Error::Other("worker thread exited before it was ready".to_string()))?;

        info!(
            loop_id = %shared.id,
            thread = %shared.config.thread_name,
            "dispatch loop started"
        );
        Ok(())
    }

    /// Signal termination and wait for the worker to exit. Pending items are
    /// discarded; their results resolve with [`Error::Stopped`].
    ///
    /// Called from the worker thread itself, this only signals: the worker
    /// exits once the current callback returns.
    pub fn stop(&self) -> Result<()> {
        let shared = &self.shared;
        let worker = {
            let mut life = shared.lifecycle.lock();
            match life.state {
                LoopState::Stopped => return Ok(()),
                LoopState::Terminating => {
                    if !shared.is_worker_thread() {
                        while life.state == LoopState::Terminating {
                            shared.lifecycle_changed.wait(&mut life);
                        }
                    }
                    return Ok(());
                }
                LoopState::Running => {}
            }

            life.transition(LoopState::Terminating);
            shared.queue.close();

            if shared.is_worker_thread() {
                debug!(loop_id = %shared.id, "stop requested on worker thread");
                return Ok(());
            }
            life.worker.take()
        };

        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!(loop_id = %shared.id, "worker thread panicked");
            }
        }

        if shared.state() == LoopState::Terminating {
            shared.finish();
        }
        Ok(())
    }

    /// Stop for good. A disposed loop cannot be started again.
    pub fn dispose(&self) -> Result<()> {
        self.shared.lifecycle.lock().disposed = true;
        self.stop()
    }

    /// Register an observer for failures that have no caller to go to.
    pub fn subscribe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&UnhandledFailure) + Send + Sync + 'static,
    {
        self.shared.observers.subscribe(observer)
    }

    /// Returns `false` if `id` was not registered.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.shared.observers.unsubscribe(id)
    }

    pub fn observer_count(&self) -> usize {
        self.shared.observers.len()
    }

    // -- post ---------------------------------------------------------------

    /// Fire-and-forget. A panic is reported to the observers.
    pub fn post<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_after(Duration::ZERO, callback)
    }

    pub fn post_after<F>(&self, delay: Duration, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.try_post_after(delay, move || {
            callback();
            Ok::<(), String>(())
        })
    }

    /// Fire-and-forget for fallible work. An `Err` is reported to the
    /// observers like a panic.
    pub fn try_post<F, E>(&self, callback: F) -> Result<()>
    where
        F: FnOnce() -> std::result::Result<(), E> + Send + 'static,
        E: std::fmt::Display,
    {
        self.try_post_after(Duration::ZERO, callback)
    }

    pub fn try_post_after<F, E>(&self, delay: Duration, callback: F) -> Result<()>
    where
        F: FnOnce() -> std::result::Result<(), E> + Send + 'static,
        E: std::fmt::Display,
    {
        let work = Box::new(Posted::new(move || callback().map_err(|e| e.to_string())));
        self.shared
            .submit(SubmitKind::Post, delay, work)
            .map_err(|refused| refused.reason)
    }

    // -- send ---------------------------------------------------------------

    /// Run `callback` on the loop and block until it returns.
    ///
    /// On the worker thread itself the callback runs inline, ahead of
    /// anything queued.
    pub fn send<F, T>(&self, callback: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.send_after(Duration::ZERO, callback)
    }

    /// Like [`send`](Self::send), but not before `delay` has elapsed.
    pub fn send_after<F, T>(&self, delay: Duration, callback: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.shared.is_worker_thread() {
            // Waiting on our own queue would never return.
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            trace!(loop_id = %self.shared.id, "reentrant send executed inline");
            return catch_unwind(AssertUnwindSafe(callback)).map_err(Error::from_panic);
        }

        let (sink, pending) = sink::channel();
        let work = Box::new(Sent::new(callback, sink));
        if let Err(refused) = self.shared.submit(SubmitKind::Send, delay, work) {
            return Err(refused.reason);
        }
        pending.wait()
    }

    // -- send_async ---------------------------------------------------------

    /// Run `callback` on the loop without blocking. The outcome is handed
    /// back through the caller's resumption context: this loop when called
    /// from its worker, the default executor otherwise.
    pub fn send_async<F, T>(&self, callback: F) -> Pending<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.send_async_after(Duration::ZERO, callback)
    }

    pub fn send_async_after<F, T>(&self, delay: Duration, callback: F) -> Pending<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.send_async_with(self.capture(), delay, callback)
    }

    /// [`send_async`](Self::send_async) with an explicit resumption context.
    pub fn send_async_with<F, T>(
        &self,
        resume: Arc<dyn Executor>,
        delay: Duration,
        callback: F,
    ) -> Pending<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (sink, pending) = sink::channel();
        let work = Box::new(Resumed::new(callback, sink, resume));
        self.enqueue_or_abandon(SubmitKind::SendAsync, delay, work);
        pending
    }

    // -- spawn --------------------------------------------------------------

    /// Run an asynchronous callback on the loop. The future is created and
    /// polled only on the worker thread.
    pub fn spawn<F, Fut, T>(&self, callback: F) -> Pending<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_after(Duration::ZERO, callback)
    }

    pub fn spawn_after<F, Fut, T>(&self, delay: Duration, callback: F) -> Pending<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_with(self.capture(), delay, callback)
    }

    /// [`spawn`](Self::spawn) with an explicit resumption context.
    pub fn spawn_with<F, Fut, T>(
        &self,
        resume: Arc<dyn Executor>,
        delay: Duration,
        callback: F,
    ) -> Pending<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (sink, pending) = sink::channel();
        let work = Box::new(SpawnFuture::new(callback, sink, resume));
        self.enqueue_or_abandon(SubmitKind::Spawn, delay, work);
        pending
    }

    /// The resumption context of the calling thread.
    pub fn capture(&self) -> Arc<dyn Executor> {
        if self.shared.is_worker_thread() {
            Arc::new(self.clone())
        } else {
            Arc::clone(&self.shared.default_executor)
        }
    }

    fn enqueue_or_abandon(&self, kind: SubmitKind, delay: Duration, work: Box<dyn Work>) {
        if let Err(refused) = self.shared.submit(kind, delay, work) {
            refused.work.abandon(&self.shared, refused.reason);
        }
    }
}

impl Executor for LoopHandle {
    fn execute(&self, job: Job) -> std::result::Result<(), Rejected> {
        let work = Box::new(Continuation::new(job));
        self.shared
            .resubmit(SubmitKind::Post, work)
            .map_err(|refused| Rejected {
                job: refused.work.into_continuation(),
                reason: refused.reason,
            })
    }

    fn label(&self) -> &'static str {
        "dispatch-loop"
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("pending", &self.pending_len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Owning loop
// ---------------------------------------------------------------------------

/// A thread-affine dispatch loop. Disposed when dropped.
///
/// Dereferences to [`LoopHandle`] for the submission API.
#[derive(Debug)]
pub struct DispatchLoop {
    handle: LoopHandle,
}

impl DispatchLoop {
    /// A stopped loop with default configuration.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn with_config(config: LoopConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> DispatchLoopBuilder {
        DispatchLoopBuilder::default()
    }

    /// A handle that outlives borrows of this loop.
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }
}

impl Default for DispatchLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for DispatchLoop {
    type Target = LoopHandle;

    fn deref(&self) -> &LoopHandle {
        &self.handle
    }
}

impl Drop for DispatchLoop {
    fn drop(&mut self) {
        if let Err(e) = self.handle.dispose() {
            warn!(loop_id = %self.handle.id(), "dispose on drop failed: {e}");
        }
    }
}

/// Builder for [`DispatchLoop`].
#[derive(Default)]
pub struct DispatchLoopBuilder {
    config: LoopConfig,
    clock: Option<Arc<dyn Clock>>,
    default_executor: Option<Arc<dyn Executor>>,
}

impl DispatchLoopBuilder {
    pub fn config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    pub fn max_pending(mut self, max: usize) -> Self {
        self.config.max_pending = Some(max);
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.config.stack_size = Some(bytes);
        self
    }

    /// Time source for due instants. Must track [`std::time::Instant`],
    /// since the worker parks against real deadlines.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Where `send_async`/`spawn` results go when the caller is not on the
    /// worker thread. Defaults to the current tokio runtime if there is
    /// one, otherwise a [`ThreadExecutor`].
    pub fn default_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.default_executor = Some(executor);
        self
    }

    pub fn build(self) -> DispatchLoop {
        let id = LoopId::new();
        let default_executor = self.default_executor.unwrap_or_else(|| {
            match TokioExecutor::try_current() {
                Some(tokio) => Arc::new(tokio) as Arc<dyn Executor>,
                None => Arc::new(ThreadExecutor::new(format!(
                    "{}-resume",
                    self.config.thread_name
                ))),
            }
        });

        let shared = Shared {
            id,
            queue: ScheduleQueue::new(self.config.max_pending),
            clock: self
                .clock
                .unwrap_or_else(|| Arc::new(MonotonicClock)),
            metrics: DispatchMetrics::new(),
            observers: Observers::new(id),
            default_executor,
            owner: RwLock::new(None),
            lifecycle: Mutex::new(Lifecycle {
                state: LoopState::Stopped,
                worker: None,
                disposed: false,
                span: Span::none(),
            }),
            lifecycle_changed: Condvar::new(),
            tasks: Mutex::new(HashMap::new()),
            next_task_id: AtomicU64::new(0),
            config: self.config,
        };

        debug!(loop_id = %id, executor = shared.default_executor.label(), "dispatch loop created");

        DispatchLoop {
            handle: LoopHandle {
                shared: Arc::new(shared),
            },
        }
    }

    /// Build and start in one step.
    pub fn start(self) -> Result<DispatchLoop> {
        let dispatch = self.build();
        dispatch.start()?;
        Ok(dispatch)
    }
}
