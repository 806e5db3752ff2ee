//! Integration tests for non-blocking submissions: `send_async`, `spawn`
//! and the resumption contexts their results come back through.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, mpsc};
use std::task::{Context, Poll};
use std::thread;
use std::time::Duration;

use dispatch_loop::executor::{Job, Rejected};
use dispatch_loop::{DispatchLoop, Error, Executor, FailureOrigin, InlineExecutor};
use parking_lot::Mutex;

fn started_loop() -> DispatchLoop {
    DispatchLoop::builder()
        .thread_name("async-test")
        .start()
        .expect("failed to start dispatch loop")
}

/// A running loop with `max_pending(1)` whose worker is blocked and whose
/// single queue slot is taken. Sending on the returned channel unblocks it.
fn full_loop() -> (DispatchLoop, mpsc::Sender<()>) {
    let dispatch = DispatchLoop::builder()
        .thread_name("async-bounded")
        .max_pending(1)
        .start()
        .expect("failed to start dispatch loop");

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (running_tx, running_rx) = mpsc::channel::<()>();
    dispatch
        .post(move || {
            running_tx.send(()).unwrap();
            let _ = release_rx.recv();
        })
        .unwrap();
    running_rx.recv().unwrap();

    dispatch.post(|| {}).unwrap();
    assert!(matches!(
        dispatch.post(|| {}),
        Err(Error::QueueFull { capacity: 1 })
    ));
    (dispatch, release_tx)
}

fn thread_name() -> Option<String> {
    thread::current().name().map(str::to_string)
}

/// Returns `Pending` once, waking itself, then completes.
struct YieldOnce(bool);

impl Future for YieldOnce {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.0 {
            return Poll::Ready(());
        }
        self.0 = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Runs jobs inline and remembers which thread ran them.
#[derive(Default)]
struct RecordingExecutor {
    threads: Mutex<Vec<Option<String>>>,
}

impl Executor for RecordingExecutor {
    fn execute(&self, job: Job) -> Result<(), Rejected> {
        self.threads.lock().push(thread_name());
        job();
        Ok(())
    }
}

/// Refuses every job but hands it back.
struct RefusingExecutor;

impl Executor for RefusingExecutor {
    fn execute(&self, job: Job) -> Result<(), Rejected> {
        Err(Rejected {
            job: Some(job),
            reason: Error::Rejected("executor is shut down".to_string()),
        })
    }

    fn label(&self) -> &'static str {
        "refusing"
    }
}

// ---------------------------------------------------------------------------
// send_async
// ---------------------------------------------------------------------------

#[tokio::test]
async fn send_async_resolves_from_outside_the_loop() {
    let dispatch = started_loop();
    let (value, ran_on) = dispatch
        .send_async(|| (6 * 7, thread_name()))
        .await
        .unwrap();
    assert_eq!(value, 42);
    assert_eq!(ran_on.as_deref(), Some("async-test"));
}

#[tokio::test]
async fn send_async_surfaces_a_panic_as_an_error() {
    let dispatch = started_loop();
    let failures = Arc::new(Mutex::new(0usize));
    let counter = failures.clone();
    dispatch.subscribe(move |_| *counter.lock() += 1);

    let result: dispatch_loop::Result<u32> = dispatch.send_async(|| panic!("async boom")).await;
    match result {
        Err(Error::Panicked(message)) => assert!(message.contains("async boom")),
        other => panic!("expected a panic error, got {other:?}"),
    }

    // Delivered to the caller, so nothing is unhandled.
    dispatch.send(|| ()).unwrap();
    assert_eq!(*failures.lock(), 0);
}

#[test]
fn send_async_without_a_runtime_blocks_with_wait() {
    let dispatch = started_loop();
    let pending = dispatch.send_async(|| "done");
    assert_eq!(pending.wait().unwrap(), "done");
}

#[test]
fn explicit_executor_receives_the_result() {
    let dispatch = started_loop();
    let recorder = Arc::new(RecordingExecutor::default());

    let pending = dispatch.send_async_with(recorder.clone(), Duration::ZERO, || 3);
    assert_eq!(pending.wait().unwrap(), 3);

    let threads = recorder.threads.lock();
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].as_deref(), Some("async-test"));
}

#[test]
fn inline_executor_completes_on_the_worker() {
    let dispatch = started_loop();
    let pending = dispatch.send_async_with(Arc::new(InlineExecutor), Duration::ZERO, || 11);
    assert_eq!(pending.wait().unwrap(), 11);
}

#[test]
fn delayed_send_async_waits_for_its_due_time() {
    let dispatch = started_loop();
    let started = std::time::Instant::now();
    let pending = dispatch.send_async_after(Duration::from_millis(40), || ());
    pending.wait().unwrap();
    assert!(started.elapsed() >= Duration::from_millis(40));
}

#[test]
fn capture_on_the_worker_is_the_loop_itself() {
    let dispatch = started_loop();
    let handle = dispatch.handle();
    let label = dispatch.send(move || handle.capture().label()).unwrap();
    assert_eq!(label, "dispatch-loop");
    assert_ne!(dispatch.capture().label(), "dispatch-loop");
}

#[test]
fn send_async_from_the_worker_resumes_on_the_loop() {
    let dispatch = started_loop();
    let handle = dispatch.handle();
    let observed = Arc::new(Mutex::new(None));
    let sink = observed.clone();

    dispatch
        .post(move || {
            let inner = handle.clone();
            let pending = handle.send_async(|| 9);
            // Resolved by a continuation queued on this same loop.
            handle
                .post(move || {
                    inner
                        .post(move || {
                            let mut pending = pending;
                            *sink.lock() = pending.try_take().map(|r| r.ok());
                        })
                        .unwrap();
                })
                .unwrap();
        })
        .unwrap();

    // Four hops on the loop: the callback, its continuation, two posts.
    for _ in 0..4 {
        dispatch.send(|| ()).unwrap();
    }
    assert_eq!(*observed.lock(), Some(Some(9)));
}

#[test]
fn send_async_on_a_stopped_loop_resolves_with_not_running() {
    let dispatch = DispatchLoop::new();
    let pending = dispatch.send_async(|| 1);
    assert!(matches!(pending.wait(), Err(Error::NotRunning)));
}

#[test]
fn stop_resolves_queued_send_async_with_stopped() {
    let dispatch = started_loop();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (running_tx, running_rx) = mpsc::channel::<()>();
    dispatch
        .post(move || {
            running_tx.send(()).unwrap();
            let _ = release_rx.recv();
        })
        .unwrap();
    running_rx.recv().unwrap();

    let pending = dispatch.send_async(|| 1);
    let handle = dispatch.handle();
    let stopper = thread::spawn(move || handle.stop());
    while dispatch.state() != dispatch_loop::LoopState::Terminating {
        thread::sleep(Duration::from_millis(1));
    }
    release_tx.send(()).unwrap();
    stopper.join().unwrap().unwrap();

    assert!(matches!(pending.wait(), Err(Error::Stopped)));
}

#[test]
fn rejected_delivery_is_reported_and_still_resolves() {
    let dispatch = started_loop();
    let reports = Arc::new(Mutex::new(Vec::new()));
    let seen = reports.clone();
    dispatch.subscribe(move |failure| seen.lock().push((failure.origin, failure.message.clone())));

    let pending = dispatch.send_async_with(Arc::new(RefusingExecutor), Duration::ZERO, || 5);
    assert_eq!(pending.wait().unwrap(), 5);

    let reports = reports.lock();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, FailureOrigin::Delivery);
    assert!(reports[0].1.contains("refusing"));
}

#[test]
fn stopping_before_a_loop_continuation_runs_still_delivers_the_value() {
    let dispatch = started_loop();
    let handle = dispatch.handle();

    let pending = dispatch
        .send(move || {
            // Resumes on the loop: its continuation lands behind the stop.
            let pending = handle.send_async(|| 9);
            let stopper = handle.clone();
            handle.post(move || stopper.stop().unwrap()).unwrap();
            pending
        })
        .unwrap();

    assert_eq!(pending.wait().unwrap(), 9);
}

#[test]
fn loop_executor_accepts_continuations_when_the_queue_is_full() {
    let (dispatch, release) = full_loop();
    let resume: Arc<dyn Executor> = Arc::new(dispatch.handle());

    let (tx, rx) = mpsc::channel();
    resume
        .execute(Box::new(move || tx.send(thread_name()).unwrap()))
        .unwrap();
    release.send(()).unwrap();

    assert_eq!(rx.recv().unwrap().as_deref(), Some("async-bounded"));
}

#[test]
fn dropped_reader_does_not_produce_a_failure() {
    let dispatch = started_loop();
    let failures = Arc::new(Mutex::new(0usize));
    let counter = failures.clone();
    dispatch.subscribe(move |_| *counter.lock() += 1);

    drop(dispatch.send_async(|| 1));
    dispatch.send(|| ()).unwrap();
    assert_eq!(*failures.lock(), 0);
}

// ---------------------------------------------------------------------------
// spawn
// ---------------------------------------------------------------------------

#[tokio::test]
async fn spawned_future_is_polled_only_on_the_worker() {
    let dispatch = started_loop();
    let (tx, rx) = tokio::sync::oneshot::channel::<u32>();

    let pending = dispatch.spawn(move || async move {
        let before = thread_name();
        let value = rx.await.unwrap_or(0);
        (value, before, thread_name())
    });

    // Wake the future from a thread that is not the worker.
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        let _ = tx.send(17);
    });

    let (value, before, after) = pending.await.unwrap();
    assert_eq!(value, 17);
    assert_eq!(before.as_deref(), Some("async-test"));
    assert_eq!(after.as_deref(), Some("async-test"));
}

#[test]
fn spawned_future_interleaves_with_other_items() {
    let dispatch = started_loop();
    let handle = dispatch.handle();
    let order = Arc::new(Mutex::new(Vec::new()));
    let log = order.clone();

    let pending = dispatch
        .send(move || {
            let first = log.clone();
            let pending = handle.spawn(move || async move {
                first.lock().push("a");
                YieldOnce(false).await;
                first.lock().push("c");
            });
            let second = log.clone();
            handle.post(move || second.lock().push("b")).unwrap();
            pending
        })
        .unwrap();

    pending.wait().unwrap();
    assert_eq!(*order.lock(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn spawned_panic_resolves_with_an_error() {
    let dispatch = started_loop();
    let result: dispatch_loop::Result<()> = dispatch
        .spawn(|| async {
            YieldOnce(false).await;
            panic!("future boom");
        })
        .await;
    assert!(matches!(result, Err(Error::Panicked(m)) if m.contains("future boom")));

    // The loop keeps running.
    assert_eq!(dispatch.send(|| 2).unwrap(), 2);
}

#[test]
fn woken_future_is_not_refused_by_a_full_queue() {
    let dispatch = DispatchLoop::builder()
        .thread_name("async-bounded")
        .max_pending(1)
        .start()
        .unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<u32>();
    let (parked_tx, parked_rx) = mpsc::channel::<()>();

    let pending = dispatch.spawn(move || async move {
        let _ = parked_tx.send(());
        rx.await.unwrap_or(0)
    });
    parked_rx.recv().unwrap();
    // The first poll has returned Pending once this runs.
    dispatch.send(|| ()).unwrap();

    let (queued, release) = {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (running_tx, running_rx) = mpsc::channel::<()>();
        dispatch
            .post(move || {
                running_tx.send(()).unwrap();
                let _ = release_rx.recv();
            })
            .unwrap();
        running_rx.recv().unwrap();
        dispatch.post(|| {}).unwrap();
        (dispatch.pending_len(), release_tx)
    };
    assert_eq!(queued, 1);

    tx.send(5).unwrap();
    release.send(()).unwrap();
    assert_eq!(pending.wait().unwrap(), 5);
}

#[test]
fn spawn_on_a_stopped_loop_resolves_with_not_running() {
    let dispatch = started_loop();
    dispatch.stop().unwrap();
    let pending = dispatch.spawn(|| async { 1 });
    assert!(matches!(pending.wait(), Err(Error::NotRunning)));
}

#[test]
fn stop_resolves_a_parked_future_with_stopped() {
    let dispatch = started_loop();
    let (tx, rx) = tokio::sync::oneshot::channel::<u32>();
    let (parked_tx, parked_rx) = mpsc::channel::<()>();

    let pending = dispatch.spawn(move || async move {
        let _ = parked_tx.send(());
        rx.await.unwrap_or(0)
    });
    parked_rx.recv().unwrap();
    // Let the first poll return Pending.
    dispatch.send(|| ()).unwrap();

    dispatch.stop().unwrap();
    assert!(matches!(pending.wait(), Err(Error::Stopped)));
    drop(tx);
}
