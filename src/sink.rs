//! Single-assignment result slot between the loop and one submitter.
//!
//! The writer half ([`ResultSink`]) is consumed by completing it, so a value
//! or a failure is set at most once. Dropping it unset resolves the reader
//! with [`Error::Abandoned`]; a reader can never wait on a writer that is
//! gone. The reader half ([`Pending`]) can block or be awaited.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

struct SlotState<T> {
    result: Option<Result<T>>,
    completed: bool,
    waker: Option<Waker>,
    reader_gone: bool,
}

struct Slot<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,
}

impl<T> Slot<T> {
    fn set(&self, result: Result<T>) -> bool {
        let mut state = self.state.lock();
        if state.completed {
            return false;
        }
        state.result = Some(result);
        state.completed = true;
        let waker = state.waker.take();
        let delivered = !state.reader_gone;
        drop(state);

        self.ready.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
        delivered
    }
}

/// Create a connected writer/reader pair.
pub fn channel<T>() -> (ResultSink<T>, Pending<T>) {
    let slot = Arc::new(Slot {
        state: Mutex::new(SlotState {
            result: None,
            completed: false,
            waker: None,
            reader_gone: false,
        }),
        ready: Condvar::new(),
    });
    (
        ResultSink {
            slot: Some(Arc::clone(&slot)),
        },
        Pending { slot },
    )
}

/// Writer half: completed exactly once by the dispatch loop.
pub struct ResultSink<T> {
    slot: Option<Arc<Slot<T>>>,
}

impl<T> ResultSink<T> {
    /// Set the outcome. Returns `false` when the reader was already dropped
    /// and nobody will observe it.
    pub fn complete(mut self, result: Result<T>) -> bool {
        match self.slot.take() {
            Some(slot) => slot.set(result),
            None => false,
        }
    }

    pub fn succeed(self, value: T) -> bool {
        self.complete(Ok(value))
    }

    pub fn fail(self, error: Error) -> bool {
        self.complete(Err(error))
    }

    /// Whether the reader half has been dropped.
    pub fn is_reader_gone(&self) -> bool {
        self.slot
            .as_ref()
            .is_none_or(|slot| slot.state.lock().reader_gone)
    }
}

impl<T> Drop for ResultSink<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.set(Err(Error::Abandoned));
        }
    }
}

impl<T> std::fmt::Debug for ResultSink<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSink")
            .field("completed", &self.slot.is_none())
            .finish()
    }
}

/// Reader half: the eventual outcome of a `send_async` or `spawn`.
///
/// Implements [`Future`]; outside async code use [`Pending::wait`].
#[must_use = "a Pending result does nothing unless waited on or awaited"]
pub struct Pending<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Pending<T> {
    /// A pending result that is already resolved.
    pub fn ready(result: Result<T>) -> Self {
        let (sink, pending) = channel();
        sink.complete(result);
        pending
    }

    /// Block the calling thread until the outcome is set.
    pub fn wait(self) -> Result<T> {
        let mut state = self.slot.state.lock();
        while !state.completed {
            self.slot.ready.wait(&mut state);
        }
        state.result.take().unwrap_or(Err(Error::Abandoned))
    }

    /// Block for at most `timeout`. Returns `None` if the outcome is not set
    /// by then; the handle stays usable.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Result<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.slot.state.lock();
        while !state.completed {
            if self.slot.ready.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        if state.completed {
            Some(state.result.take().unwrap_or(Err(Error::Abandoned)))
        } else {
            None
        }
    }

    /// Take the outcome if it has been set.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        let mut state = self.slot.state.lock();
        if state.completed {
            Some(state.result.take().unwrap_or(Err(Error::Abandoned)))
        } else {
            None
        }
    }

    pub fn is_complete(&self) -> bool {
        self.slot.state.lock().completed
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.slot.state.lock();
        if state.completed {
            return Poll::Ready(state.result.take().unwrap_or(Err(Error::Abandoned)));
        }
        match state.waker {
            Some(ref waker) if waker.will_wake(cx.waker()) => {}
            _ => state.waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }
}

impl<T> Drop for Pending<T> {
    fn drop(&mut self) {
        self.slot.state.lock().reader_gone = true;
    }
}

impl<T> std::fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending")
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn value_reaches_blocked_reader() {
        let (sink, pending) = channel();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            sink.succeed(42)
        });
        assert_eq!(pending.wait().unwrap(), 42);
        assert!(writer.join().unwrap());
    }

    #[test]
    fn dropped_sink_resolves_reader_with_abandoned() {
        let (sink, pending) = channel::<u8>();
        drop(sink);
        assert!(matches!(pending.wait(), Err(Error::Abandoned)));
    }

    #[test]
    fn failure_is_delivered() {
        let (sink, pending) = channel::<()>();
        sink.fail(Error::Stopped);
        assert!(matches!(pending.wait(), Err(Error::Stopped)));
    }

    #[test]
    fn completion_reports_missing_reader() {
        let (sink, pending) = channel();
        drop(pending);
        assert!(sink.is_reader_gone());
        assert!(!sink.succeed(1));
    }

    #[test]
    fn wait_timeout_leaves_handle_usable() {
        let (sink, mut pending) = channel();
        assert!(pending.wait_timeout(Duration::from_millis(10)).is_none());
        assert!(!pending.is_complete());
        sink.succeed("done");
        assert_eq!(pending.try_take().unwrap().unwrap(), "done");
    }

    #[test]
    fn ready_is_already_complete() {
        let mut pending = Pending::ready(Ok(5));
        assert!(pending.is_complete());
        assert_eq!(pending.try_take().unwrap().unwrap(), 5);
    }

    #[tokio::test]
    async fn awaiting_resolves_when_written_from_another_thread() {
        let (sink, pending) = channel();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            sink.succeed(String::from("hello"));
        });
        assert_eq!(pending.await.unwrap(), "hello");
    }
}
