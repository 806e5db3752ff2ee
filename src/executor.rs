//! Resumption contexts: where a completed result is handed back.
//!
//! A submission captures an [`Executor`] explicitly. The loop never hands a
//! result to the caller from inside its own stack unless the captured
//! executor is [`InlineExecutor`].

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Error;

/// A continuation to run on some executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A job an executor could not accept.
///
/// `job` is handed back when the executor still owns it, so the caller can
/// run it elsewhere.
pub struct Rejected {
    pub job: Option<Job>,
    pub reason: Error,
}

impl std::fmt::Debug for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rejected")
            .field("job_returned", &self.job.is_some())
            .field("reason", &self.reason)
            .finish()
    }
}

/// Runs continuations on behalf of the dispatch loop.
pub trait Executor: Send + Sync {
    /// Schedule `job`. Must not block on the job's completion.
    fn execute(&self, job: Job) -> Result<(), Rejected>;

    /// Short label used in logs.
    fn label(&self) -> &'static str {
        "executor"
    }
}

/// Runs every job immediately on the calling thread.
///
/// Deterministic stand-in for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, job: Job) -> Result<(), Rejected> {
        job();
        Ok(())
    }

    fn label(&self) -> &'static str {
        "inline"
    }
}

/// Runs each job on its own short-lived named thread.
#[derive(Debug)]
pub struct ThreadExecutor {
    name_prefix: String,
    counter: AtomicU64,
}

impl ThreadExecutor {
    pub fn new(name_prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for ThreadExecutor {
    fn default() -> Self {
        Self::new("dispatch-resume")
    }
}

impl Executor for ThreadExecutor {
    fn execute(&self, job: Job) -> Result<(), Rejected> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        std::thread::Builder::new()
            .name(format!("{}-{n}", self.name_prefix))
            .spawn(job)
            .map(|_| ())
            .map_err(|e| Rejected {
                job: None,
                reason: Error::Spawn(e),
            })
    }

    fn label(&self) -> &'static str {
        "thread"
    }
}

/// Runs jobs on a tokio runtime's blocking pool.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: tokio::runtime::Handle,
}

impl TokioExecutor {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Executor for the runtime the caller is running in, if any.
    pub fn try_current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, job: Job) -> Result<(), Rejected> {
        self.handle.spawn_blocking(job);
        Ok(())
    }

    fn label(&self) -> &'static str {
        "tokio"
    }
}
