//! Scheduling queue shared between submitters and the worker thread.
//!
//! Items are ordered by `(due, sequence)`. The sequence number is assigned
//! under the queue lock, so two items with the same due instant run in the
//! order their `enqueue` calls took the lock.
//!
//! Every mutation bumps an epoch counter and signals the condition variable.
//! The worker peeks, remembers the epoch it saw, and parks only while the
//! epoch is unchanged, so an enqueue that races with the peek is never lost.

use std::collections::BTreeMap;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::error::Error;

/// Ordering key of a pending item. Derived `Ord` compares `due` first,
/// then `sequence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemKey {
    pub due: Instant,
    pub sequence: u64,
}

/// A pending unit of work together with its ordering key.
#[derive(Debug)]
pub struct WorkItem<W> {
    pub key: ItemKey,
    pub work: W,
}

/// An enqueue the queue refused. The payload is handed back so the caller
/// can fail any result sink attached to it.
#[derive(Debug)]
pub struct Refused<W> {
    pub work: W,
    pub reason: Error,
}

/// What the worker saw when it looked at the head of the queue.
#[derive(Debug, Clone, Copy)]
pub struct Peek {
    pub head: Option<ItemKey>,
    pub epoch: u64,
    pub closed: bool,
}

struct QueueInner<W> {
    pending: BTreeMap<ItemKey, W>,
    next_sequence: u64,
    epoch: u64,
    closed: bool,
}

/// Priority queue of pending work with a "something changed" signal.
pub struct ScheduleQueue<W> {
    inner: Mutex<QueueInner<W>>,
    changed: Condvar,
    capacity: Option<usize>,
}

impl<W> ScheduleQueue<W> {
    /// Create a closed queue. Nothing is accepted until [`open`](Self::open).
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                pending: BTreeMap::new(),
                next_sequence: 0,
                epoch: 0,
                closed: true,
            }),
            changed: Condvar::new(),
            capacity,
        }
    }

    /// Insert work due at `due`. Wakes the worker on success.
    pub fn enqueue(&self, due: Instant, work: W) -> Result<ItemKey, Refused<W>> {
        self.insert(due, work, true)
    }

    /// Insert work that continues something already accepted (a re-poll, a
    /// result delivery). Only a closed queue refuses it; the capacity bound
    /// does not apply.
    pub fn enqueue_unbounded(&self, due: Instant, work: W) -> Result<ItemKey, Refused<W>> {
        self.insert(due, work, false)
    }

    fn insert(&self, due: Instant, work: W, bounded: bool) -> Result<ItemKey, Refused<W>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Refused {
                work,
                reason: Error::NotRunning,
            });
        }
        let full = self
            .capacity
            .filter(|&c| bounded && inner.pending.len() >= c);
        if let Some(capacity) = full {
            return Err(Refused {
                work,
                reason: Error::QueueFull { capacity },
            });
        }

        let key = ItemKey {
            due,
            sequence: inner.next_sequence,
        };
        inner.next_sequence += 1;
        inner.pending.insert(key, work);
        inner.epoch += 1;
        drop(inner);

        self.changed.notify_all();
        Ok(key)
    }

    /// Look at the earliest item without removing it.
    pub fn next_due(&self) -> Peek {
        let inner = self.inner.lock();
        Peek {
            head: inner.pending.keys().next().copied(),
            epoch: inner.epoch,
            closed: inner.closed,
        }
    }

    /// Remove exactly the item identified by `key`, if it is still pending.
    pub fn remove(&self, key: ItemKey) -> Option<WorkItem<W>> {
        let mut inner = self.inner.lock();
        let work = inner.pending.remove(&key)?;
        inner.epoch += 1;
        Some(WorkItem { key, work })
    }

    /// Park until the queue changes after `seen_epoch`, the queue is closed,
    /// or `deadline` passes. Returns immediately if any already happened.
    pub fn wait_for_change(&self, seen_epoch: u64, deadline: Option<Instant>) {
        let mut inner = self.inner.lock();
        while inner.epoch == seen_epoch && !inner.closed {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut inner, deadline).timed_out() {
                        return;
                    }
                }
                None => self.changed.wait(&mut inner),
            }
        }
    }

    /// Start accepting submissions.
    pub fn open(&self) {
        let mut inner = self.inner.lock();
        inner.closed = false;
        inner.epoch += 1;
    }

    /// Stop accepting submissions and wake any parked worker.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.epoch += 1;
        drop(inner);
        self.changed.notify_all();
    }

    /// Take every pending item, earliest first.
    pub fn drain(&self) -> Vec<WorkItem<W>> {
        let mut inner = self.inner.lock();
        let pending = std::mem::take(&mut inner.pending);
        inner.epoch += 1;
        pending
            .into_iter()
            .map(|(key, work)| WorkItem { key, work })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }
}
