//! Unhandled-failure reports and their observers.
//!
//! A report is emitted whenever a failure has no caller to go to: a posted
//! callback that panicked or returned an error, or a result that could not
//! be delivered to its resumption context.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{error, warn};

use crate::error::panic_message;
use crate::model::LoopId;

/// Where an unhandled failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureOrigin {
    /// A submitted callback panicked or returned an error.
    Callback,
    /// A value or failure could not be handed to the submitter's
    /// resumption context.
    Delivery,
}

impl FailureOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Callback => "callback",
            Self::Delivery => "delivery",
        }
    }
}

impl std::fmt::Display for FailureOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure nobody was waiting for.
#[derive(Debug, Clone, Serialize)]
pub struct UnhandledFailure {
    /// Per-loop sequence number. Consumers can detect gaps.
    pub seq: u64,
    pub loop_id: LoopId,
    pub origin: FailureOrigin,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Arc<dyn Fn(&UnhandledFailure) + Send + Sync>;

/// Registered observers for one loop.
pub(crate) struct Observers {
    loop_id: LoopId,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    list: RwLock<Vec<(ObserverId, Observer)>>,
}

impl Observers {
    pub(crate) fn new(loop_id: LoopId) -> Self {
        Self {
            loop_id,
            next_id: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
            list: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&UnhandledFailure) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.list.write().push((id, Arc::new(observer)));
        id
    }

    pub(crate) fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut list = self.list.write();
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        list.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.list.read().len()
    }

    /// Build a report and hand it to every observer registered right now.
    ///
    /// Observers run against a snapshot, outside the lock. A panicking
    /// observer is logged and skipped.
    pub(crate) fn report(&self, origin: FailureOrigin, message: String) -> UnhandledFailure {
        let failure = UnhandledFailure {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            loop_id: self.loop_id,
            origin,
            message,
            timestamp: Utc::now(),
        };

        warn!(
            loop_id = %failure.loop_id,
            origin = %failure.origin,
            seq = failure.seq,
            message = %failure.message,
            "unhandled failure"
        );

        let snapshot: Vec<(ObserverId, Observer)> = self.list.read().clone();
        for (id, observer) in snapshot {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| observer(&failure))) {
                error!(
                    loop_id = %failure.loop_id,
                    observer = id.0,
                    panic = %panic_message(payload.as_ref()),
                    "unhandled-failure observer panicked"
                );
            }
        }

        failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn observers_receive_reports_in_order() {
        let observers = Observers::new(LoopId::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        observers.subscribe(move |f| sink.lock().push((f.seq, f.origin)));

        observers.report(FailureOrigin::Callback, "boom".into());
        observers.report(FailureOrigin::Delivery, "lost".into());

        assert_eq!(
            *seen.lock(),
            vec![(0, FailureOrigin::Callback), (1, FailureOrigin::Delivery)]
        );
    }

    #[test]
    fn panicking_observer_does_not_stop_others() {
        let observers = Observers::new(LoopId::new());
        let hits = Arc::new(AtomicU64::new(0));
        observers.subscribe(|_| panic!("observer exploded"));
        let counter = Arc::clone(&hits);
        observers.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        observers.report(FailureOrigin::Callback, "x".into());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_removes_only_that_observer() {
        let observers = Observers::new(LoopId::new());
        let a = observers.subscribe(|_| {});
        let _b = observers.subscribe(|_| {});
        assert!(observers.unsubscribe(a));
        assert!(!observers.unsubscribe(a));
        assert_eq!(observers.len(), 1);
    }

    #[test]
    fn observer_may_unsubscribe_itself_mid_report() {
        let observers = Arc::new(Observers::new(LoopId::new()));
        let slot: Arc<Mutex<Option<ObserverId>>> = Arc::new(Mutex::new(None));
        let (obs, id_slot) = (Arc::clone(&observers), Arc::clone(&slot));
        let id = observers.subscribe(move |_| {
            if let Some(id) = *id_slot.lock() {
                obs.unsubscribe(id);
            }
        });
        *slot.lock() = Some(id);

        observers.report(FailureOrigin::Callback, "once".into());
        assert_eq!(observers.len(), 0);
    }

    #[test]
    fn report_serializes_with_snake_case_origin() {
        let observers = Observers::new(LoopId::new());
        let failure = observers.report(FailureOrigin::Delivery, "gone".into());
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["origin"], "delivery");
        assert_eq!(json["message"], "gone");
    }
}
