//! Monotonic time source used to order scheduled work.
//!
//! Wall-clock adjustments never move due times: everything is measured
//! from [`std::time::Instant`].

use std::time::{Duration, Instant};

/// Provides timing information for the dispatch loop.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> Instant;

    /// Instant at which work submitted now with `delay` becomes due.
    ///
    /// Saturates instead of panicking on absurdly large delays.
    fn due_after(&self, delay: Duration) -> Instant {
        let now = self.now();
        now.checked_add(delay).unwrap_or_else(|| far_future(now))
    }
}

/// Clock backed by the operating system's monotonic timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

// Roughly 30 years; far enough that nothing meaningful is ever scheduled past it.
fn far_future(now: Instant) -> Instant {
    now + Duration::from_secs(60 * 60 * 24 * 365 * 30)
}
