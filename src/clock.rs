//! Time sources.
//!
//! The event loop never reads the system clock directly. Deadlines are
//! expressed as a [Duration] since the clock's origin, which lets tests drive
//! the loop with a [ManualClock] and finish multi-second schedules instantly.
use std::{
    cell::Cell,
    rc::Rc,
    time::{Duration, Instant},
};

/// A monotonic time source.
pub trait Clock {
    /// Time elapsed since this clock's origin. Must never go backwards.
    fn now(&self) -> Duration;
}

/// Wall-clock monotonic time, measured from the moment the clock was created.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// A virtual clock that only moves when told to.
///
/// Clones share the same time, so a test can hold one copy while the event
/// loop (and a [crate::reactor::manual::ManualPoller]) hold others.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward by `d`.
    pub fn advance(&self, d: Duration) {
        self.now.set(self.now.get().saturating_add(d));
    }

    /// Jump to `t`. Attempts to move backwards are ignored.
    pub fn set(&self, t: Duration) {
        if t > self.now.get() {
            self.now.set(t);
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.get()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Clock, ManualClock};

    #[test]
    fn manual_clock_is_shared_and_monotonic() {
        let clock = ManualClock::new();
        let other = clock.clone();

        clock.advance(Duration::from_secs(2));
        assert_eq!(other.now(), Duration::from_secs(2));

        other.set(Duration::from_secs(1));
        assert_eq!(clock.now(), Duration::from_secs(2));

        other.set(Duration::from_secs(5));
        assert_eq!(clock.now(), Duration::from_secs(5));
    }
}
