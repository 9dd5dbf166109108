use std::time::Duration;

use log::debug;

use crate::{
    clock::{Clock, MonotonicClock},
    error::{Error, LoopError},
    reactor::{
        epoll::{Epoll, MAX_NUM_EVENTS},
        Poller,
    },
};

use super::EventLoop;

/// Environment variable that turns on debug mode.
pub const DEBUG_ENV: &str = "TINYLOOP_DEBUG";

/// Slow-callback threshold used in debug mode.
pub const DEFAULT_SLOW_CALLBACK: Duration = Duration::from_millis(100);

/// Configures and creates an [EventLoop].
///
/// By default the loop uses a [MonotonicClock] and an epoll poller that
/// collects up to 512 events per wait. Setting `TINYLOOP_DEBUG` to anything
/// but `0` makes the loop warn about callbacks that run for longer than
/// 100 ms.
pub struct Builder {
    clock: Option<Box<dyn Clock>>,
    poller: Option<Box<dyn Poller>>,
    max_events: usize,
    slow_callback: Option<Duration>,
}

impl Builder {
    pub fn new() -> Self {
        let debug = std::env::var(DEBUG_ENV).is_ok_and(|v| !v.is_empty() && v != "0");

        Self {
            clock: None,
            poller: None,
            max_events: MAX_NUM_EVENTS,
            slow_callback: debug.then_some(DEFAULT_SLOW_CALLBACK),
        }
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Box::new(clock));
        self
    }

    /// Use `poller` instead of epoll. [Builder::max_events] is ignored.
    pub fn poller(mut self, poller: impl Poller + 'static) -> Self {
        self.poller = Some(Box::new(poller));
        self
    }

    /// Number of readiness events collected per epoll wait.
    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    /// Warn about callbacks that run for at least `threshold`. `None` turns
    /// the check off.
    pub fn slow_callback_duration(mut self, threshold: Option<Duration>) -> Self {
        self.slow_callback = threshold;
        self
    }

    pub fn build(self) -> Result<EventLoop, Error> {
        let clock: Box<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Box::new(MonotonicClock::new()),
        };

        let poller: Box<dyn Poller> = match self.poller {
            Some(poller) => poller,
            None => Box::new(Epoll::new(self.max_events).map_err(LoopError::Setup)?),
        };

        debug!(
            "creating event loop (slow callback threshold: {:?})",
            self.slow_callback
        );

        Ok(EventLoop::from_parts(clock, poller, self.slow_callback))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
