//! A poller for virtual time.
//!
//! [ManualPoller] never blocks. When asked to wait it reports whatever
//! readiness a test injected through an [Injector]; if nothing was injected it
//! advances its [ManualClock] by the requested timeout, which is exactly the
//! point at which the earliest timer becomes due.
use std::{
    cell::RefCell,
    collections::BTreeMap,
    io::{self, ErrorKind},
    os::fd::RawFd,
    rc::Rc,
    time::Duration,
};

use super::{Event, Poller, Readiness};
use crate::clock::ManualClock;

/// Handle for injecting readiness into a [ManualPoller].
#[derive(Clone, Default)]
pub struct Injector {
    pending: Rc<RefCell<Vec<Event>>>,
}

impl Injector {
    /// Report `fd` as ready on the poller's next wait.
    pub fn ready(&self, fd: RawFd, readiness: Readiness) {
        self.pending.borrow_mut().push(Event { fd, readiness });
    }
}

pub struct ManualPoller {
    clock: ManualClock,
    interests: BTreeMap<RawFd, Readiness>,
    injector: Injector,
}

impl ManualPoller {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            interests: BTreeMap::new(),
            injector: Injector::default(),
        }
    }

    pub fn injector(&self) -> Injector {
        self.injector.clone()
    }
}

impl Poller for ManualPoller {
    fn add(&mut self, fd: RawFd, interest: Readiness) -> io::Result<()> {
        if self.interests.contains_key(&fd) {
            return Err(ErrorKind::AlreadyExists.into());
        }

        self.interests.insert(fd, interest);

        Ok(())
    }

    fn modify(&mut self, fd: RawFd, interest: Readiness) -> io::Result<()> {
        match self.interests.get_mut(&fd) {
            Some(mask) => {
                *mask = interest;
                Ok(())
            }
            None => Err(ErrorKind::NotFound.into()),
        }
    }

    fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        self.interests
            .remove(&fd)
            .map(|_| ())
            .ok_or_else(|| ErrorKind::NotFound.into())
    }

    fn wait(&mut self, timeout: Option<Duration>, events: &mut Vec<Event>) -> io::Result<()> {
        let injected = std::mem::take(&mut *self.injector.pending.borrow_mut());

        if !injected.is_empty() {
            events.extend(injected.into_iter().filter_map(|e| {
                let mask = self.interests.get(&e.fd)?;
                let readiness = Readiness {
                    readable: e.readiness.readable && mask.readable,
                    writable: e.readiness.writable && mask.writable,
                };

                (!readiness.is_empty()).then_some(Event { fd: e.fd, readiness })
            }));

            return Ok(());
        }

        match timeout {
            Some(d) => {
                self.clock.advance(d);
                Ok(())
            }
            None => Err(io::Error::new(
                ErrorKind::WouldBlock,
                "virtual poller asked to wait forever with nothing injected",
            )),
        }
    }
}
