//! I/O readiness multiplexing.
//!
//! The reactor keeps, for every file descriptor, at most one pending reader
//! callback and one pending writer callback. Registrations are one-shot: once
//! an interest fires its handle is handed back to the event loop and the
//! interest is dropped. A watcher that needs to keep waiting registers again.
//!
//! Waiting itself is delegated to a [Poller], which only knows about file
//! descriptors and readiness masks. [epoll::Epoll] is the production backend;
//! [manual::ManualPoller] reports events injected by a test and advances a
//! virtual clock instead of blocking.
use std::{collections::BTreeMap, io, os::fd::RawFd, time::Duration};

use log::trace;

use crate::{
    error::{Error, LoopError},
    handle::Handle,
};

pub mod epoll;
pub mod manual;

/// The kind of readiness a registration waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

/// A readiness mask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    pub const READABLE: Self = Self {
        readable: true,
        writable: false,
    };

    pub const WRITABLE: Self = Self {
        readable: false,
        writable: true,
    };

    pub fn is_empty(&self) -> bool {
        !self.readable && !self.writable
    }
}

impl From<Interest> for Readiness {
    fn from(value: Interest) -> Self {
        match value {
            Interest::Readable => Self::READABLE,
            Interest::Writable => Self::WRITABLE,
        }
    }
}

/// A readiness notification for a single file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub fd: RawFd,
    pub readiness: Readiness,
}

/// An OS (or simulated) readiness notification facility.
pub trait Poller {
    /// Start watching `fd` for `interest`.
    fn add(&mut self, fd: RawFd, interest: Readiness) -> io::Result<()>;

    /// Change the interest mask of an already watched `fd`.
    fn modify(&mut self, fd: RawFd, interest: Readiness) -> io::Result<()>;

    /// Stop watching `fd`.
    fn delete(&mut self, fd: RawFd) -> io::Result<()>;

    /// Wait up to `timeout` (forever if `None`) for readiness, appending
    /// whatever fired to `events`.
    fn wait(&mut self, timeout: Option<Duration>, events: &mut Vec<Event>) -> io::Result<()>;
}

#[derive(Default)]
struct Registration {
    reader: Option<Handle>,
    writer: Option<Handle>,
}

impl Registration {
    fn slot(&mut self, interest: Interest) -> &mut Option<Handle> {
        match interest {
            Interest::Readable => &mut self.reader,
            Interest::Writable => &mut self.writer,
        }
    }

    fn interest(&self) -> Readiness {
        let live = |h: &Option<Handle>| h.as_ref().is_some_and(|h| !h.cancelled());

        Readiness {
            readable: live(&self.reader),
            writable: live(&self.writer),
        }
    }
}

pub(crate) struct Reactor {
    poller: Box<dyn Poller>,
    registrations: BTreeMap<RawFd, Registration>,
    events: Vec<Event>,
}

impl Reactor {
    pub fn new(poller: Box<dyn Poller>) -> Self {
        Self {
            poller,
            registrations: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    pub fn register(&mut self, fd: RawFd, interest: Interest, handle: Handle) -> Result<(), Error> {
        // Only cancelled handles left: the descriptor may have been closed
        // and its number reused since, so start over with the poller.
        if self
            .registrations
            .get(&fd)
            .is_some_and(|reg| reg.interest().is_empty())
        {
            self.registrations.remove(&fd);

            if let Err(e) = self.poller.delete(fd) {
                trace!("fd {fd}: dropping stale registration: {e}");
            }
        }

        let existing = self.registrations.contains_key(&fd);
        let reg = self.registrations.entry(fd).or_default();
        let slot = reg.slot(interest);

        if slot.as_ref().is_some_and(|h| !h.cancelled()) {
            return Err(Error::InvalidState(
                "file descriptor already has a pending registration for this interest",
            ));
        }

        *slot = Some(handle);
        let mask = reg.interest();

        let res = if existing {
            // The kernel forgets a descriptor once it is closed.
            match self.poller.modify(fd, mask) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => self.poller.add(fd, mask),
                res => res,
            }
        } else {
            self.poller.add(fd, mask)
        };

        if let Err(source) = res {
            self.remove(fd, interest, None);
            return Err(LoopError::Register { fd, source }.into());
        }

        trace!("fd {fd}: waiting for {interest:?}");

        Ok(())
    }

    /// Drop the `interest` registration of `fd`. If `only` is given, the
    /// registration is only removed when it still holds that handle. Returns
    /// whether a registration was removed.
    pub fn remove(&mut self, fd: RawFd, interest: Interest, only: Option<&Handle>) -> bool {
        let Some(reg) = self.registrations.get_mut(&fd) else {
            return false;
        };

        let slot = reg.slot(interest);

        let matches = match (slot.as_ref(), only) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(h), Some(only)) => h.ptr_eq(only),
        };

        if !matches {
            return false;
        }

        if let Some(h) = slot.take() {
            h.cancel();
        }

        self.sync(fd);

        true
    }

    /// Push the current interest mask of `fd` to the poller, forgetting the
    /// descriptor entirely once nothing is waiting on it.
    fn sync(&mut self, fd: RawFd) {
        let Some(reg) = self.registrations.get(&fd) else {
            return;
        };

        let mask = reg.interest();

        let res = if mask.is_empty() {
            self.registrations.remove(&fd);
            self.poller.delete(fd)
        } else {
            self.poller.modify(fd, mask)
        };

        // The descriptor may already be closed, in which case the kernel
        // forgot about it on its own.
        if let Err(e) = res {
            trace!("fd {fd}: failed to update poller: {e}");
        }
    }

    /// Wait for readiness and return the handles of every interest that fired.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<Handle>, LoopError> {
        self.events.clear();
        self.poller
            .wait(timeout, &mut self.events)
            .map_err(LoopError::Poll)?;

        let mut fired = Vec::new();
        let events = std::mem::take(&mut self.events);

        for event in events.iter() {
            let Some(reg) = self.registrations.get_mut(&event.fd) else {
                continue;
            };

            if event.readiness.readable {
                fired.extend(reg.reader.take());
            }

            if event.readiness.writable {
                fired.extend(reg.writer.take());
            }

            self.sync(event.fd);
        }

        self.events = events;

        fired.retain(|h| !h.cancelled());

        Ok(fired)
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.values().all(|r| r.interest().is_empty())
    }

    /// Forget every registration, returning their handles.
    pub fn clear(&mut self) -> Vec<Handle> {
        let registrations = std::mem::take(&mut self.registrations);
        let mut handles = Vec::new();

        for (fd, reg) in registrations {
            if let Err(e) = self.poller.delete(fd) {
                trace!("fd {fd}: failed to delete from poller: {e}");
            }

            handles.extend(reg.reader);
            handles.extend(reg.writer);
        }

        handles
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc, time::Duration};

    use super::{manual::ManualPoller, Interest, Reactor, Readiness};
    use crate::{clock::ManualClock, error::Error, handle::Handle};

    fn recorder(log: &Rc<RefCell<Vec<&'static str>>>, label: &'static str) -> Handle {
        let log = log.clone();
        Handle::new(move || log.borrow_mut().push(label))
    }

    #[test]
    fn interests_are_one_shot() {
        let clock = ManualClock::new();
        let poller = ManualPoller::new(clock.clone());
        let injector = poller.injector();
        let mut reactor = Reactor::new(Box::new(poller));
        let log = Rc::new(RefCell::new(Vec::new()));

        reactor.register(7, Interest::Readable, recorder(&log, "r")).unwrap();
        reactor.register(7, Interest::Writable, recorder(&log, "w")).unwrap();

        injector.ready(7, Readiness::READABLE);
        let fired = reactor.poll(None).unwrap();
        assert_eq!(fired.len(), 1);
        fired.iter().for_each(|h| {
            h.run();
        });
        assert_eq!(*log.borrow(), vec!["r"]);

        // The reader is gone; another readable event only finds the writer
        // interest, which it does not match.
        injector.ready(7, Readiness::READABLE);
        assert!(reactor.poll(Some(Duration::ZERO)).unwrap().is_empty());
        assert!(!reactor.is_empty());

        injector.ready(7, Readiness::WRITABLE);
        for h in reactor.poll(None).unwrap() {
            h.run();
        }
        assert_eq!(*log.borrow(), vec!["r", "w"]);
        assert!(reactor.is_empty());
    }

    #[test]
    fn one_pending_interest_per_kind() {
        let mut reactor = Reactor::new(Box::new(ManualPoller::new(ManualClock::new())));
        let log = Rc::new(RefCell::new(Vec::new()));

        reactor.register(3, Interest::Readable, recorder(&log, "a")).unwrap();

        assert!(matches!(
            reactor.register(3, Interest::Readable, recorder(&log, "b")),
            Err(Error::InvalidState(_))
        ));

        assert!(reactor.remove(3, Interest::Readable, None));
        assert!(reactor.is_empty());
        reactor.register(3, Interest::Readable, recorder(&log, "c")).unwrap();
    }

    #[test]
    fn cancelled_registration_can_be_replaced() {
        let mut reactor = Reactor::new(Box::new(ManualPoller::new(ManualClock::new())));
        let log = Rc::new(RefCell::new(Vec::new()));

        let old = recorder(&log, "old");
        reactor.register(6, Interest::Readable, old.clone()).unwrap();
        old.cancel();
        assert!(reactor.is_empty());

        reactor.register(6, Interest::Readable, recorder(&log, "new")).unwrap();
        assert!(!reactor.is_empty());
        assert!(reactor.remove(6, Interest::Readable, None));
    }

    #[test]
    fn remove_only_matching_handle() {
        let mut reactor = Reactor::new(Box::new(ManualPoller::new(ManualClock::new())));
        let log = Rc::new(RefCell::new(Vec::new()));
        let stale = recorder(&log, "stale");
        let live = recorder(&log, "live");

        reactor.register(4, Interest::Writable, live.clone()).unwrap();

        assert!(!reactor.remove(4, Interest::Writable, Some(&stale)));
        assert!(!live.cancelled());
        assert!(reactor.remove(4, Interest::Writable, Some(&live)));
        assert!(live.cancelled());
    }

    #[test]
    fn timeout_advances_virtual_time() {
        let clock = ManualClock::new();
        let mut reactor = Reactor::new(Box::new(ManualPoller::new(clock.clone())));

        assert!(reactor.poll(Some(Duration::from_secs(3))).unwrap().is_empty());
        assert_eq!(crate::clock::Clock::now(&clock), Duration::from_secs(3));
    }
}
