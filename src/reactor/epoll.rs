//! Linux `epoll` backend.
use std::{
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    time::Duration,
};

use super::{Event, Poller, Readiness};

/// Default number of events collected per `epoll_wait` call.
pub const MAX_NUM_EVENTS: usize = 512;

/// A level-triggered epoll instance.
pub struct Epoll {
    fd: OwnedFd,
    events: Vec<libc::epoll_event>,
}

fn mask(interest: Readiness) -> u32 {
    let mut bits = 0;

    if interest.readable {
        bits |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
    }

    if interest.writable {
        bits |= libc::EPOLLOUT as u32;
    }

    bits
}

fn readiness(bits: u32) -> Readiness {
    let failed = bits & (libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0;

    Readiness {
        readable: failed || bits & (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 != 0,
        writable: failed || bits & libc::EPOLLOUT as u32 != 0,
    }
}

/// `epoll_wait` takes milliseconds; round up so that a wakeup never comes
/// before the deadline it was computed from.
fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => d.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as i32,
    }
}

impl Epoll {
    pub fn new(max_events: usize) -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };

        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: Vec::with_capacity(max_events.max(1)),
        })
    }

    fn ctl(&self, op: i32, fd: RawFd, interest: Readiness) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: mask(interest),
            u64: fd as u64,
        };

        if unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut event) } == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}

impl Poller for Epoll {
    fn add(&mut self, fd: RawFd, interest: Readiness) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
    }

    fn modify(&mut self, fd: RawFd, interest: Readiness) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
    }

    fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, Readiness::default())
    }

    fn wait(&mut self, timeout: Option<Duration>, events: &mut Vec<Event>) -> io::Result<()> {
        self.events.clear();

        let n = unsafe {
            libc::epoll_wait(
                self.fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.capacity() as i32,
                timeout_ms(timeout),
            )
        };

        if n == -1 {
            let err = io::Error::last_os_error();

            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }

            return Err(err);
        }

        unsafe { self.events.set_len(n as usize) };

        events.extend(self.events.iter().map(|e| {
            let bits = e.events;
            let data = e.u64;

            Event {
                fd: data as RawFd,
                readiness: readiness(bits),
            }
        }));

        Ok(())
    }
}
