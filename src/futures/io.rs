//! Waiting for file descriptor readiness.
//!
//! These are the primitive I/O suspension points: everything the stream layer
//! does that would block turns into a call to [wait_readable] or
//! [wait_writable]. The descriptor must be in non-blocking mode.
//!
//! Only one task may wait for a given kind of readiness on a descriptor at a
//! time; a second waiter fails with [crate::Error::InvalidState].
use std::os::fd::RawFd;

use crate::{
    error::Error,
    event_loop::{EventLoop, WeakLoop},
    future::Future,
    handle::Handle,
    reactor::Interest,
};

use super::current_loop;

/// Removes the registration if the waiter goes away before it fired.
struct Registration {
    event_loop: WeakLoop,
    fd: RawFd,
    interest: Interest,
    handle: Handle,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.remove_handle(self.fd, self.interest, &self.handle);
        }
    }
}

/// Suspend the current task until `fd` is readable (or has hung up).
pub async fn wait_readable(fd: RawFd) -> Result<(), Error> {
    wait_for(fd, Interest::Readable).await
}

/// Suspend the current task until `fd` is writable.
pub async fn wait_writable(fd: RawFd) -> Result<(), Error> {
    wait_for(fd, Interest::Writable).await
}

async fn wait_for(fd: RawFd, interest: Interest) -> Result<(), Error> {
    let event_loop: EventLoop = current_loop()?;
    let fut = Future::<()>::for_one_waiter(event_loop.downgrade());

    let handle = {
        let fut = fut.clone();
        event_loop.register(fd, interest, move || {
            let _ = fut.set_result(());
        })?
    };

    let _registration = Registration {
        event_loop: event_loop.downgrade(),
        fd,
        interest,
        handle,
    };
    drop(event_loop);

    fut.await
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        os::{fd::AsRawFd, unix::net::UnixStream},
        time::Duration,
    };

    use super::{wait_readable, wait_writable};
    use crate::{error::Error, event_loop::EventLoop, sleep};

    #[test]
    fn wakes_when_data_arrives() {
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let fd = b.as_raw_fd();

        let lp = EventLoop::new().unwrap();
        let writer = lp.create_task(async move {
            sleep(Duration::from_millis(20)).await?;
            a.write_all(b"ping")?;
            Ok::<_, Error>(())
        });

        lp.run(async move {
            wait_readable(fd).await?;
            wait_writable(fd).await
        })
        .unwrap();

        assert!(writer.done());
        drop(b);
    }

    #[test]
    fn second_waiter_is_rejected() {
        let (_a, b) = UnixStream::pair().unwrap();
        let fd = b.as_raw_fd();
        let lp = EventLoop::new().unwrap();

        let first = lp.create_task(wait_readable(fd));

        let second = lp.run(async move {
            sleep(Duration::ZERO).await?;
            Ok::<_, Error>(wait_readable(fd).await)
        });

        assert!(matches!(second, Ok(Err(Error::InvalidState(_)))));
        assert!(!first.done());
        assert!(first.cancel());
    }

    #[test]
    fn cancelled_waiter_unregisters() {
        let (_a, b) = UnixStream::pair().unwrap();
        let fd = b.as_raw_fd();
        let lp = EventLoop::new().unwrap();

        let waiter = lp.create_task(wait_readable(fd));

        {
            let waiter = waiter.clone();
            lp.run(async move {
                sleep(Duration::ZERO).await?;
                waiter.cancel();
                sleep(Duration::ZERO).await?;
                // The slot is free again.
                assert!(!crate::event_loop::EventLoop::current().remove_reader(fd));
                Ok::<_, Error>(())
            })
            .unwrap();
        }

        assert!(waiter.cancelled());
    }
}
