//! Awaitables built on the event loop.
//!
//! Everything a task can wait on eventually reduces to a
//! [crate::future::Future] that some callback on the loop resolves: a timer
//! for [timer::sleep], a readiness registration for [io::wait_readable] and
//! [io::wait_writable], and combinations of those for the socket streams.
//!
//! The following sub-modules are exposed by the `futures` module:
//!
//! - `timer`: sleeping for a duration.
//! - `io`: waiting for a file descriptor to become readable or writable.
//! - `tcp`: opening TCP connections, optionally over TLS.
//! - `stream`: the buffered reader and writer halves of a connection.
//!
//! All of them look up the loop that is running on the current thread and
//! fail with [crate::Error::InvalidState] when awaited outside of one.
use crate::{error::Error, event_loop::EventLoop};

pub mod io;
mod sock_addr;
pub mod stream;
pub mod tcp;
pub mod timer;
mod tls;

pub(crate) fn current_loop() -> Result<EventLoop, Error> {
    EventLoop::try_current().ok_or(Error::InvalidState(
        "no event loop is running on this thread",
    ))
}
