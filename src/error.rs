//! Error types.
//!
//! Every fallible operation in tinyloop returns [Error]. The type is `Clone`
//! because a task's error is stored in its result cell and handed to every
//! computation that awaits the task.
use std::{io, os::fd::RawFd, sync::Arc};

use thiserror::Error;

/// `Result` with [Error] as the default error type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by the event loop, its futures and the computations it
/// drives.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A future was resolved twice, read before completion, or the loop was
    /// used in a way its current state does not allow.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The operation was cancelled before it could complete.
    #[error("operation was cancelled")]
    Cancelled,

    /// Establishing a connection (resolution, connect or TLS handshake) to
    /// `addr` failed.
    #[error("connection to {addr} failed: {source}")]
    Connection {
        addr: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// An I/O error on an established stream.
    #[error(transparent)]
    Io(Arc<io::Error>),

    /// An application error raised by a task's computation.
    #[error("{0}")]
    Task(Arc<anyhow::Error>),

    /// The event loop itself failed; the computation it was running has been
    /// abandoned.
    #[error(transparent)]
    Loop(Arc<LoopError>),
}

/// Failures internal to the event loop.
///
/// These abort [crate::event_loop::EventLoop::run] regardless of what the
/// running task was doing.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("failed to create the I/O poller")]
    Setup(#[source] io::Error),

    #[error("failed to wait for I/O events")]
    Poll(#[source] io::Error),

    #[error("failed to register file descriptor {fd} with the poller")]
    Register {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    #[error("event loop stalled: no callbacks, timers or I/O registrations remain")]
    Stalled,
}

impl Error {
    pub(crate) fn connection(addr: impl Into<String>, source: io::Error) -> Self {
        Self::Connection {
            addr: addr.into(),
            source: Arc::new(source),
        }
    }

    /// Returns `true` if this error signals cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<anyhow::Error> for Error {
    fn from(value: anyhow::Error) -> Self {
        Self::Task(Arc::new(value))
    }
}

impl From<LoopError> for Error {
    fn from(value: LoopError) -> Self {
        Self::Loop(Arc::new(value))
    }
}
