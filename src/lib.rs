//! # `tinyloop`: a tiny single-threaded event loop
//!
//! This crate implements the essential machinery of a cooperative event loop
//! in as little code as is reasonable: a ready queue of callbacks, a heap of
//! timers, explicit single-assignment [Future] cells, [Task]s that drive Rust
//! `async` computations, and an epoll-based reactor with a line-oriented
//! socket stream on top, optionally over TLS.
//!
//! Everything runs on one thread. A task only gives up control when it awaits
//! something that is not ready yet, and every wakeup goes through the loop's
//! ready queue, so the order in which things happen is fully determined by the
//! order in which they were scheduled.
//!
//! For the loop itself see the [event_loop] module, for tasks the [task]
//! module, and for what can be awaited the [futures] module.
//!
//! ## Example
//!
//! Two tasks sleeping concurrently finish after the longer of the two sleeps:
//!
//! ```
//! use std::time::{Duration, Instant};
//! use tinyloop::{create_task, sleep};
//!
//! let before = Instant::now();
//! tinyloop::run(async {
//!     let a = create_task(async {
//!         sleep(Duration::from_millis(100)).await?;
//!         println!("Hello, ");
//!         Ok::<_, tinyloop::Error>(())
//!     });
//!     let b = create_task(async {
//!         sleep(Duration::from_millis(200)).await?;
//!         println!("World!");
//!         Ok::<_, tinyloop::Error>(())
//!     });
//!     a.await?;
//!     b.await
//! })
//! .unwrap();
//! assert!(before.elapsed() < Duration::from_millis(300));
//! ```
use std::future::Future as StdFuture;

use log::warn;

pub mod clock;
pub mod error;
pub mod event_loop;
pub mod future;
pub mod futures;
pub mod handle;
pub mod reactor;
pub mod task;

pub use error::{Error, Result};
pub use event_loop::EventLoop;
pub use future::Future;
pub use futures::{
    io::{wait_readable, wait_writable},
    stream::{Reader, Writer},
    tcp::open_connection,
    timer::{sleep, sleep_with},
};
pub use task::Task;

/// Run `computation` on a fresh event loop and return its result.
///
/// Once the computation has finished, every task it left behind is cancelled
/// and run to completion, and the loop is closed.
pub fn run<F, T, E>(computation: F) -> Result<T, Error>
where
    F: StdFuture<Output = Result<T, E>> + 'static,
    T: 'static,
    E: Into<Error> + 'static,
{
    let event_loop = EventLoop::new()?;
    let result = event_loop.run(computation);

    if let Err(e) = event_loop.cancel_remaining() {
        warn!("failed to cancel remaining tasks: {e}");
    }

    if let Err(e) = event_loop.close() {
        warn!("failed to close event loop: {e}");
    }

    result
}

/// Schedule `computation` as a task on the running loop.
///
/// # Panics
///
/// Panics if no event loop is running on this thread. Use [try_create_task]
/// for a non-panicking variant.
pub fn create_task<F, T, E>(computation: F) -> Task<T>
where
    F: StdFuture<Output = Result<T, E>> + 'static,
    T: 'static,
    E: Into<Error> + 'static,
{
    EventLoop::current().create_task(computation)
}

/// Schedule `computation` as a task on the running loop, failing with
/// [Error::InvalidState] if there is none.
pub fn try_create_task<F, T, E>(computation: F) -> Result<Task<T>, Error>
where
    F: StdFuture<Output = Result<T, E>> + 'static,
    T: 'static,
    E: Into<Error> + 'static,
{
    Ok(futures::current_loop()?.create_task(computation))
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc, time::Duration};

    use crate::{create_task, error::Error, sleep, try_create_task, EventLoop};

    #[test]
    fn run_cancels_leftover_tasks() {
        let leftover = Rc::new(RefCell::new(None));

        let value = {
            let leftover = leftover.clone();
            crate::run(async move {
                let task = create_task(async {
                    sleep(Duration::from_secs(3600)).await?;
                    Ok::<_, Error>(())
                });
                *leftover.borrow_mut() = Some(task);
                sleep(Duration::ZERO).await?;
                Ok::<_, Error>(7)
            })
            .unwrap()
        };

        assert_eq!(value, 7);

        let task = leftover.borrow_mut().take().unwrap();
        assert!(task.cancelled());
        assert!(EventLoop::try_current().is_none());
    }

    #[test]
    fn run_reports_computation_errors() {
        let res = crate::run(async { Err::<(), _>(anyhow::anyhow!("bad input")) });

        assert!(matches!(res, Err(Error::Task(e)) if e.to_string() == "bad input"));
    }

    #[test]
    fn try_create_task_needs_a_running_loop() {
        let outside = try_create_task(async { Ok::<_, Error>(()) });
        assert!(matches!(outside, Err(Error::InvalidState(_))));

        let value = crate::run(async {
            let task = try_create_task(async { Ok::<_, Error>(4) })?;
            task.await
        })
        .unwrap();

        assert_eq!(value, 4);
    }

    #[test]
    #[should_panic(expected = "no event loop is running")]
    fn create_task_outside_loop_panics() {
        create_task(async { Ok::<_, Error>(()) });
    }
}
