//! Sleeping.
//!
//! [sleep] suspends the calling task until the loop's clock has advanced by
//! at least the given delay. It is built from a [crate::future::Future] that
//! a timer resolves, so a sleeping task costs one heap entry and nothing
//! else. If the task stops waiting early (it is cancelled, or the sleep future
//! is dropped) the timer is cancelled with it.
//!
//! # Example
//! Let's put a task to sleep for 20 milliseconds.
//! ```
//! use tinyloop::sleep;
//! use std::time::{Duration, Instant};
//!
//! tinyloop::run(async {
//!     let now = Instant::now();
//!
//!     sleep(Duration::from_millis(20)).await?;
//!
//!     assert!(now.elapsed() >= Duration::from_millis(20));
//!     Ok::<_, tinyloop::Error>(())
//! })
//! .unwrap();
//! ```
use std::time::Duration;

use crate::{error::Error, future::Future, handle::TimerHandle};

use super::current_loop;

/// Cancels the timer when the sleep ends, however it ends.
struct TimerGuard(TimerHandle);

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Suspend the current task for `delay`.
///
/// A zero delay still goes through the timer heap, which makes it a way for a
/// task to let every other ready task run before it continues.
pub async fn sleep(delay: Duration) -> Result<(), Error> {
    sleep_with(delay, ()).await
}

/// Suspend the current task for `delay`, then yield `value`.
pub async fn sleep_with<T: Clone + 'static>(delay: Duration, value: T) -> Result<T, Error> {
    let event_loop = current_loop()?;
    let fut = Future::for_one_waiter(event_loop.downgrade());

    let timer = {
        let fut = fut.clone();
        event_loop.call_later(delay, move || {
            // Fails only if the sleep was cancelled in the meantime.
            let _ = fut.set_result(value);
        })
    };

    let _guard = TimerGuard(timer);
    drop(event_loop);

    fut.await
}
