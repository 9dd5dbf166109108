//! Single-assignment result cells.
//!
//! A [Future] starts out pending and is completed exactly once, either with a
//! value ([Future::set_result]), an error ([Future::set_exception]) or by
//! being cancelled ([Future::cancel]). Any number of consumers may hold a clone
//! of it and `.await` it; each of them receives a clone of the stored value.
//!
//! Completion never runs consumer code on the producer's stack. Every done
//! callback, including the wakeup of a task awaiting the future, is scheduled
//! on the event loop's ready queue and runs on a later iteration.
//!
//! # Example
//!
//! ```
//! use tinyloop::event_loop::EventLoop;
//! use std::time::Duration;
//!
//! let event_loop = EventLoop::new().unwrap();
//! let fut = event_loop.create_future::<u32>();
//! {
//!     let fut = fut.clone();
//!     event_loop.call_later(Duration::from_millis(10), move || {
//!         fut.set_result(7).unwrap();
//!     });
//! }
//! let v = event_loop.run(fut).unwrap();
//! assert_eq!(v, 7);
//! ```
use std::{
    cell::{Cell, RefCell},
    fmt,
    future::Future as StdFuture,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

use log::error;

use crate::{
    error::Error,
    event_loop::{EventLoop, WeakLoop},
    task::TaskId,
};

pub(crate) enum State<T> {
    Pending,
    Resolved(T),
    Rejected(Error),
    Cancelled,
}

enum Callback<T> {
    Wake(Waker),
    Call(Box<dyn FnOnce(&Future<T>)>),
}

struct Inner<T> {
    event_loop: WeakLoop,
    state: RefCell<State<T>>,
    callbacks: RefCell<Vec<Callback<T>>>,
    unretrieved: Cell<bool>,
    owner: Option<TaskId>,
    single_waiter: bool,
}

/// Something a suspended task is waiting on that can be cancelled on its
/// behalf.
pub(crate) trait Cancel {
    fn cancel(&self) -> bool;

    fn task_id(&self) -> Option<TaskId> {
        None
    }
}

/// A single-assignment asynchronous result cell.
///
/// See the [module-level documentation](self) for more information.
pub struct Future<T> {
    inner: Rc<Inner<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Future<T> {
    /// Create a pending future bound to `event_loop`.
    pub fn new(event_loop: &EventLoop) -> Self {
        Self::with_loop(event_loop.downgrade(), None)
    }

    pub(crate) fn with_loop(event_loop: WeakLoop, owner: Option<TaskId>) -> Self {
        Self::build(event_loop, owner, false)
    }

    /// A future that only the task which created it ever awaits, such as the
    /// one behind a sleep or a readiness wait. Cancelling that task cancels
    /// the future itself.
    pub(crate) fn for_one_waiter(event_loop: WeakLoop) -> Self {
        Self::build(event_loop, None, true)
    }

    fn build(event_loop: WeakLoop, owner: Option<TaskId>, single_waiter: bool) -> Self {
        Self {
            inner: Rc::new(Inner {
                event_loop,
                state: RefCell::new(State::Pending),
                callbacks: RefCell::new(Vec::new()),
                unretrieved: Cell::new(false),
                owner,
                single_waiter,
            }),
        }
    }

    pub fn done(&self) -> bool {
        !matches!(*self.inner.state.borrow(), State::Pending)
    }

    pub fn cancelled(&self) -> bool {
        matches!(*self.inner.state.borrow(), State::Cancelled)
    }

    /// Complete the future with `value`.
    ///
    /// Fails with [Error::InvalidState] if the future is already done.
    pub fn set_result(&self, value: T) -> Result<(), Error> {
        self.complete(State::Resolved(value))
    }

    /// Complete the future with an error. Passing [Error::Cancelled] is the
    /// same as calling [Future::cancel].
    ///
    /// Fails with [Error::InvalidState] if the future is already done.
    pub fn set_exception(&self, err: impl Into<Error>) -> Result<(), Error> {
        match err.into() {
            Error::Cancelled => self.complete(State::Cancelled),
            err => self.complete(State::Rejected(err)),
        }
    }

    /// Cancel the future. Returns `false` if it was already done.
    pub fn cancel(&self) -> bool {
        self.complete(State::Cancelled).is_ok()
    }

    pub(crate) fn complete(&self, state: State<T>) -> Result<(), Error> {
        {
            let mut current = self.inner.state.borrow_mut();

            if !matches!(*current, State::Pending) {
                return Err(Error::InvalidState("future is already done"));
            }

            self.inner
                .unretrieved
                .set(matches!(state, State::Rejected(_)));
            *current = state;
        }

        let callbacks = std::mem::take(&mut *self.inner.callbacks.borrow_mut());

        for callback in callbacks {
            self.schedule(callback);
        }

        Ok(())
    }

    fn schedule(&self, callback: Callback<T>) {
        match callback {
            Callback::Wake(waker) => waker.wake(),
            Callback::Call(f) => {
                let fut = self.clone();
                self.inner.event_loop.call_soon(move || f(&fut));
            }
        }
    }

    /// Register `f` to be called once the future is done.
    ///
    /// The callback always runs from the ready queue, even when the future is
    /// already done at the time of registration.
    pub fn add_done_callback(&self, f: impl FnOnce(&Future<T>) + 'static) {
        let callback = Callback::Call(Box::new(f));

        if self.done() {
            self.schedule(callback);
        } else {
            self.inner.callbacks.borrow_mut().push(callback);
        }
    }

    /// The error the future completed with, if any.
    ///
    /// Fails with [Error::InvalidState] while pending and with
    /// [Error::Cancelled] if the future was cancelled.
    pub fn exception(&self) -> Result<Option<Error>, Error> {
        match &*self.inner.state.borrow() {
            State::Pending => Err(Error::InvalidState("future is not done yet")),
            State::Cancelled => Err(Error::Cancelled),
            State::Resolved(_) => Ok(None),
            State::Rejected(e) => {
                self.inner.unretrieved.set(false);
                Ok(Some(e.clone()))
            }
        }
    }

    fn register_waker(&self, waker: &Waker) {
        let mut callbacks = self.inner.callbacks.borrow_mut();

        let known = callbacks
            .iter()
            .any(|cb| matches!(cb, Callback::Wake(w) if w.will_wake(waker)));

        if !known {
            callbacks.push(Callback::Wake(waker.clone()));
        }
    }
}

impl<T: Clone + 'static> Future<T> {
    /// The value the future completed with.
    ///
    /// Fails with [Error::InvalidState] while pending, with [Error::Cancelled]
    /// if cancelled and with the stored error if one was set.
    pub fn result(&self) -> Result<T, Error> {
        match &*self.inner.state.borrow() {
            State::Pending => Err(Error::InvalidState("future is not done yet")),
            State::Resolved(v) => Ok(v.clone()),
            State::Rejected(e) => {
                self.inner.unretrieved.set(false);
                Err(e.clone())
            }
            State::Cancelled => Err(Error::Cancelled),
        }
    }

    /// Poll on behalf of whatever task is currently running. `waiter` is what
    /// cancelling that task should cancel while it is suspended here.
    pub(crate) fn poll_with(
        &self,
        cx: &mut Context<'_>,
        waiter: impl FnOnce() -> Rc<dyn Cancel>,
    ) -> Poll<Result<T, Error>> {
        let task = self.inner.event_loop.current_task();

        if let Some(task) = &task {
            if task.take_cancel_request() {
                return Poll::Ready(Err(Error::Cancelled));
            }
        }

        if self.done() {
            return Poll::Ready(self.result());
        }

        let waiter = waiter();

        if let Some(task) = task {
            if waiter.task_id() == Some(task.id()) {
                return Poll::Ready(Err(Error::InvalidState("a task cannot await itself")));
            }

            task.set_waiter(waiter);
        }

        self.register_waker(cx.waker());

        Poll::Pending
    }
}

impl<T: 'static> Cancel for Future<T> {
    /// A shared future stays pending for its other awaiters; the cancelled
    /// task only stops waiting on it.
    fn cancel(&self) -> bool {
        self.inner.single_waiter && Future::cancel(self)
    }
}

impl<T: Clone + 'static> StdFuture for Future<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this: &Self = &self;

        this.poll_with(cx, || Rc::new(this.clone()) as Rc<dyn Cancel>)
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.inner.state.borrow() {
            State::Pending => "pending",
            State::Resolved(_) => "resolved",
            State::Rejected(_) => "rejected",
            State::Cancelled => "cancelled",
        };

        f.debug_struct("Future").field("state", &state).finish()
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if !self.unretrieved.get() {
            return;
        }

        if let State::Rejected(e) = self.state.get_mut() {
            match self.owner {
                Some(id) => error!("{id} exception was never retrieved: {e}"),
                None => error!("future exception was never retrieved: {e}"),
            }
        }
    }
}
