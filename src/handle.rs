//! Cancellable callbacks.
use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
    time::Duration,
};

type Callback = Box<dyn FnOnce()>;

struct HandleInner {
    callback: RefCell<Option<Callback>>,
    cancelled: Cell<bool>,
}

/// A callback scheduled on the event loop.
///
/// Handles are returned by [crate::event_loop::EventLoop::call_soon] and the
/// I/O registration functions. Cancelling a handle does not remove it from
/// the queue that holds it; the loop skips it when its turn comes.
#[derive(Clone)]
pub struct Handle(Rc<HandleInner>);

impl Handle {
    pub(crate) fn new(f: impl FnOnce() + 'static) -> Self {
        Self(Rc::new(HandleInner {
            callback: RefCell::new(Some(Box::new(f))),
            cancelled: Cell::new(false),
        }))
    }

    /// Prevent the callback from running. Has no effect if it already ran.
    pub fn cancel(&self) {
        self.0.cancelled.set(true);
        let callback = self.0.callback.borrow_mut().take();
        drop(callback);
    }

    pub fn cancelled(&self) -> bool {
        self.0.cancelled.get()
    }

    /// Invoke the callback unless it was cancelled or already ran. Returns
    /// whether anything was invoked.
    pub(crate) fn run(&self) -> bool {
        if self.cancelled() {
            return false;
        }

        let callback = self.0.callback.borrow_mut().take();

        match callback {
            Some(f) => {
                f();
                true
            }
            None => false,
        }
    }

    pub(crate) fn ptr_eq(&self, other: &Handle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("cancelled", &self.cancelled())
            .finish()
    }
}

/// A callback scheduled to run at a deadline.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    pub(crate) handle: Handle,
    when: Duration,
}

impl TimerHandle {
    pub(crate) fn new(handle: Handle, when: Duration) -> Self {
        Self { handle, when }
    }

    /// The deadline, as a clock value.
    pub fn when(&self) -> Duration {
        self.when
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn cancelled(&self) -> bool {
        self.handle.cancelled()
    }
}
