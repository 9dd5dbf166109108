//! The event loop.
//!
//! An [EventLoop] owns a ready queue of callbacks, a heap of timers, an I/O
//! reactor and the set of live tasks. It is single-threaded: all of its state
//! lives behind `Rc`/`RefCell` and only the thread that created it can drive
//! it.
//!
//! Each iteration of the loop:
//!
//! 1. Works out how long it may block: not at all if callbacks are ready,
//!    until the nearest timer if there is one, otherwise indefinitely.
//! 2. Waits for I/O readiness and queues the handles of every interest that
//!    fired.
//! 3. Queues the handles of every timer that has come due, in deadline order.
//! 4. Runs the callbacks that were queued at the start of this step. Anything
//!    scheduled while they run waits for the next iteration.
//!
//! # Example
//!
//! ```
//! use tinyloop::event_loop::EventLoop;
//! use std::time::Duration;
//!
//! let event_loop = EventLoop::new().unwrap();
//! let value = event_loop
//!     .run(async {
//!         tinyloop::sleep(Duration::from_millis(5)).await?;
//!         Ok::<_, tinyloop::Error>("done")
//!     })
//!     .unwrap();
//! assert_eq!(value, "done");
//! ```
use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
    future::Future as StdFuture,
    os::fd::RawFd,
    rc::{Rc, Weak},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use log::{debug, trace, warn};
use slab::Slab;

use crate::{
    clock::Clock,
    error::{Error, LoopError},
    future::Future,
    handle::{Handle, TimerHandle},
    reactor::{Interest, Poller, Reactor},
    task::{Task, TaskCore, TaskId},
};

use self::{ready::ReadyQueue, timers::TimerHeap};

mod builder;
mod ready;
mod timers;

pub use builder::Builder;

static NEXT_LOOP_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static LOOPS: RefCell<HashMap<usize, Weak<Inner>>> = RefCell::new(HashMap::new());
    static RUNNING: RefCell<Option<Weak<Inner>>> = const { RefCell::new(None) };
}

struct Inner {
    id: usize,
    clock: Box<dyn Clock>,
    ready: RefCell<ReadyQueue>,
    timers: RefCell<TimerHeap>,
    reactor: RefCell<Reactor>,
    tasks: RefCell<Slab<Rc<TaskCore>>>,
    current: RefCell<Option<Rc<TaskCore>>>,
    next_task: Cell<u64>,
    running: Cell<bool>,
    closed: Cell<bool>,
    fatal: RefCell<Option<Arc<LoopError>>>,
    slow_callback: Option<Duration>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let id = self.id;
        let _ = LOOPS.try_with(|loops| loops.borrow_mut().remove(&id));
    }
}

/// A single-threaded event loop.
///
/// Cloning an `EventLoop` yields another reference to the same loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<Inner>,
}

/// A non-owning reference to an event loop, held by futures and streams so
/// that they do not keep the loop alive.
#[derive(Clone)]
pub(crate) struct WeakLoop(Weak<Inner>);

impl WeakLoop {
    pub fn upgrade(&self) -> Option<EventLoop> {
        self.0.upgrade().map(|inner| EventLoop { inner })
    }

    pub fn call_soon(&self, f: impl FnOnce() + 'static) {
        match self.upgrade() {
            Some(event_loop) => {
                event_loop.call_soon(f);
            }
            None => warn!("callback dropped: its event loop no longer exists"),
        }
    }

    pub fn current_task(&self) -> Option<Rc<TaskCore>> {
        self.0
            .upgrade()
            .and_then(|inner| inner.current.borrow().clone())
    }
}

/// Marks a loop as running on this thread for as long as it lives.
struct Running {
    inner: Rc<Inner>,
    previous: Option<Weak<Inner>>,
}

impl Drop for Running {
    fn drop(&mut self) {
        self.inner.running.set(false);
        let previous = self.previous.take();
        let _ = RUNNING.try_with(|running| *running.borrow_mut() = previous);
    }
}

impl EventLoop {
    /// Create a loop backed by the system monotonic clock and epoll.
    pub fn new() -> Result<Self, Error> {
        Builder::new().build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn from_parts(
        clock: Box<dyn Clock>,
        poller: Box<dyn Poller>,
        slow_callback: Option<Duration>,
    ) -> Self {
        let id = NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed);

        let inner = Rc::new(Inner {
            id,
            clock,
            ready: RefCell::new(ReadyQueue::default()),
            timers: RefCell::new(TimerHeap::default()),
            reactor: RefCell::new(Reactor::new(poller)),
            tasks: RefCell::new(Slab::new()),
            current: RefCell::new(None),
            next_task: Cell::new(1),
            running: Cell::new(false),
            closed: Cell::new(false),
            fatal: RefCell::new(None),
            slow_callback,
        });

        LOOPS.with(|loops| loops.borrow_mut().insert(id, Rc::downgrade(&inner)));

        Self { inner }
    }

    /// The loop that is currently running on this thread.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a running event loop. Use
    /// [EventLoop::try_current] for a non-panicking variant.
    pub fn current() -> Self {
        match Self::try_current() {
            Some(event_loop) => event_loop,
            None => panic!("no event loop is running on this thread"),
        }
    }

    pub fn try_current() -> Option<Self> {
        RUNNING
            .with(|running| running.borrow().as_ref().and_then(Weak::upgrade))
            .map(|inner| Self { inner })
    }

    pub(crate) fn lookup(id: usize) -> Option<Self> {
        LOOPS
            .try_with(|loops| loops.borrow().get(&id).and_then(Weak::upgrade))
            .ok()
            .flatten()
            .map(|inner| Self { inner })
    }

    pub(crate) fn id(&self) -> usize {
        self.inner.id
    }

    pub(crate) fn downgrade(&self) -> WeakLoop {
        WeakLoop(Rc::downgrade(&self.inner))
    }

    /// The loop's notion of the current time.
    pub fn time(&self) -> Duration {
        self.inner.clock.now()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Schedule `f` to run on the next iteration of the loop.
    pub fn call_soon(&self, f: impl FnOnce() + 'static) -> Handle {
        let handle = Handle::new(f);

        if self.inner.closed.get() {
            warn!("callback scheduled on a closed event loop was dropped");
            handle.cancel();
            return handle;
        }

        self.inner.ready.borrow_mut().push(handle.clone());

        handle
    }

    /// Schedule `f` to run once `delay` has elapsed. Deadlines past the end
    /// of the clock's range are clamped to it.
    pub fn call_later(&self, delay: Duration, f: impl FnOnce() + 'static) -> TimerHandle {
        self.call_at(self.time().saturating_add(delay), f)
    }

    /// Schedule `f` to run once the loop's clock reaches `when`.
    pub fn call_at(&self, when: Duration, f: impl FnOnce() + 'static) -> TimerHandle {
        let handle = Handle::new(f);

        if self.inner.closed.get() {
            warn!("timer scheduled on a closed event loop was dropped");
            handle.cancel();
            return TimerHandle::new(handle, when);
        }

        self.inner.timers.borrow_mut().push(when, handle)
    }

    pub fn create_future<T: 'static>(&self) -> Future<T> {
        Future::new(self)
    }

    /// Wrap `computation` in a task. Its first step runs on the next
    /// iteration of the loop.
    pub fn create_task<F, T, E>(&self, computation: F) -> Task<T>
    where
        F: StdFuture<Output = Result<T, E>> + 'static,
        T: 'static,
        E: Into<Error> + 'static,
    {
        Task::spawn(self, computation)
    }

    /// Run `f` once `fd` becomes readable.
    pub fn add_reader(&self, fd: RawFd, f: impl FnOnce() + 'static) -> Result<Handle, Error> {
        self.register(fd, Interest::Readable, f)
    }

    /// Run `f` once `fd` becomes writable.
    pub fn add_writer(&self, fd: RawFd, f: impl FnOnce() + 'static) -> Result<Handle, Error> {
        self.register(fd, Interest::Writable, f)
    }

    pub fn remove_reader(&self, fd: RawFd) -> bool {
        self.inner
            .reactor
            .borrow_mut()
            .remove(fd, Interest::Readable, None)
    }

    pub fn remove_writer(&self, fd: RawFd) -> bool {
        self.inner
            .reactor
            .borrow_mut()
            .remove(fd, Interest::Writable, None)
    }

    pub(crate) fn register(
        &self,
        fd: RawFd,
        interest: Interest,
        f: impl FnOnce() + 'static,
    ) -> Result<Handle, Error> {
        if self.inner.closed.get() {
            return Err(Error::InvalidState("event loop is closed"));
        }

        let handle = Handle::new(f);
        let res = self
            .inner
            .reactor
            .borrow_mut()
            .register(fd, interest, handle.clone());

        if let Err(Error::Loop(e)) = &res {
            *self.inner.fatal.borrow_mut() = Some(e.clone());
        }

        res.map(|()| handle)
    }

    /// Remove the `interest` registration of `fd`, but only if it is still
    /// `handle`.
    pub(crate) fn remove_handle(&self, fd: RawFd, interest: Interest, handle: &Handle) -> bool {
        self.inner
            .reactor
            .borrow_mut()
            .remove(fd, interest, Some(handle))
    }

    /// Run `computation` as a task until it completes and return its value.
    ///
    /// Fails with [Error::InvalidState] if this or any other loop is already
    /// running on this thread, and with [Error::Loop] if the loop itself fails
    /// before the computation finishes.
    pub fn run<F, T, E>(&self, computation: F) -> Result<T, Error>
    where
        F: StdFuture<Output = Result<T, E>> + 'static,
        T: 'static,
        E: Into<Error> + 'static,
    {
        let _running = self.enter()?;
        let output = Rc::new(RefCell::new(None));

        let task = {
            let output = output.clone();
            self.create_task(async move {
                let value = computation.await.map_err(Into::into)?;
                *output.borrow_mut() = Some(value);
                Ok::<_, Error>(())
            })
        };

        self.drive(&task)?;
        task.result()?;

        let value = output.borrow_mut().take();
        value.ok_or(Error::InvalidState("computation finished without a value"))
    }

    /// Run the loop until `task` is done and return its result.
    pub fn run_until_complete<T: Clone + 'static>(&self, task: &Task<T>) -> Result<T, Error> {
        let _running = self.enter()?;

        self.drive(task)?;

        task.result()
    }

    fn enter(&self) -> Result<Running, Error> {
        if self.inner.closed.get() {
            return Err(Error::InvalidState("event loop is closed"));
        }

        if self.inner.running.get() {
            return Err(Error::InvalidState("event loop is already running"));
        }

        if Self::try_current().is_some() {
            return Err(Error::InvalidState(
                "another event loop is already running on this thread",
            ));
        }

        self.inner.running.set(true);
        let previous = RUNNING.with(|running| running.replace(Some(Rc::downgrade(&self.inner))));

        Ok(Running {
            inner: self.inner.clone(),
            previous,
        })
    }

    fn drive<T: 'static>(&self, task: &Task<T>) -> Result<(), Error> {
        while !task.done() {
            self.run_once()?;
        }

        Ok(())
    }

    fn check_fatal(&self) -> Result<(), Error> {
        match self.inner.fatal.borrow().as_ref() {
            Some(e) => Err(Error::Loop(e.clone())),
            None => Ok(()),
        }
    }

    fn abort(&self, err: LoopError) -> Error {
        let err = Arc::new(err);
        *self.inner.fatal.borrow_mut() = Some(err.clone());
        Error::Loop(err)
    }

    /// Run a single iteration of the loop.
    pub(crate) fn run_once(&self) -> Result<(), Error> {
        self.check_fatal()?;

        let timeout = if !self.inner.ready.borrow().is_empty() {
            Some(Duration::ZERO)
        } else {
            let next = self.inner.timers.borrow_mut().next_deadline();

            match next {
                Some(when) => Some(when.saturating_sub(self.time())),
                None if self.inner.reactor.borrow().is_empty() => {
                    return Err(self.abort(LoopError::Stalled));
                }
                None => None,
            }
        };

        let fired = self.inner.reactor.borrow_mut().poll(timeout);
        let fired = fired.map_err(|e| self.abort(e))?;

        let now = self.time();
        let due = self.inner.timers.borrow_mut().pop_due(now);

        {
            let mut ready = self.inner.ready.borrow_mut();
            for handle in fired.into_iter().chain(due) {
                ready.push(handle);
            }
        }

        self.run_ready();

        self.check_fatal()
    }

    fn run_ready(&self) {
        let n = self.inner.ready.borrow().len();

        for _ in 0..n {
            let Some(handle) = self.inner.ready.borrow_mut().pop() else {
                break;
            };

            match self.inner.slow_callback {
                Some(limit) => {
                    let started = Instant::now();
                    handle.run();
                    let took = started.elapsed();

                    if took >= limit {
                        warn!("executing {handle:?} took {:.3} seconds", took.as_secs_f64());
                    }
                }
                None => {
                    handle.run();
                }
            }
        }
    }

    pub(crate) fn next_task_id(&self) -> TaskId {
        let id = self.inner.next_task.get();
        self.inner.next_task.set(id + 1);
        TaskId(id)
    }

    pub(crate) fn insert_task(&self, f: impl FnOnce(usize) -> TaskCore) -> Rc<TaskCore> {
        let mut tasks = self.inner.tasks.borrow_mut();
        let entry = tasks.vacant_entry();
        let core = Rc::new(f(entry.key()));

        entry.insert(core.clone());

        core
    }

    pub(crate) fn set_current_task(&self, task: Option<Rc<TaskCore>>) -> Option<Rc<TaskCore>> {
        self.inner.current.replace(task)
    }

    /// Queue a step of the task in slot `key`, provided it is still the task
    /// with `id`.
    pub(crate) fn wake_task(&self, key: usize, id: TaskId) {
        let core = self
            .inner
            .tasks
            .borrow()
            .get(key)
            .filter(|core| core.id() == id)
            .cloned();

        match core {
            Some(core) => self.schedule_step(&core),
            None => trace!("{id} woken after it finished"),
        }
    }

    pub(crate) fn schedule_step(&self, core: &Rc<TaskCore>) {
        if !core.mark_scheduled() {
            return;
        }

        let core = core.clone();
        let event_loop = self.downgrade();

        self.call_soon(move || {
            if let Some(event_loop) = event_loop.upgrade() {
                event_loop.run_step(&core);
            }
        });
    }

    fn run_step(&self, core: &Rc<TaskCore>) {
        if !core.step(self) {
            return;
        }

        let mut tasks = self.inner.tasks.borrow_mut();

        if tasks
            .get(core.key())
            .is_some_and(|t| Rc::ptr_eq(t, core))
        {
            tasks.remove(core.key());
        }
    }

    /// Cancel every task that is still alive and run the loop until they have
    /// all finished.
    pub(crate) fn cancel_remaining(&self) -> Result<(), Error> {
        let pending: Vec<Rc<TaskCore>> = self
            .inner
            .tasks
            .borrow()
            .iter()
            .map(|(_, core)| core.clone())
            .collect();

        if pending.is_empty() {
            return Ok(());
        }

        debug!("cancelling {} remaining task(s)", pending.len());

        let _running = self.enter()?;

        for core in pending.iter() {
            crate::future::Cancel::cancel(&**core);
        }

        while pending.iter().any(|core| !core.is_finished()) {
            self.run_once()?;
        }

        Ok(())
    }

    /// Close the loop, dropping every queued callback, timer, I/O
    /// registration and task. Tasks that have not finished are logged.
    ///
    /// Fails with [Error::InvalidState] if the loop is running. Closing a
    /// closed loop does nothing.
    pub fn close(&self) -> Result<(), Error> {
        if self.inner.running.get() {
            return Err(Error::InvalidState("cannot close a running event loop"));
        }

        if self.inner.closed.replace(true) {
            return Ok(());
        }

        debug!("closing event loop");

        let tasks = std::mem::take(&mut *self.inner.tasks.borrow_mut());
        let ready = self.inner.ready.borrow_mut().clear();
        let timers = self.inner.timers.borrow_mut().clear();
        let registrations = self.inner.reactor.borrow_mut().clear();
        let current = self.inner.current.borrow_mut().take();

        for (_, core) in tasks.iter() {
            core.discard();
        }

        for handle in ready.iter().chain(timers.iter()).chain(registrations.iter()) {
            handle.cancel();
        }

        drop((tasks, ready, timers, registrations, current));

        Ok(())
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.inner.id)
            .field("running", &self.inner.running.get())
            .field("closed", &self.inner.closed.get())
            .field("tasks", &self.inner.tasks.borrow().len())
            .finish()
    }
}
