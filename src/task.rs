//! Tasks: futures that drive a computation.
//!
//! A [Task] wraps a suspendable computation (any Rust future returning
//! `Result<T, E>`) together with a result cell. The event loop steps the
//! computation from its ready queue; whenever the computation awaits a
//! [crate::future::Future] (or another task) that is still pending, the task
//! suspends and is woken, through the ready queue, once that future completes.
//!
//! # Example
//!
//! ```
//! use tinyloop::{create_task, sleep};
//! use std::time::Duration;
//!
//! let total = tinyloop::run(async {
//!     let a = create_task(async {
//!         sleep(Duration::from_millis(20)).await?;
//!         Ok::<_, tinyloop::Error>(1)
//!     });
//!     let b = create_task(async {
//!         sleep(Duration::from_millis(10)).await?;
//!         Ok::<_, tinyloop::Error>(2)
//!     });
//!
//!     Ok::<_, tinyloop::Error>(a.await? + b.await?)
//! })
//! .unwrap();
//!
//! assert_eq!(total, 3);
//! ```
//!
//! # Cancellation
//!
//! [Task::cancel] requests cancellation. If the task is suspended on another
//! task, or on a sleep or readiness wait of its own, that is cancelled and the
//! task wakes up to find [crate::Error::Cancelled] as the result of its await.
//! A [crate::future::Future] that others may also be awaiting is left alone:
//! only the cancelled task stops waiting on it. Otherwise the request is
//! remembered and delivered at the task's next await. A task that was
//! cancelled before it ever ran is finished without running at all.
//!
//! A computation may catch the cancellation error and carry on; the task only
//! ends up cancelled if the error propagates out of the computation (or the
//! computation returns while a request is still undelivered).
use std::{
    cell::{Cell, RefCell},
    fmt,
    future::Future as StdFuture,
    pin::Pin,
    rc::Rc,
    sync::Arc,
    task::{ready, Context, Poll, Wake, Waker},
};

use log::{debug, trace, warn};

use crate::{
    error::Error,
    event_loop::EventLoop,
    future::{Cancel, Future, State},
};

/// Identifies a task for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task-{}", self.0)
    }
}

#[derive(Debug)]
enum Completion {
    Returned,
    Raised,
    Cancelled,
}

trait Computation {
    fn step(&mut self, cx: &mut Context<'_>, must_cancel: &Cell<bool>) -> Poll<Completion>;

    /// Finish the task without ever running the computation.
    fn abandon(&mut self);
}

struct Driver<F, T> {
    computation: Pin<Box<F>>,
    result: Future<T>,
}

impl<F, T, E> Computation for Driver<F, T>
where
    F: StdFuture<Output = Result<T, E>>,
    E: Into<Error>,
    T: 'static,
{
    fn step(&mut self, cx: &mut Context<'_>, must_cancel: &Cell<bool>) -> Poll<Completion> {
        let output = ready!(self.computation.as_mut().poll(cx));

        let (state, completion) = match output.map_err(Into::into) {
            Ok(value) => {
                if must_cancel.replace(false) {
                    (State::Cancelled, Completion::Cancelled)
                } else {
                    (State::Resolved(value), Completion::Returned)
                }
            }
            Err(Error::Cancelled) => (State::Cancelled, Completion::Cancelled),
            Err(e) => (State::Rejected(e), Completion::Raised),
        };

        if let Err(e) = self.result.complete(state) {
            warn!("task result was completed behind its back: {e}");
        }

        Poll::Ready(completion)
    }

    fn abandon(&mut self) {
        self.result.cancel();
    }
}

pub(crate) struct TaskCore {
    id: TaskId,
    key: usize,
    waker: Waker,
    computation: RefCell<Option<Box<dyn Computation>>>,
    started: Cell<bool>,
    scheduled: Cell<bool>,
    finished: Cell<bool>,
    must_cancel: Cell<bool>,
    waiter: RefCell<Option<Rc<dyn Cancel>>>,
}

impl TaskCore {
    fn new(id: TaskId, key: usize, event_loop: &EventLoop, computation: Box<dyn Computation>) -> Self {
        let waker = Waker::from(Arc::new(TaskWaker {
            event_loop: event_loop.id(),
            key,
            id,
        }));

        Self {
            id,
            key,
            waker,
            computation: RefCell::new(Some(computation)),
            started: Cell::new(false),
            scheduled: Cell::new(false),
            finished: Cell::new(false),
            must_cancel: Cell::new(false),
            waiter: RefCell::new(None),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn key(&self) -> usize {
        self.key
    }

    pub fn is_finished(&self) -> bool {
        self.finished.get()
    }

    /// Consume a pending cancellation request.
    pub fn take_cancel_request(&self) -> bool {
        self.must_cancel.replace(false)
    }

    pub fn set_waiter(&self, waiter: Rc<dyn Cancel>) {
        *self.waiter.borrow_mut() = Some(waiter);
    }

    /// Mark the task as having a step queued. Returns `false` if one already
    /// was.
    pub fn mark_scheduled(&self) -> bool {
        !self.scheduled.replace(true)
    }

    /// Run the computation until it next suspends. Returns `true` once the
    /// task has finished.
    pub fn step(self: &Rc<Self>, event_loop: &EventLoop) -> bool {
        self.scheduled.set(false);

        if self.finished.get() {
            return true;
        }

        let waiter = self.waiter.borrow_mut().take();
        drop(waiter);

        let Some(mut computation) = self.computation.borrow_mut().take() else {
            return self.finished.get();
        };

        let poll = if !self.started.replace(true) && self.must_cancel.replace(false) {
            computation.abandon();
            Poll::Ready(Completion::Cancelled)
        } else {
            let mut cx = Context::from_waker(&self.waker);
            let previous = event_loop.set_current_task(Some(self.clone()));
            let poll = computation.step(&mut cx, &self.must_cancel);
            event_loop.set_current_task(previous);
            poll
        };

        match poll {
            Poll::Pending => {
                trace!("{} suspended", self.id);
                *self.computation.borrow_mut() = Some(computation);
                false
            }
            Poll::Ready(completion) => {
                debug!("{} finished: {completion:?}", self.id);
                self.finished.set(true);
                drop(computation);
                true
            }
        }
    }

    /// Drop the computation of a task that will never run again.
    pub fn discard(&self) {
        let computation = self.computation.borrow_mut().take();

        if computation.is_some() && !self.finished.get() {
            warn!("{} was destroyed but it is pending", self.id);
        }

        self.waiter.borrow_mut().take();
        drop(computation);
    }
}

impl Cancel for TaskCore {
    fn cancel(&self) -> bool {
        if self.finished.get() {
            return false;
        }

        debug!("cancelling {}", self.id);

        let waiter = self.waiter.borrow_mut().take();

        if let Some(waiter) = waiter {
            if waiter.cancel() {
                return true;
            }
        }

        self.must_cancel.set(true);
        self.waker.wake_by_ref();

        true
    }

    fn task_id(&self) -> Option<TaskId> {
        Some(self.id)
    }
}

impl Drop for TaskCore {
    fn drop(&mut self) {
        if self.computation.get_mut().is_some() && !self.finished.get() {
            warn!("{} was destroyed but it is pending", self.id);
        }
    }
}

struct TaskWaker {
    event_loop: usize,
    key: usize,
    id: TaskId,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        match EventLoop::lookup(self.event_loop) {
            Some(event_loop) => event_loop.wake_task(self.key, self.id),
            None => warn!(
                "wakeup for {} dropped: its event loop is gone or lives on another thread",
                self.id
            ),
        }
    }
}

/// A running computation and the cell that will hold its result.
///
/// Tasks are created with [EventLoop::create_task] or [crate::create_task].
/// Awaiting a task yields a clone of its result; any number of computations
/// may await the same task.
pub struct Task<T> {
    core: Rc<TaskCore>,
    result: Future<T>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            result: self.result.clone(),
        }
    }
}

impl<T: 'static> Task<T> {
    pub(crate) fn spawn<F, E>(event_loop: &EventLoop, computation: F) -> Self
    where
        F: StdFuture<Output = Result<T, E>> + 'static,
        E: Into<Error> + 'static,
    {
        let id = event_loop.next_task_id();
        let result = Future::with_loop(event_loop.downgrade(), Some(id));
        let driver = Box::new(Driver {
            computation: Box::pin(computation),
            result: result.clone(),
        });

        let core = event_loop.insert_task(|key| TaskCore::new(id, key, event_loop, driver));

        event_loop.schedule_step(&core);
        debug!("{id} created");

        Self { core, result }
    }

    pub fn id(&self) -> TaskId {
        self.core.id()
    }

    pub fn done(&self) -> bool {
        self.result.done()
    }

    pub fn cancelled(&self) -> bool {
        self.result.cancelled()
    }

    /// Request cancellation. Returns `false` if the task already finished.
    pub fn cancel(&self) -> bool {
        self.core.cancel()
    }

    pub fn exception(&self) -> Result<Option<Error>, Error> {
        self.result.exception()
    }

    pub fn add_done_callback(&self, f: impl FnOnce(&Future<T>) + 'static) {
        self.result.add_done_callback(f);
    }
}

impl<T: Clone + 'static> Task<T> {
    pub fn result(&self) -> Result<T, Error> {
        self.result.result()
    }
}

impl<T: Clone + 'static> StdFuture for Task<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this: &Self = &self;

        this.result.poll_with(cx, || this.core.clone() as Rc<dyn Cancel>)
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.core.id)
            .field("result", &self.result)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc, time::Duration};

    use anyhow::anyhow;

    use crate::{
        clock::Clock,
        error::{Error, LoopError},
        event_loop::tests::virtual_loop,
        futures::timer::{sleep, sleep_with},
    };

    type Log = Rc<RefCell<Vec<String>>>;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn sequential_sleeps_add_up() {
        let (lp, clock) = virtual_loop();
        let log: Log = Rc::default();

        let total = {
            let log = log.clone();
            lp.run(async move {
                let mut total = 0;
                for (name, n) in [("A", 2), ("B", 2), ("C", 3), ("D", 1)] {
                    sleep(secs(n)).await?;
                    log.borrow_mut().push(name.to_string());
                    total += n;
                }
                Ok::<_, Error>(total)
            })
            .unwrap()
        };

        assert_eq!(total, 8);
        assert_eq!(*log.borrow(), vec!["A", "B", "C", "D"]);
        assert_eq!(clock.now(), secs(8));
    }

    #[test]
    fn concurrent_tasks_overlap() {
        let (lp, clock) = virtual_loop();
        let log: Log = Rc::default();

        let results = {
            let lp2 = lp.clone();
            let log = log.clone();
            lp.run(async move {
                let mut tasks = Vec::new();
                for (name, n) in [("A", 2), ("B", 2), ("C", 3), ("D", 1)] {
                    let log = log.clone();
                    tasks.push(lp2.create_task(async move {
                        sleep(secs(n)).await?;
                        log.borrow_mut().push(name.to_string());
                        Ok::<_, Error>(name)
                    }));
                }

                let mut results = Vec::new();
                for task in tasks {
                    results.push(task.await?);
                }
                Ok::<_, Error>(results)
            })
            .unwrap()
        };

        assert_eq!(results, vec!["A", "B", "C", "D"]);
        assert_eq!(*log.borrow(), vec!["D", "A", "B", "C"]);
        assert_eq!(clock.now(), secs(3));
    }

    #[test]
    fn sleep_with_yields_value() {
        let (lp, clock) = virtual_loop();

        let v = lp.run(sleep_with(secs(2), 42)).unwrap();

        assert_eq!(v, 42);
        assert!(clock.now() >= secs(2));
    }

    #[test]
    fn awaiting_finished_work_does_not_suspend() {
        let (lp, clock) = virtual_loop();

        let v = {
            let lp2 = lp.clone();
            lp.run(async move {
                let fut = lp2.create_future::<u32>();
                fut.set_result(5).unwrap();

                let task = lp2.create_task(async { Ok::<_, Error>(6) });
                sleep(secs(1)).await?;
                assert!(task.done());

                let before = lp2.time();
                let v = fut.await? + task.await?;
                assert_eq!(lp2.time(), before);
                Ok::<_, Error>(v)
            })
            .unwrap()
        };

        assert_eq!(v, 11);
        assert_eq!(clock.now(), secs(1));
    }

    #[test]
    fn cancel_before_first_step_skips_body() {
        let (lp, _) = virtual_loop();
        let ran = Rc::new(RefCell::new(false));

        let task = {
            let ran = ran.clone();
            lp.create_task(async move {
                *ran.borrow_mut() = true;
                Ok::<_, Error>(())
            })
        };

        assert!(task.cancel());

        lp.run_once().unwrap();

        assert!(task.done());
        assert!(task.cancelled());
        assert!(!*ran.borrow());
        assert!(matches!(task.result(), Err(Error::Cancelled)));
        assert!(!task.cancel());
    }

    #[test]
    fn cancel_while_sleeping() {
        let (lp, clock) = virtual_loop();
        let log: Log = Rc::default();

        let sleeper = {
            let log = log.clone();
            lp.create_task(async move {
                log.borrow_mut().push("start".into());
                sleep(secs(10)).await?;
                log.borrow_mut().push("woke".into());
                Ok::<_, Error>(())
            })
        };

        let outcome = {
            let lp2 = lp.clone();
            let sleeper = sleeper.clone();
            lp.run(async move {
                sleep(secs(1)).await?;
                assert!(sleeper.cancel());
                let outcome = sleeper.clone().await;
                assert_eq!(lp2.time(), secs(1));
                Ok::<_, Error>(outcome)
            })
            .unwrap()
        };

        assert!(matches!(outcome, Err(Error::Cancelled)));
        assert!(sleeper.cancelled());
        assert_eq!(*log.borrow(), vec!["start"]);
        assert_eq!(clock.now(), secs(1));
    }

    #[test]
    fn cancelling_one_awaiter_leaves_a_shared_future_alone() {
        let (lp, _) = virtual_loop();
        let shared = lp.create_future::<u32>();

        let first = lp.create_task(shared.clone());
        let second = lp.create_task(shared.clone());

        let outcomes = {
            let lp2 = lp.clone();
            let (first, second, shared) = (first.clone(), second.clone(), shared.clone());
            lp.run(async move {
                sleep(secs(1)).await?;
                assert!(first.cancel());
                sleep(Duration::ZERO).await?;

                assert!(first.cancelled());
                assert!(!shared.done());

                lp2.call_soon(move || shared.set_result(5).unwrap());
                Ok::<_, Error>((first.clone().await, second.clone().await))
            })
            .unwrap()
        };

        assert!(matches!(outcomes.0, Err(Error::Cancelled)));
        assert_eq!(outcomes.1.unwrap(), 5);
        assert!(!second.cancelled());
        assert_eq!(shared.result().unwrap(), 5);
    }

    #[test]
    fn computation_may_swallow_cancellation() {
        let (lp, _) = virtual_loop();

        let worker = lp.create_task(async move {
            match sleep(secs(10)).await {
                Err(e) if e.is_cancelled() => {}
                other => other?,
            }
            sleep(secs(1)).await?;
            Ok::<_, Error>("recovered")
        });

        let result = {
            let worker = worker.clone();
            lp.run(async move {
                sleep(secs(1)).await?;
                worker.cancel();
                worker.await
            })
        };

        assert_eq!(result.unwrap(), "recovered");
        assert!(!worker.cancelled());
    }

    #[test]
    fn cancel_request_survives_until_next_await() {
        let (lp, _) = virtual_loop();

        let result = {
            let lp2 = lp.clone();
            lp.run(async move {
                let me = Rc::new(RefCell::new(None));
                let task = {
                    let me = me.clone();
                    lp2.create_task(async move {
                        let this: Option<crate::task::Task<()>> = me.borrow().clone();
                        if let Some(this) = this {
                            this.cancel();
                        }
                        // The request is delivered here.
                        sleep(Duration::ZERO).await?;
                        Ok::<_, Error>(())
                    })
                };
                *me.borrow_mut() = Some(task.clone());
                task.await
            })
        };

        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn errors_propagate_to_awaiters() {
        let (lp, _) = virtual_loop();

        let result = {
            let lp2 = lp.clone();
            lp.run(async move {
                let failing = lp2.create_task(async {
                    sleep(secs(1)).await?;
                    Err::<u32, _>(anyhow!("exploded"))
                });

                let first = failing.clone().await;
                let second = failing.await;
                assert!(matches!(&second, Err(Error::Task(e)) if e.to_string() == "exploded"));
                first
            })
        };

        assert!(matches!(result, Err(Error::Task(e)) if e.to_string() == "exploded"));
    }

    #[test]
    fn task_cannot_await_itself() {
        let (lp, _) = virtual_loop();
        let slot = Rc::new(RefCell::new(None));

        let task = {
            let slot = slot.clone();
            lp.create_task(async move {
                let this: Option<crate::task::Task<()>> = slot.borrow().clone();
                match this {
                    Some(this) => this.await,
                    None => Ok(()),
                }
            })
        };
        *slot.borrow_mut() = Some(task.clone());

        let result = lp.run_until_complete(&task);
        slot.borrow_mut().take();

        assert!(matches!(result, Err(Error::InvalidState(_))));
    }

    #[test]
    fn nested_run_is_rejected() {
        let (lp, _) = virtual_loop();

        let inner = {
            let lp2 = lp.clone();
            lp.run(async move { Ok::<_, Error>(lp2.run(async { Ok::<_, Error>(1) })) })
                .unwrap()
        };

        assert!(matches!(inner, Err(Error::InvalidState(_))));
    }

    #[test]
    fn waiting_on_nothing_is_a_stall() {
        let (lp, _) = virtual_loop();
        let fut = lp.create_future::<()>();

        let result = lp.run(fut);

        assert!(matches!(result, Err(Error::Loop(e)) if matches!(*e, LoopError::Stalled)));
    }

    #[test]
    fn zero_sleeps_interleave_fairly() {
        let (lp, clock) = virtual_loop();
        let log: Log = Rc::default();

        {
            let lp2 = lp.clone();
            let log = log.clone();
            lp.run(async move {
                let mut tasks = Vec::new();
                for name in ["a", "b"] {
                    let log = log.clone();
                    tasks.push(lp2.create_task(async move {
                        for i in 0..3 {
                            log.borrow_mut().push(format!("{name}{i}"));
                            sleep(Duration::ZERO).await?;
                        }
                        Ok::<_, Error>(())
                    }));
                }
                for task in tasks {
                    task.await?;
                }
                Ok::<_, Error>(())
            })
            .unwrap();
        }

        assert_eq!(*log.borrow(), vec!["a0", "b0", "a1", "b1", "a2", "b2"]);
        assert_eq!(clock.now(), Duration::ZERO);
    }

    #[test]
    fn done_callback_sees_task_result() {
        let (lp, _) = virtual_loop();
        let seen = Rc::new(RefCell::new(None));

        let task = lp.create_task(async { Ok::<_, Error>(9) });
        {
            let seen = seen.clone();
            task.add_done_callback(move |f| *seen.borrow_mut() = Some(f.result().unwrap()));
        }

        lp.run_until_complete(&task).unwrap();
        lp.run_once().unwrap();

        assert_eq!(*seen.borrow(), Some(9));
    }
}
