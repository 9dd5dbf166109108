use std::collections::VecDeque;

use crate::handle::Handle;

/// FIFO of callbacks that are ready to run.
#[derive(Default)]
pub(crate) struct ReadyQueue {
    queue: VecDeque<Handle>,
}

impl ReadyQueue {
    pub fn push(&mut self, handle: Handle) {
        self.queue.push_back(handle);
    }

    pub fn pop(&mut self) -> Option<Handle> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) -> VecDeque<Handle> {
        std::mem::take(&mut self.queue)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use crate::event_loop::tests::virtual_loop;

    #[test]
    fn callbacks_scheduled_during_a_drain_wait_for_the_next_pass() {
        let (lp, _) = virtual_loop();
        let log = Rc::new(RefCell::new(Vec::new()));

        {
            let log = log.clone();
            let lp2 = lp.clone();
            lp.call_soon(move || {
                log.borrow_mut().push("a");
                let log = log.clone();
                lp2.call_soon(move || log.borrow_mut().push("c"));
            });
        }
        {
            let log = log.clone();
            lp.call_soon(move || log.borrow_mut().push("b"));
        }

        lp.run_once().unwrap();
        assert_eq!(*log.borrow(), vec!["a", "b"]);

        lp.run_once().unwrap();
        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn self_rescheduling_callback_cannot_starve_others() {
        fn spin(lp: crate::event_loop::EventLoop, count: Rc<RefCell<u32>>) {
            *count.borrow_mut() += 1;
            let lp2 = lp.clone();
            lp.call_soon(move || spin(lp2, count));
        }

        let (lp, _) = virtual_loop();
        let spins = Rc::new(RefCell::new(0));
        let other = Rc::new(RefCell::new(false));

        {
            let lp2 = lp.clone();
            let spins = spins.clone();
            lp.call_soon(move || spin(lp2, spins));
        }
        {
            let other = other.clone();
            lp.call_soon(move || *other.borrow_mut() = true);
        }

        lp.run_once().unwrap();

        assert_eq!(*spins.borrow(), 1);
        assert!(*other.borrow());

        lp.close().unwrap();
    }

    #[test]
    fn cancelled_handles_are_skipped() {
        let (lp, _) = virtual_loop();
        let log = Rc::new(RefCell::new(Vec::new()));

        let h = {
            let log = log.clone();
            lp.call_soon(move || log.borrow_mut().push(1))
        };
        {
            let log = log.clone();
            lp.call_soon(move || log.borrow_mut().push(2));
        }

        h.cancel();
        lp.run_once().unwrap();

        assert_eq!(*log.borrow(), vec![2]);
    }
}
