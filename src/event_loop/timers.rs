use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    time::Duration,
};

use crate::handle::{Handle, TimerHandle};

struct Entry {
    when: Duration,
    seq: u64,
    handle: Handle,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.when, self.seq).cmp(&(other.when, other.seq))
    }
}

/// Timers ordered by deadline, ties broken by insertion order.
#[derive(Default)]
pub(crate) struct TimerHeap {
    heap: BinaryHeap<Reverse<Entry>>,
    seq: u64,
}

impl TimerHeap {
    pub fn push(&mut self, when: Duration, handle: Handle) -> TimerHandle {
        let seq = self.seq;
        self.seq += 1;

        self.heap.push(Reverse(Entry {
            when,
            seq,
            handle: handle.clone(),
        }));

        TimerHandle::new(handle, when)
    }

    /// The earliest deadline of a timer that has not been cancelled.
    pub fn next_deadline(&mut self) -> Option<Duration> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if !entry.handle.cancelled() {
                return Some(entry.when);
            }

            self.heap.pop();
        }

        None
    }

    /// Remove every timer whose deadline is at or before `now`, in firing
    /// order. Cancelled timers are dropped silently.
    pub fn pop_due(&mut self, now: Duration) -> Vec<Handle> {
        let mut due = Vec::new();

        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.when > now {
                break;
            }

            if let Some(Reverse(entry)) = self.heap.pop() {
                if !entry.handle.cancelled() {
                    due.push(entry.handle);
                }
            }
        }

        due
    }

    pub fn clear(&mut self) -> Vec<Handle> {
        std::mem::take(&mut self.heap)
            .into_iter()
            .map(|Reverse(entry)| entry.handle)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc, time::Duration};

    use rand::seq::SliceRandom;

    use super::TimerHeap;
    use crate::handle::Handle;

    fn recorder(log: &Rc<RefCell<Vec<usize>>>, label: usize) -> Handle {
        let log = log.clone();
        Handle::new(move || log.borrow_mut().push(label))
    }

    #[test]
    fn fires_in_deadline_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut timers = TimerHeap::default();

        timers.push(Duration::from_secs(3), recorder(&log, 3));
        timers.push(Duration::from_secs(1), recorder(&log, 1));
        timers.push(Duration::from_secs(2), recorder(&log, 2));

        assert_eq!(timers.next_deadline(), Some(Duration::from_secs(1)));
        assert!(timers.pop_due(Duration::from_millis(999)).is_empty());

        for h in timers.pop_due(Duration::from_secs(2)) {
            h.run();
        }
        assert_eq!(*log.borrow(), vec![1, 2]);
        assert_eq!(timers.next_deadline(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn equal_deadlines_fire_in_insertion_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut timers = TimerHeap::default();
        let mut labels: Vec<usize> = (0..100).collect();
        labels.shuffle(&mut rand::thread_rng());

        for label in labels.iter() {
            timers.push(Duration::from_secs(5), recorder(&log, *label));
        }

        for h in timers.pop_due(Duration::from_secs(5)) {
            h.run();
        }

        assert_eq!(*log.borrow(), labels);
    }

    #[test]
    fn cancelled_timers_are_skipped() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut timers = TimerHeap::default();

        let first = timers.push(Duration::from_secs(1), recorder(&log, 1));
        timers.push(Duration::from_secs(2), recorder(&log, 2));

        first.cancel();

        assert_eq!(timers.next_deadline(), Some(Duration::from_secs(2)));

        let due = timers.pop_due(Duration::from_secs(2));
        assert_eq!(due.len(), 1);
        due[0].run();

        assert_eq!(*log.borrow(), vec![2]);
        assert!(timers.next_deadline().is_none());
    }
}
