use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;

use crate::communication::Communicator;
use crate::perf::PerfCounter;
use crate::runtime::Runtime;

/// A unit of work waiting on its dependencies. The join counter holds
/// the number of outstanding transfers the task still waits for; the
/// task becomes runnable when it reaches zero.
pub struct Task<C: Communicator> {
    pub(crate) entry: Rc<TaskEntry<C>>,
}

impl<C: Communicator> Task<C> {
    pub fn new(body: impl FnOnce(&mut Runtime<C>) + 'static) -> Self {
        Self {
            entry: Rc::new(TaskEntry {
                join_counter: Cell::new(0),
                queued: Cell::new(false),
                body: RefCell::new(Some(Box::new(body))),
                counters: RefCell::new(None),
            }),
        }
    }

    pub fn join_counter(&self) -> usize {
        self.entry.join_counter.get()
    }
}

pub(crate) struct TaskEntry<C: Communicator> {
    join_counter: Cell<usize>,
    queued: Cell<bool>,
    body: RefCell<Option<Box<dyn FnOnce(&mut Runtime<C>)>>>,
    counters: RefCell<Option<PerfCounter>>,
}

impl<C: Communicator> TaskEntry<C> {
    pub fn join_counter(&self) -> usize {
        self.join_counter.get()
    }

    pub fn increment_join_counter(&self) {
        self.join_counter.set(self.join_counter.get() + 1);
    }

    pub fn decrement_join_counter(&self) -> usize {
        let count = self.join_counter.get() - 1;
        self.join_counter.set(count);
        count
    }

    pub fn is_queued(&self) -> bool {
        self.queued.get()
    }

    pub fn set_queued(&self) {
        self.queued.set(true);
    }

    pub fn set_counters(&self, counters: PerfCounter) {
        *self.counters.borrow_mut() = Some(counters);
    }

    pub fn add_counter(&self, cycles: u64) {
        if let Some(counters) = self.counters.borrow().as_ref() {
            counters.add(cycles);
        }
    }

    pub fn take_body(&self) -> Option<Box<dyn FnOnce(&mut Runtime<C>)>> {
        self.body.borrow_mut().take()
    }
}
