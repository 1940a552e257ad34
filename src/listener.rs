use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;

use crate::communication::Communicator;
use crate::task::TaskEntry;

/// Whoever waits on a request completing: a task whose join counter it
/// feeds, a send holding its buffer until the transfer finished, or a
/// receiver that unpacks the incoming payload.
pub(crate) enum Listener<C: Communicator> {
    Task(Rc<TaskEntry<C>>),
    PendingSend,
    PendingRecv(PendingRecv),
}

/// A receiver registered before its message has arrived. Completion
/// decrements the join counter; at zero the payload is handed to the
/// unpacker and the receiver is destroyed.
pub(crate) struct PendingRecv {
    join_counter: Cell<usize>,
    unpack: RefCell<Option<Box<dyn FnOnce(Vec<u8>)>>>,
}

impl PendingRecv {
    pub fn new(unpack: impl FnOnce(Vec<u8>) + 'static) -> Self {
        Self {
            join_counter: Cell::new(1),
            unpack: RefCell::new(Some(Box::new(unpack))),
        }
    }

    pub fn decrement_join_counter(&self) -> usize {
        let count = self.join_counter.get() - 1;
        self.join_counter.set(count);
        count
    }

    pub fn finalize(&self, bytes: Vec<u8>) {
        let unpack = self
            .unpack
            .borrow_mut()
            .take()
            .expect("pending recv finalized twice");
        unpack(bytes);
    }
}
