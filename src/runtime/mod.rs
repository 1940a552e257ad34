mod interop;
mod ops;
mod progress;

pub use ops::ReduceFunctor;

use std::any::Any;
use std::any::TypeId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::collection::AsyncRef;
use crate::collection::Collection;
use crate::collection::CollectionId;
use crate::collection::CollectionRef;
use crate::communication::Communicator;
use crate::communication::Rank;
use crate::communication::Tag;
use crate::parameters::BalancerParameters;
use crate::request::RequestId;
use crate::request::RequestTable;
use crate::task::Task;
use crate::task::TaskEntry;

/// Fabricates the receiver for an active message on the fly, from the
/// destination element id and collection id carried by the tag.
/// Returns the request slot the receive will land in.
pub(crate) type RecvGenerator<C> = Rc<dyn Fn(&mut Runtime<C>, u32, u32) -> RequestId>;

/// The per-rank task runtime: schedules ready tasks, completes their
/// data dependencies through non-blocking messages, and rebalances
/// element ownership between phases.
///
/// Everything is owned by this single instance and driven from its
/// owning thread; transfers make progress only while one of the
/// `progress`/`clear` entry points is running.
pub struct Runtime<C: Communicator> {
    pub(crate) comm: C,
    pub(crate) requests: RequestTable<C>,
    pub(crate) pending_recvs: HashMap<(Rank, Tag), VecDeque<RequestId>>,
    pub(crate) num_pending_probes: usize,
    pub(crate) task_queue: VecDeque<Rc<TaskEntry<C>>>,
    collections: HashMap<CollectionId, Rc<dyn Any>>,
    coll_id_ctr: CollectionId,
    pub(crate) generators: Vec<Option<RecvGenerator<C>>>,
    generator_ids: HashMap<TypeId, u32>,
    pub(crate) parameters: BalancerParameters,
}

impl<C: Communicator> Runtime<C> {
    pub fn new(comm: C) -> Self {
        Self::with_parameters(comm, BalancerParameters::default())
    }

    pub fn with_parameters(comm: C, parameters: BalancerParameters) -> Self {
        Self {
            comm,
            requests: RequestTable::new(),
            pending_recvs: HashMap::new(),
            num_pending_probes: 0,
            task_queue: VecDeque::new(),
            collections: HashMap::new(),
            coll_id_ctr: 0,
            // generator ids start at one; zero in the tag means an
            // ordinary message
            generators: vec![None],
            generator_ids: HashMap::new(),
            parameters,
        }
    }

    pub fn rank(&self) -> Rank {
        self.comm.rank()
    }

    pub fn size(&self) -> usize {
        self.comm.size()
    }

    pub fn is_main(&self) -> bool {
        self.comm.is_main()
    }

    pub fn communicator_mut(&mut self) -> &mut C {
        &mut self.comm
    }

    pub fn make_collection<T: 'static>(&mut self, size: usize) -> CollectionRef<T> {
        let id = self.next_collection_id();
        let coll = Rc::new(RefCell::new(Collection::<T>::new(id, size)));
        self.insert_collection(id, coll.clone());
        coll
    }

    pub(crate) fn next_collection_id(&mut self) -> CollectionId {
        let id = self.coll_id_ctr;
        self.coll_id_ctr += 1;
        id
    }

    pub(crate) fn insert_collection<T: 'static>(
        &mut self,
        id: CollectionId,
        coll: CollectionRef<T>,
    ) {
        self.collections.insert(id, coll);
    }

    /// Look a collection up by the id carried in a message tag.
    pub(crate) fn collection<T: 'static>(&self, id: CollectionId) -> CollectionRef<T> {
        let coll = self
            .collections
            .get(&id)
            .unwrap_or_else(|| panic!("no collection with id {}", id))
            .clone();
        coll.downcast::<RefCell<Collection<T>>>()
            .unwrap_or_else(|_| panic!("collection {} has a different element type", id))
    }

    /// Hand out a reference to an element of a collection. Elements of
    /// an uninitialized collection are created on first access; asking
    /// for a remote element of an initialized collection is not
    /// supported.
    pub fn get_element<T: Default + 'static>(
        &self,
        coll: &CollectionRef<T>,
        index: usize,
    ) -> AsyncRef<T> {
        let elem = {
            let mut coll = coll.borrow_mut();
            match coll.element(index) {
                Some(elem) => elem,
                None => {
                    if coll.initialized() {
                        panic!(
                            "do not yet support remote get_element from collections: index {} on rank {}",
                            index,
                            self.rank()
                        );
                    }
                    coll.element_or_emplace(index)
                }
            }
        };
        AsyncRef::new(elem, Some(coll.clone()))
    }

    /// Queue a task; it runs once its join counter is zero and it
    /// reaches the head of the queue.
    pub fn register_task(&mut self, task: &Task<C>) {
        if task.entry.join_counter() == 0 {
            task.entry.set_queued();
            self.task_queue.push_back(task.entry.clone());
        }
    }

    /// Queue a control task and drain the task queue before returning.
    pub fn register_control_task(&mut self, task: &Task<C>) {
        self.register_task(task);
        self.clear_tasks();
    }

    pub fn register_predicated_task(&mut self, task: &Task<C>) {
        // nothing special for predicated tasks
        self.register_task(task);
        self.clear_tasks();
    }

    /// Fold the transfers recorded in the handle into the task's join
    /// counter. A request that already completed is skipped; a request
    /// someone else listens on is a front-end bug.
    pub fn register_dependency<T>(&mut self, task: &Task<C>, handle: &mut AsyncRef<T>) {
        for request in handle.take_requests() {
            if self.requests.is_cleared(request) {
                // already completed, nothing to wait for
                self.requests.release(request);
            } else if self.requests.is_vacant(request) {
                self.requests.install_listener(
                    request,
                    crate::listener::Listener::Task(task.entry.clone()),
                );
                task.entry.increment_join_counter();
            } else {
                panic!("listener should be null or cleared");
            }
        }
    }

    pub fn flush(&mut self) {
        self.clear_tasks();
    }
}
