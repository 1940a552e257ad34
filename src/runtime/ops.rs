use std::any::TypeId;
use std::rc::Rc;

use log::debug;

use super::RecvGenerator;
use super::Runtime;
use crate::accessor::pack_element;
use crate::accessor::Accessor;
use crate::collection::AsyncRef;
use crate::collection::CollectionRef;
use crate::communication::Communicator;
use crate::communication::Rank;
use crate::communication::Tag;
use crate::listener::Listener;
use crate::listener::PendingRecv;
use crate::phase::Phase;
use crate::request::RequestId;
use crate::tag::make_unique_tag;
use crate::tag::MAX_TASK_IDS;
use crate::task::Task;

/// Reduction over every element of a collection. `contribute` folds
/// one local element into the accumulator, `combine` merges per-rank
/// accumulators; it must be associative.
pub trait ReduceFunctor<T> {
    type Out: serde::Serialize + serde::de::DeserializeOwned;

    fn identity() -> Self::Out;
    fn contribute(elem: &T, acc: &mut Self::Out);
    fn combine(partial: &Self::Out, acc: &mut Self::Out);
}

impl<C: Communicator> Runtime<C> {
    /// Serialize the element and post the send for it. The buffer
    /// stays alive inside the request until completion is observed.
    pub fn make_send_op<A: Accessor>(
        &mut self,
        handle: &AsyncRef<A::Element>,
        local: usize,
        remote: usize,
    ) where
        A::Element: 'static,
    {
        let parent = handle
            .parent()
            .unwrap_or_else(|| panic!("sending object with no parent collection"))
            .clone();
        let (coll_id, src, dst) = {
            let coll = parent.borrow();
            (coll.id(), coll.index_info(local), coll.index_info(remote))
        };
        let buffer = pack_element::<A>(&handle.element().borrow());
        let tag = make_unique_tag(coll_id, dst.rank_unique_id, src.rank_unique_id, 0);
        debug!("rank {} sending tag {} to {}", self.rank(), tag, dst.rank);
        let request_id = self.requests.allocate();
        let request = self.comm.post_send(dst.rank, tag, buffer);
        self.requests.set_request(request_id, request);
        self.requests
            .install_listener(request_id, Listener::PendingSend);
    }

    /// A send whose tag names a receive generator instead of a
    /// pre-registered receiver; the destination rank fabricates the
    /// receiver when the message is probed. The request id rides in
    /// the handle until `register_dependency` claims it.
    pub fn make_active_send_op<A: Accessor>(&mut self, handle: &mut AsyncRef<A::Element>, remote: usize)
    where
        A::Element: Default + 'static,
    {
        let task_id = self.register_generator_once::<A>();
        let parent = handle
            .parent()
            .unwrap_or_else(|| panic!("sending object with no parent collection"))
            .clone();
        let (coll_id, dst) = {
            let coll = parent.borrow();
            (coll.id(), coll.index_info(remote))
        };
        let buffer = pack_element::<A>(&handle.element().borrow());
        // the source element id does not matter for generated receives
        let tag = make_unique_tag(coll_id, dst.rank_unique_id, 0, task_id);
        debug!(
            "rank {} sending active message tag {} to {}",
            self.rank(),
            tag,
            dst.rank
        );
        let request_id = self.requests.allocate();
        let request = self.comm.post_send(dst.rank, tag, buffer);
        self.requests.set_request(request_id, request);
        handle.add_request(request_id);
    }

    /// Register a receiver for a message that has not arrived yet. The
    /// buffer is allocated once the next probe discovers the size.
    pub fn make_recv_op<A: Accessor>(
        &mut self,
        handle: &AsyncRef<A::Element>,
        local: usize,
        remote: usize,
    ) where
        A::Element: 'static,
    {
        let parent = handle
            .parent()
            .unwrap_or_else(|| panic!("receiving object with no parent collection"))
            .clone();
        let (coll_id, local_info, remote_info) = {
            let coll = parent.borrow();
            (coll.id(), coll.index_info(local), coll.index_info(remote))
        };
        let elem = handle.element().clone();
        let pending = PendingRecv::new(move |bytes| {
            A::unpack(&mut elem.borrow_mut(), &bytes);
        });
        let tag = make_unique_tag(
            coll_id,
            local_info.rank_unique_id,
            remote_info.rank_unique_id,
            0,
        );
        self.add_pending_recv(pending, remote_info.rank, tag);
    }

    pub(crate) fn add_pending_recv(
        &mut self,
        pending: PendingRecv,
        remote_rank: Rank,
        tag: Tag,
    ) -> RequestId {
        let request_id = self.requests.allocate();
        self.requests
            .install_listener(request_id, Listener::PendingRecv(pending));
        self.pending_recvs
            .entry((remote_rank, tag))
            .or_default()
            .push_back(request_id);
        self.num_pending_probes += 1;
        request_id
    }

    /// Make the receive generator for an accessor available on this
    /// rank. Senders register implicitly through
    /// `make_active_send_op`; every receiving rank must call this
    /// before the first active message can arrive, and registration
    /// order must agree across ranks.
    pub fn register_recv_generator<A: Accessor>(&mut self) -> u32
    where
        A::Element: Default + 'static,
    {
        self.register_generator_once::<A>()
    }

    /// Register the receive generator for an accessor once and return
    /// its task id. Ids come from a runtime-wide counter starting at
    /// one and must fit the tag's task id field.
    pub(crate) fn register_generator_once<A: Accessor>(&mut self) -> u32
    where
        A::Element: Default + 'static,
    {
        let key = TypeId::of::<A>();
        if let Some(id) = self.generator_ids.get(&key) {
            return *id;
        }
        let id = self.generators.len() as u32;
        if id >= MAX_TASK_IDS {
            panic!(
                "cannot register more than {} receive generators, the tag's task id field is full",
                MAX_TASK_IDS - 1
            );
        }
        let generator: RecvGenerator<C> = Rc::new(|runtime, dst_id, coll_id| {
            let coll = runtime.collection::<A::Element>(coll_id);
            let rank = runtime.rank();
            let index = coll
                .borrow()
                .global_index_of_local_id(rank, dst_id)
                .unwrap_or_else(|| {
                    panic!(
                        "no local element with id {} in collection {} on rank {}",
                        dst_id, coll_id, rank
                    )
                });
            let elem = coll.borrow_mut().element_or_emplace(index);
            let pending = PendingRecv::new(move |bytes| {
                A::unpack(&mut elem.borrow_mut(), &bytes);
            });
            let request_id = runtime.requests.allocate();
            runtime
                .requests
                .install_listener(request_id, Listener::PendingRecv(pending));
            request_id
        });
        self.generators.push(Some(generator));
        self.generator_ids.insert(key, id);
        id
    }

    /// Generate one task per element this rank executes in the phase,
    /// charge it to the element's counter, and run the whole batch to
    /// completion.
    pub fn register_phase_collection(
        &mut self,
        phase: &Phase,
        mut generate: impl FnMut(usize) -> Task<C>,
    ) {
        self.clear_tasks();
        for lidx in phase.local() {
            let task = generate(lidx.index);
            // tasks generated for a phase cannot have dependencies
            task.entry.set_counters(lidx.counters.clone());
            task.entry.set_queued();
            self.task_queue.push_back(task.entry.clone());
        }
        self.clear_tasks();
    }

    /// Fold all elements of the collection into one value on every
    /// rank.
    pub fn register_reduce<F, T>(&mut self, coll: &CollectionRef<T>) -> F::Out
    where
        F: ReduceFunctor<T>,
    {
        self.clear_tasks();
        let mut local = F::identity();
        for elem in coll.borrow().local_elements().values() {
            F::contribute(&elem.borrow(), &mut local);
        }
        let bytes = bincode::serialize(&local).unwrap();
        let mut result = F::identity();
        for partial in self.comm.all_gather_bytes(&bytes) {
            F::combine(&bincode::deserialize(&partial).unwrap(), &mut result);
        }
        result
    }

    /// Collect every element of the collection on `root`, in index
    /// order.
    pub fn register_phase_gather<A: Accessor>(
        &mut self,
        root: Rank,
        coll: &CollectionRef<A::Element>,
    ) -> Option<Vec<(usize, A::Element)>>
    where
        A::Element: Default + 'static,
    {
        self.clear_tasks();
        let payload: Vec<(u64, Vec<u8>)> = coll
            .borrow()
            .local_elements()
            .iter()
            .map(|(index, elem)| (*index as u64, pack_element::<A>(&elem.borrow())))
            .collect();
        let bytes = bincode::serialize(&payload).unwrap();
        self.comm.gather_bytes(root, &bytes).map(|per_rank| {
            let mut gathered = vec![];
            for bytes in per_rank {
                let payload: Vec<(u64, Vec<u8>)> = bincode::deserialize(&bytes).unwrap();
                for (index, packed) in payload {
                    let mut elem = A::Element::default();
                    A::unpack(&mut elem, &packed);
                    gathered.push((index as usize, elem));
                }
            }
            gathered.sort_by_key(|(index, _)| *index);
            gathered
        })
    }

    /// Broadcast one element's state from `root` into everyone's
    /// handle.
    pub fn register_phase_broadcast<A: Accessor>(&mut self, root: Rank, handle: &AsyncRef<A::Element>)
    where
        A::Element: 'static,
    {
        self.clear_tasks();
        if self.rank() == root {
            let bytes = pack_element::<A>(&handle.element().borrow());
            self.comm.broadcast_bytes(root, Some(&bytes));
        } else {
            let bytes = self.comm.broadcast_bytes(root, None);
            A::unpack(&mut handle.element().borrow_mut(), &bytes);
        }
    }
}
