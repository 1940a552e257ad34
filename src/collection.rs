use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::communication::Rank;
use crate::request::RequestId;

pub type CollectionId = u32;

/// A shared handle to one element's state. Elements are owned by
/// their collection and borrowed by the tasks that run on them.
pub type ElementRef<T> = Rc<RefCell<T>>;

pub type CollectionRef<T> = Rc<RefCell<Collection<T>>>;

/// Where an element lives: the owning rank and the element's dense id
/// within that rank, which is what the tag encoder addresses it by.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexInfo {
    pub rank: Rank,
    pub rank_unique_id: u32,
}

/// A distributed map from the contiguous indices `0..size` to element
/// state, partitioned across ranks. Exactly one rank owns each index
/// at any moment; ownership moves only through migration, which always
/// pairs a sender with a receiver.
pub struct Collection<T> {
    id: CollectionId,
    size: usize,
    index_mapping: Vec<IndexInfo>,
    local_elements: BTreeMap<usize, ElementRef<T>>,
    parent_mpi_ranks: BTreeMap<usize, Rank>,
    initialized: bool,
    mpi_parent: Option<HostCollection<T>>,
}

impl<T> Collection<T> {
    pub(crate) fn new(id: CollectionId, size: usize) -> Self {
        Self {
            id,
            size,
            index_mapping: vec![],
            local_elements: BTreeMap::new(),
            parent_mpi_ranks: BTreeMap::new(),
            initialized: false,
            mpi_parent: None,
        }
    }

    /// Adopt the elements of a host-side collection on this rank. The
    /// elements are shared, not copied, and every index remembers the
    /// adopting rank as its home.
    pub(crate) fn adopted_from_host(id: CollectionId, rank: Rank, host: &HostCollection<T>) -> Self {
        let local_elements: BTreeMap<_, _> = host
            .local_elements()
            .iter()
            .map(|(index, elem)| (*index, elem.clone()))
            .collect();
        let parent_mpi_ranks = local_elements.keys().map(|index| (*index, rank)).collect();
        Self {
            id,
            size: host.size(),
            index_mapping: vec![],
            local_elements,
            parent_mpi_ranks,
            initialized: true,
            mpi_parent: None,
        }
    }

    pub fn id(&self) -> CollectionId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn rank_of(&self, index: usize) -> Rank {
        self.index_info(index).rank
    }

    pub fn index_info(&self, index: usize) -> IndexInfo {
        if index >= self.index_mapping.len() {
            panic!(
                "index {} is greater than mapping size {}",
                index,
                self.index_mapping.len()
            );
        }
        self.index_mapping[index]
    }

    /// The global index of the element this rank addresses by the
    /// given dense id, if any.
    pub(crate) fn global_index_of_local_id(&self, rank: Rank, rank_unique_id: u32) -> Option<usize> {
        self.index_mapping
            .iter()
            .position(|info| info.rank == rank && info.rank_unique_id == rank_unique_id)
    }

    pub fn element(&self, index: usize) -> Option<ElementRef<T>> {
        self.local_elements.get(&index).cloned()
    }

    pub fn local_elements(&self) -> &BTreeMap<usize, ElementRef<T>> {
        &self.local_elements
    }

    pub(crate) fn remove(&mut self, index: usize) {
        self.local_elements.remove(&index);
    }

    pub fn initialized(&self) -> bool {
        self.initialized
    }

    pub fn set_initialized(&mut self) {
        self.initialized = true;
    }

    /// Bind the ownership mapping of a phase to this collection.
    pub(crate) fn set_mapping(&mut self, mapping: Vec<IndexInfo>) {
        self.index_mapping = mapping;
    }

    pub fn parent_mpi_rank(&self, index: usize) -> Rank {
        self.parent_mpi_ranks.get(&index).copied().unwrap_or(-1)
    }

    pub(crate) fn add_parent_mpi_rank(&mut self, index: usize, rank: Rank) {
        self.parent_mpi_ranks.insert(index, rank);
    }

    pub(crate) fn remove_parent_mpi_rank(&mut self, index: usize) {
        self.parent_mpi_ranks.remove(&index);
    }

    pub fn has_mpi_parent(&self) -> bool {
        self.mpi_parent.is_some()
    }

    pub(crate) fn assign_mpi_parent(&mut self, host: HostCollection<T>) {
        self.mpi_parent = Some(host);
    }

    pub(crate) fn take_mpi_parent(&mut self) -> Option<HostCollection<T>> {
        self.mpi_parent.take()
    }
}

impl<T: Default> Collection<T> {
    pub(crate) fn element_or_emplace(&mut self, index: usize) -> ElementRef<T> {
        self.local_elements
            .entry(index)
            .or_insert_with(|| Rc::new(RefCell::new(T::default())))
            .clone()
    }
}

/// The host ("MPI-side") view of a collection, used to hand element
/// ownership over to the runtime and to take it back. The host keeps
/// its elements while the runtime works on them.
pub struct HostCollection<T> {
    size: usize,
    local_elements: BTreeMap<usize, ElementRef<T>>,
    referenced: Option<CollectionRef<T>>,
}

impl<T> HostCollection<T> {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            local_elements: BTreeMap::new(),
            referenced: None,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn local_elements(&self) -> &BTreeMap<usize, ElementRef<T>> {
        &self.local_elements
    }

    pub fn emplace_local(&mut self, index: usize, elem: T) -> ElementRef<T> {
        let elem = Rc::new(RefCell::new(elem));
        self.local_elements.insert(index, elem.clone());
        elem
    }

    pub fn get_local(&self, index: usize) -> ElementRef<T> {
        self.local_elements
            .get(&index)
            .cloned()
            .unwrap_or_else(|| panic!("no local element at index {}", index))
    }

    pub fn references_collection(&self) -> bool {
        self.referenced.is_some()
    }

    pub(crate) fn referenced_collection(&self) -> Option<CollectionRef<T>> {
        self.referenced.clone()
    }

    pub(crate) fn set_collection(&mut self, coll: CollectionRef<T>) {
        self.referenced = Some(coll);
    }
}

/// A handle to one element together with the in-flight transfers that
/// have been issued against it. The recorded request ids must be
/// folded into a task's join counter with `register_dependency` before
/// the next progress step.
pub struct AsyncRef<T> {
    elem: ElementRef<T>,
    parent: Option<CollectionRef<T>>,
    pending_requests: Vec<RequestId>,
}

impl<T> AsyncRef<T> {
    pub(crate) fn new(elem: ElementRef<T>, parent: Option<CollectionRef<T>>) -> Self {
        Self {
            elem,
            parent,
            pending_requests: vec![],
        }
    }

    pub fn element(&self) -> &ElementRef<T> {
        &self.elem
    }

    pub(crate) fn parent(&self) -> Option<&CollectionRef<T>> {
        self.parent.as_ref()
    }

    pub(crate) fn add_request(&mut self, request: RequestId) {
        self.pending_requests.push(request);
    }

    pub(crate) fn take_requests(&mut self) -> Vec<RequestId> {
        std::mem::take(&mut self.pending_requests)
    }
}
