use crate::collection::IndexInfo;
use crate::communication::Rank;
use crate::perf::PerfCounter;

/// One element slot executed by this rank during the current phase.
/// The counter accumulates the cycles spent running tasks on the
/// element and is what the balancer redistributes by.
pub struct LocalIndex {
    pub index: usize,
    pub counters: PerfCounter,
}

impl LocalIndex {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            counters: PerfCounter::default(),
        }
    }
}

/// A snapshot of element ownership for one round of computation.
/// Collections bind the mapping at phase start; the balancer replaces
/// it between phases.
pub struct Phase {
    pub(crate) size: usize,
    pub(crate) index_to_rank_mapping: Vec<IndexInfo>,
    pub(crate) local: Vec<LocalIndex>,
}

impl Phase {
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn local(&self) -> &[LocalIndex] {
        &self.local
    }

    pub fn rank_of(&self, index: usize) -> Rank {
        self.index_to_rank_mapping[index].rank
    }

    pub fn mapping(&self) -> &[IndexInfo] {
        &self.index_to_rank_mapping
    }
}
