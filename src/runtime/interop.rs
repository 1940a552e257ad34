use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use log::debug;
use log::info;

use super::Runtime;
use crate::accessor::pack_element;
use crate::accessor::Accessor;
use crate::balance::balance;
use crate::balance::WeightedTask;
use crate::collection::Collection;
use crate::collection::CollectionRef;
use crate::collection::HostCollection;
use crate::collection::IndexInfo;
use crate::communication::Communicator;
use crate::communication::Rank;
use crate::migrate::migrate;
use crate::migrate::MigrationOut;
use crate::phase::LocalIndex;
use crate::phase::Phase;

impl<C: Communicator> Runtime<C> {
    /// A phase over `size` elements with the initial block
    /// distribution `index / (size / ranks)`.
    pub fn make_phase(&mut self, size: usize) -> Phase {
        let (mapping, local_indices) = self.make_rank_mapping(size);
        Phase {
            size,
            index_to_rank_mapping: mapping,
            local: local_indices.into_iter().map(LocalIndex::new).collect(),
        }
    }

    /// A phase that inherits ownership from a host-side collection.
    pub fn make_phase_from_host<T>(&mut self, host: &HostCollection<T>) -> Phase {
        let local_indices: Vec<usize> = host.local_elements().keys().copied().collect();
        let mapping = self.make_global_mapping_from_local(host.size(), &local_indices);
        Phase {
            size: host.size(),
            index_to_rank_mapping: mapping,
            local: local_indices.into_iter().map(LocalIndex::new).collect(),
        }
    }

    fn make_rank_mapping(&mut self, size: usize) -> (Vec<IndexInfo>, Vec<usize>) {
        if size % self.size() != 0 {
            panic!("do not yet support collections that do not evenly divide ranks");
        }
        let entries_per_rank = size / self.size();
        let mut local = vec![];
        let mapping = (0..size)
            .map(|index| {
                let rank = (index / entries_per_rank) as Rank;
                if rank == self.rank() {
                    local.push(index);
                }
                IndexInfo {
                    rank,
                    rank_unique_id: (index % entries_per_rank) as u32,
                }
            })
            .collect();
        (mapping, local)
    }

    /// Rebuild the global index mapping from everyone's local index
    /// lists: pad them to a common length with a sentinel, all-gather,
    /// then walk each rank's block handing out dense per-rank ids.
    pub(crate) fn make_global_mapping_from_local(
        &mut self,
        total_size: usize,
        local: &[usize],
    ) -> Vec<IndexInfo> {
        let max_num_local = self.comm.all_reduce_max(local.len() as u64) as usize;
        let mut padded = vec![-1i64; max_num_local];
        for (slot, index) in padded.iter_mut().zip(local) {
            *slot = *index as i64;
        }
        let all_indices = self.comm.all_gather_indices(&padded);

        let mut mapping = vec![IndexInfo::default(); total_size];
        let mut rank_counts = vec![0u32; self.size()];
        for rank in 0..self.size() {
            let block = &all_indices[rank * max_num_local..(rank + 1) * max_num_local];
            for index in block.iter().take_while(|index| **index != -1) {
                let global_index = *index as usize;
                mapping[global_index] = IndexInfo {
                    rank: rank as Rank,
                    rank_unique_id: rank_counts[rank],
                };
                rank_counts[rank] += 1;
            }
        }
        mapping
    }

    /// Rearrange this rank's local slots to the balancer's new
    /// configuration and rebuild the phase's global mapping. Counters
    /// start the next phase at zero.
    pub(crate) fn reset_phase(&mut self, config: &[WeightedTask], phase: &mut Phase) {
        debug!(
            "rank {} previously had {} tasks but now will have {}",
            self.rank(),
            phase.local.len(),
            config.len()
        );
        let old_size = phase.local.len();
        let new_size = config.len();
        for (lidx, task) in phase.local.iter_mut().zip(config) {
            lidx.index = task.index as usize;
            lidx.counters.reset();
        }
        for task in config.iter().skip(old_size) {
            phase.local.push(LocalIndex::new(task.index as usize));
        }
        phase.local.truncate(new_size);

        let local_indices: Vec<usize> = phase.local.iter().map(|lidx| lidx.index).collect();
        phase.index_to_rank_mapping =
            self.make_global_mapping_from_local(phase.size, &local_indices);
    }

    /// Rebalance a phase: drain the task queue, measure, run the
    /// pairwise balancer and install the new mapping. Element state
    /// does not move here; that happens per collection in
    /// `rebalance_collection`.
    pub fn rebalance(&mut self, phase: &mut Phase) {
        self.clear_tasks();
        self.comm.barrier();
        let new_config = balance(&mut self.comm, &self.parameters, &phase.local);
        self.reset_phase(&new_config, phase);
    }

    /// Move element state to the owners the rebalanced phase assigned
    /// and switch the collection over to the new mapping.
    pub fn rebalance_collection<A: Accessor>(
        &mut self,
        phase: &Phase,
        coll: &CollectionRef<A::Element>,
    ) where
        A::Element: Default + 'static,
    {
        self.clear_tasks();
        let t_start = Instant::now();
        let rank = self.rank();
        let mut to_send = vec![];
        let mut sent_indices = vec![];
        let mut to_recv = vec![];
        {
            let coll = coll.borrow();
            for (&index, elem) in coll.local_elements() {
                let new_location = phase.rank_of(index);
                if new_location != rank {
                    to_send.push(MigrationOut {
                        rank: new_location,
                        index,
                        mpi_parent: coll.parent_mpi_rank(index),
                        bytes: pack_element::<A>(&elem.borrow()),
                    });
                    sent_indices.push(index);
                }
            }
            for lidx in phase.local() {
                let old_location = coll.rank_of(lidx.index);
                if old_location != rank {
                    to_recv.push(old_location);
                }
            }
        }
        let num_sends = to_send.len();
        let num_recvs = to_recv.len();
        let received = migrate(&mut self.comm, to_send, &to_recv);

        let mut coll = coll.borrow_mut();
        for migration in received {
            let elem = coll.element_or_emplace(migration.index);
            A::unpack(&mut elem.borrow_mut(), &migration.bytes);
            coll.add_parent_mpi_rank(migration.index, migration.mpi_parent);
        }
        for index in sent_indices {
            coll.remove(index);
            coll.remove_parent_mpi_rank(index);
        }
        coll.set_mapping(phase.mapping().to_vec());

        if self.is_main() {
            info!(
                "load balance migration ({} sends, {} recvs here) took {:.3}ms",
                num_sends,
                num_recvs,
                t_start.elapsed().as_secs_f64() * 1e3
            );
        }
    }

    /// Hand a host-side collection over to the runtime. The first
    /// hand-off adopts the host's elements in place; a host that
    /// already references a runtime collection instead ships every
    /// element from its home rank to its current runtime owner.
    pub fn from_mpi<A: Accessor>(
        &mut self,
        host: HostCollection<A::Element>,
    ) -> CollectionRef<A::Element>
    where
        A::Element: Default + 'static,
    {
        match host.referenced_collection() {
            Some(coll) => {
                self.from_mpi_shuffle::<A>(&host, &coll);
                coll.borrow_mut().assign_mpi_parent(host);
                coll
            }
            None => {
                let id = self.next_collection_id();
                let coll = Rc::new(RefCell::new(Collection::adopted_from_host(
                    id,
                    self.rank(),
                    &host,
                )));
                self.insert_collection(id, coll.clone());
                coll.borrow_mut().assign_mpi_parent(host);
                coll
            }
        }
    }

    fn from_mpi_shuffle<A: Accessor>(
        &mut self,
        host: &HostCollection<A::Element>,
        coll: &CollectionRef<A::Element>,
    ) where
        A::Element: Default + 'static,
    {
        let rank = self.rank();
        let mut to_send = vec![];
        let mut to_recv = vec![];
        {
            let coll = coll.borrow();
            for (&index, elem) in host.local_elements() {
                let new_location = coll.rank_of(index);
                if new_location != rank {
                    debug!(
                        "rank {} sends element {} to its runtime owner {}",
                        rank, index, new_location
                    );
                    to_send.push(MigrationOut {
                        rank: new_location,
                        index,
                        mpi_parent: rank,
                        bytes: pack_element::<A>(&elem.borrow()),
                    });
                }
            }
            for &index in coll.local_elements().keys() {
                let home = coll.parent_mpi_rank(index);
                if home != rank {
                    debug!("rank {} receives element {} from its home {}", rank, index, home);
                    to_recv.push(home);
                }
            }
        }
        let received = migrate(&mut self.comm, to_send, &to_recv);
        let mut coll = coll.borrow_mut();
        for migration in received {
            let elem = coll.element_or_emplace(migration.index);
            A::unpack(&mut elem.borrow_mut(), &migration.bytes);
        }
    }

    /// Ship every element back to the rank that owned it at the last
    /// interop boundary and return the host-side collection. This is a
    /// full barrier.
    pub fn to_mpi<A: Accessor>(
        &mut self,
        coll: &CollectionRef<A::Element>,
    ) -> HostCollection<A::Element>
    where
        A::Element: Default + 'static,
    {
        self.clear_tasks();
        let mut host = coll.borrow_mut().take_mpi_parent().unwrap_or_else(|| {
            panic!("collection cannot return to MPI: no MPI collection was originally moved in")
        });
        let rank = self.rank();
        let mut to_send = vec![];
        let mut to_recv = vec![];
        {
            let coll = coll.borrow();
            for (&index, elem) in coll.local_elements() {
                let home = coll.parent_mpi_rank(index);
                if home != rank {
                    debug!("rank {} sends element {} back home to {}", rank, index, home);
                    to_send.push(MigrationOut {
                        rank: home,
                        index,
                        mpi_parent: home,
                        bytes: pack_element::<A>(&elem.borrow()),
                    });
                }
            }
            for &index in host.local_elements().keys() {
                let old_location = coll.rank_of(index);
                if old_location != rank {
                    debug!(
                        "rank {} receives element {} back from {}",
                        rank, index, old_location
                    );
                    to_recv.push(old_location);
                }
            }
        }
        let received = migrate(&mut self.comm, to_send, &to_recv);
        for migration in received {
            let elem = host.get_local(migration.index);
            A::unpack(&mut elem.borrow_mut(), &migration.bytes);
        }
        host.set_collection(coll.clone());
        host
    }
}
