use std::any::Any;
use std::cell::Cell;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::accessor::SerdeAccessor;
use crate::balance::balance_config;
use crate::balance::WeightedTask;
use crate::collection::CollectionRef;
use crate::collection::HostCollection;
use crate::collection::IndexInfo;
use crate::communication::get_local_worlds;
use crate::communication::LocalWorld;
use crate::communication::Rank;
use crate::parameters::BalancerParameters;
use crate::phase::LocalIndex;
use crate::phase::Phase;
use crate::runtime::ReduceFunctor;
use crate::runtime::Runtime;
use crate::task::Task;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
struct Payload {
    value: i64,
}

type Acc = SerdeAccessor<Payload>;

fn spawn_multi_rank(
    num_ranks: usize,
    body: impl Fn(&mut Runtime<LocalWorld>) + Send + Sync + Clone + 'static,
) -> Vec<thread::Result<()>> {
    get_local_worlds(num_ranks)
        .into_iter()
        .map(|world| {
            let body = body.clone();
            thread::spawn(move || {
                let mut runtime = Runtime::new(world);
                body(&mut runtime);
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|handle| handle.join())
        .collect()
}

fn run_multi_rank(
    num_ranks: usize,
    body: impl Fn(&mut Runtime<LocalWorld>) + Send + Sync + Clone + 'static,
) {
    for result in spawn_multi_rank(num_ranks, body) {
        result.unwrap();
    }
}

fn panic_message(err: Box<dyn Any + Send>) -> String {
    match err.downcast::<String>() {
        Ok(message) => *message,
        Err(err) => err.downcast::<&'static str>().unwrap().to_string(),
    }
}

fn tasks(weights_and_indices: &[(u64, u64)]) -> Vec<WeightedTask> {
    weights_and_indices
        .iter()
        .map(|(weight, index)| WeightedTask::new(*weight, *index))
        .collect()
}

/// Fill a collection's elements for the indices this rank owns in the
/// phase and bind the phase's mapping to it.
fn populate(
    runtime: &Runtime<LocalWorld>,
    coll: &CollectionRef<Payload>,
    phase: &Phase,
    value_of: impl Fn(usize) -> i64,
) {
    for lidx in phase.local() {
        let handle = runtime.get_element(coll, lidx.index);
        handle.element().borrow_mut().value = value_of(lidx.index);
    }
    coll.borrow_mut().set_mapping(phase.mapping().to_vec());
    coll.borrow_mut().set_initialized();
}

#[test]
fn block_mapping_assigns_contiguous_ranges() {
    run_multi_rank(2, |runtime| {
        let phase = runtime.make_phase(4);
        let expected_ranks = [0, 0, 1, 1];
        let expected_unique_ids = [0, 1, 0, 1];
        for index in 0..4 {
            let info = phase.mapping()[index];
            assert_eq!(info.rank, expected_ranks[index]);
            assert_eq!(info.rank_unique_id, expected_unique_ids[index]);
        }
        let local: Vec<_> = phase.local().iter().map(|lidx| lidx.index).collect();
        if runtime.rank() == 0 {
            assert_eq!(local, vec![0, 1]);
        } else {
            assert_eq!(local, vec![2, 3]);
        }
    });
}

#[test]
fn uneven_collection_sizes_are_rejected() {
    let results = spawn_multi_rank(2, |runtime| {
        runtime.make_phase(3);
    });
    for result in results {
        let message = panic_message(result.unwrap_err());
        assert!(message.contains("evenly divide"));
    }
}

#[test]
fn task_panics_propagate_with_their_message() {
    let results = spawn_multi_rank(4, |runtime| {
        if runtime.rank() == 2 {
            let index = 7;
            let task = Task::new(move |_runtime: &mut Runtime<LocalWorld>| {
                panic!("element {} entered an invalid state", index);
            });
            runtime.register_control_task(&task);
        }
    });
    for (rank, result) in results.into_iter().enumerate() {
        if rank == 2 {
            let message = panic_message(result.unwrap_err());
            assert!(message.contains("element 7"));
        } else {
            result.unwrap();
        }
    }
}

// A balanced configuration terminates in the first round without
// moving anything.
#[test]
fn balance_leaves_balanced_work_alone() {
    run_multi_rank(2, |runtime| {
        let config = if runtime.rank() == 0 {
            tasks(&[(10, 0), (10, 1)])
        } else {
            tasks(&[(10, 2), (10, 3)])
        };
        let comm = runtime.communicator_mut();
        let result = balance_config(comm, &BalancerParameters::default(), config.clone());
        assert_eq!(result, config);
    });
}

// Weights {100, 1} vs {1, 1}: the only trade candidates are too far
// from the desired delta and the big task exceeds the give/take
// budget, so the balancer gives up without moving anything.
#[test]
fn balance_gives_up_when_no_move_helps() {
    run_multi_rank(2, |runtime| {
        let rank = runtime.rank();
        let config = if rank == 0 {
            tasks(&[(100, 0), (1, 1)])
        } else {
            tasks(&[(1, 2), (1, 3)])
        };
        let comm = runtime.communicator_mut();
        let result = balance_config(comm, &BalancerParameters::default(), config);
        let mut weights: Vec<_> = result.iter().map(|task| task.weight).collect();
        weights.sort();
        if rank == 0 {
            assert_eq!(weights, vec![1, 100]);
        } else {
            assert_eq!(weights, vec![1, 1]);
        }
    });
}

// Weights {50, 50} vs {10, 10}: the desired delta of 40 is matched
// exactly by trading a 50 for a 10, and the next round is balanced.
#[test]
fn balance_trades_to_even_out_work() {
    run_multi_rank(2, |runtime| {
        let rank = runtime.rank();
        let config = if rank == 0 {
            tasks(&[(50, 0), (50, 1)])
        } else {
            tasks(&[(10, 2), (10, 3)])
        };
        let comm = runtime.communicator_mut();
        let result = balance_config(comm, &BalancerParameters::default(), config);
        if rank == 0 {
            assert_eq!(result, tasks(&[(10, 3), (50, 1)]));
        } else {
            assert_eq!(result, tasks(&[(10, 2), (50, 0)]));
        }
    });
}

// Both partners must arrive at mirrored decisions from the same
// exchanged configurations: together the two sides still hold every
// index exactly once after a trade.
#[test]
fn balance_keeps_partition_disjoint() {
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::sync::Mutex;

    let (sender, receiver) = channel();
    let sender = Arc::new(Mutex::new(sender));
    run_multi_rank(2, move |runtime| {
        let rank = runtime.rank();
        let config = if rank == 0 {
            tasks(&[(90, 2), (17, 0), (44, 3), (3, 1)])
        } else {
            tasks(&[(2, 4), (5, 5), (30, 6), (8, 7)])
        };
        let comm = runtime.communicator_mut();
        let result = balance_config(comm, &BalancerParameters::default(), config);
        sender.lock().unwrap().send(result).unwrap();
    });
    let results: Vec<Vec<WeightedTask>> = receiver.into_iter().take(2).collect();
    let mut all_indices: Vec<u64> = results
        .iter()
        .flatten()
        .map(|task| task.index)
        .collect();
    all_indices.sort();
    assert_eq!(all_indices, vec![0, 1, 2, 3, 4, 5, 6, 7]);
    // something actually moved between the partners
    let final_works: Vec<u64> = results
        .iter()
        .map(|config| config.iter().map(|task| task.weight).sum())
        .collect();
    assert!(final_works.iter().all(|work| *work != 154 && *work != 45));
}

// Running the balancer twice on identical inputs must produce
// identical results on every rank.
#[test]
fn balance_is_deterministic() {
    run_multi_rank(2, |runtime| {
        let rank = runtime.rank();
        let config = if rank == 0 {
            tasks(&[(63, 0), (12, 1), (7, 2), (41, 3)])
        } else {
            tasks(&[(5, 4), (9, 5), (2, 6), (11, 7)])
        };
        let comm = runtime.communicator_mut();
        let first = balance_config(comm, &BalancerParameters::default(), config.clone());
        let second = balance_config(comm, &BalancerParameters::default(), config);
        assert_eq!(first, second);
    });
}

// With one side empty, trading is impossible; once give/take kicks in,
// the heavy side hands over tasks until the remaining budget is
// smaller than the next task.
#[test]
fn balance_gives_tasks_to_idle_ranks() {
    run_multi_rank(2, |runtime| {
        let rank = runtime.rank();
        let config = if rank == 0 {
            tasks(&[(30, 0), (30, 1), (30, 2), (30, 3)])
        } else {
            tasks(&[])
        };
        let comm = runtime.communicator_mut();
        let result = balance_config(comm, &BalancerParameters::default(), config);
        if rank == 0 {
            assert_eq!(result, tasks(&[(30, 0), (30, 1)]));
        } else {
            assert_eq!(result, tasks(&[(30, 2), (30, 3)]));
        }
    });
}

#[test]
fn send_recv_moves_element_state() {
    run_multi_rank(2, |runtime| {
        let phase = runtime.make_phase(2);
        let coll = runtime.make_collection::<Payload>(2);
        populate(runtime, &coll, &phase, |index| index as i64 * 100);
        if runtime.rank() == 0 {
            let handle = runtime.get_element(&coll, 0);
            runtime.make_send_op::<Acc>(&handle, 0, 1);
        } else {
            let handle = runtime.get_element(&coll, 1);
            // local element 1 receives from remote element 0
            runtime.make_recv_op::<Acc>(&handle, 1, 0);
        }
        runtime.clear_dependencies();
        if runtime.rank() == 1 {
            let handle = runtime.get_element(&coll, 1);
            assert_eq!(handle.element().borrow().value, 0);
        }
    });
}

#[test]
fn active_send_fabricates_the_receiver() {
    run_multi_rank(2, |runtime| {
        let phase = runtime.make_phase(2);
        let coll = runtime.make_collection::<Payload>(2);
        populate(runtime, &coll, &phase, |index| index as i64 + 40);
        runtime.register_recv_generator::<Acc>();
        if runtime.rank() == 0 {
            let mut handle = runtime.get_element(&coll, 0);
            runtime.make_active_send_op::<Acc>(&mut handle, 1);

            // a task that depends on the send having left
            let ran = Rc::new(Cell::new(false));
            let flag = ran.clone();
            let task = Task::new(move |_runtime: &mut Runtime<LocalWorld>| {
                flag.set(true);
            });
            thread::sleep(Duration::from_millis(20));
            runtime.progress_engine();
            runtime.register_dependency(&task, &mut handle);
            runtime.register_task(&task);
            runtime.clear_dependencies();
            runtime.clear_tasks();
            assert!(ran.get());
        } else {
            let handle = runtime.get_element(&coll, 1);
            while handle.element().borrow().value != 40 {
                runtime.progress_engine();
                thread::yield_now();
            }
        }
    });
}

#[test]
fn rebalance_migrates_element_state() {
    run_multi_rank(2, |runtime| {
        let rank = runtime.rank();
        let mut phase = runtime.make_phase(4);
        let coll = runtime.make_collection::<Payload>(4);
        populate(runtime, &coll, &phase, |index| index as i64 * 1000);

        // pretend the last phase measured {50, 50} vs {10, 10}
        let weights = if rank == 0 { [50, 50] } else { [10, 10] };
        for (lidx, weight) in phase.local().iter().zip(weights) {
            lidx.counters.add(weight);
        }
        runtime.rebalance(&mut phase);
        runtime.rebalance_collection::<Acc>(&phase, &coll);

        let local: Vec<_> = phase.local().iter().map(|lidx| lidx.index).collect();
        if rank == 0 {
            assert_eq!(local, vec![3, 1]);
        } else {
            assert_eq!(local, vec![2, 0]);
        }
        // counters restart at zero for the new phase
        assert!(phase.local().iter().all(|lidx| lidx.counters.get() == 0));

        let coll = coll.borrow();
        let owned: Vec<_> = coll.local_elements().keys().copied().collect();
        let mut expected = local.clone();
        expected.sort();
        assert_eq!(owned, expected);
        for index in owned {
            assert_eq!(
                coll.local_elements()[&index].borrow().value,
                index as i64 * 1000
            );
        }
        // the collection follows the phase's new mapping, with dense
        // per-rank ids
        for index in 0..4 {
            assert_eq!(coll.rank_of(index), phase.rank_of(index));
        }
        let mut unique_ids: Vec<_> = (0..4)
            .filter(|index| coll.rank_of(*index) == rank)
            .map(|index| coll.index_info(index).rank_unique_id)
            .collect();
        unique_ids.sort();
        assert_eq!(unique_ids, vec![0, 1]);
    });
}

#[test]
fn interop_round_trip_restores_the_hosts() {
    run_multi_rank(2, |runtime| {
        let rank = runtime.rank();
        // rank 0 hosts the even indices, rank 1 the odd ones
        let mut host = HostCollection::<Payload>::new(4);
        let home_indices: Vec<usize> = (0..4).filter(|index| index % 2 == rank as usize).collect();
        for &index in &home_indices {
            host.emplace_local(
                index,
                Payload {
                    value: index as i64 + 1,
                },
            );
        }

        let coll = runtime.from_mpi::<Acc>(host);
        let local_indices: Vec<usize> = coll.borrow().local_elements().keys().copied().collect();
        let mapping = runtime.make_global_mapping_from_local(4, &local_indices);
        coll.borrow_mut().set_mapping(mapping);

        // move every element to the other rank
        let other = 1 - rank;
        let mut mapping = vec![IndexInfo::default(); 4];
        let mut moved_local = vec![];
        for (index, info) in mapping.iter_mut().enumerate() {
            let owner = 1 - (index % 2) as Rank;
            *info = IndexInfo {
                rank: owner,
                rank_unique_id: (index / 2) as u32,
            };
            if owner == rank {
                moved_local.push(index);
            }
        }
        let phase = Phase {
            size: 4,
            index_to_rank_mapping: mapping,
            local: moved_local.iter().copied().map(LocalIndex::new).collect(),
        };
        runtime.rebalance_collection::<Acc>(&phase, &coll);

        {
            let coll = coll.borrow();
            let owned: Vec<_> = coll.local_elements().keys().copied().collect();
            assert_eq!(owned, moved_local);
            for &index in &owned {
                assert_eq!(
                    coll.local_elements()[&index].borrow().value,
                    index as i64 + 1
                );
                // every element remembers the rank it came from
                assert_eq!(coll.parent_mpi_rank(index), other);
            }
        }

        // mutate on the runtime side, then ship everything home
        for elem in coll.borrow().local_elements().values() {
            elem.borrow_mut().value *= 10;
        }
        let host = runtime.to_mpi::<Acc>(&coll);
        for &index in &home_indices {
            assert_eq!(
                host.get_local(index).borrow().value,
                (index as i64 + 1) * 10
            );
        }

        // mutate at home and hand the collection back to the runtime;
        // the shuffle must deliver the updates to the runtime owners
        for elem in host.local_elements().values() {
            elem.borrow_mut().value += 3;
        }
        let coll_again = runtime.from_mpi::<Acc>(host);
        assert!(Rc::ptr_eq(&coll, &coll_again));
        for (&index, elem) in coll.borrow().local_elements().iter() {
            assert_eq!(elem.borrow().value, (index as i64 + 1) * 10 + 3);
        }
    });
}

#[test]
fn to_mpi_without_a_host_is_rejected() {
    let results = spawn_multi_rank(1, |runtime| {
        let coll = runtime.make_collection::<Payload>(1);
        runtime.to_mpi::<Acc>(&coll);
    });
    for result in results {
        let message = panic_message(result.unwrap_err());
        assert!(message.contains("no MPI collection"));
    }
}

#[test]
fn phase_tasks_accumulate_counters_and_run_everywhere() {
    run_multi_rank(2, |runtime| {
        let phase = runtime.make_phase(4);
        let coll = runtime.make_collection::<Payload>(4);
        populate(runtime, &coll, &phase, |_| 0);

        let coll_for_tasks = coll.clone();
        runtime.register_phase_collection(&phase, |index| {
            let coll = coll_for_tasks.clone();
            Task::new(move |runtime: &mut Runtime<LocalWorld>| {
                thread::sleep(Duration::from_millis(1));
                let handle = runtime.get_element(&coll, index);
                handle.element().borrow_mut().value = index as i64 + 1;
            })
        });

        for lidx in phase.local() {
            let handle = runtime.get_element(&coll, lidx.index);
            assert_eq!(handle.element().borrow().value, lidx.index as i64 + 1);
            // the clock ticked while the task ran
            assert!(lidx.counters.get() > 0);
        }
    });
}

struct SumValues;

impl ReduceFunctor<Payload> for SumValues {
    type Out = i64;

    fn identity() -> i64 {
        0
    }

    fn contribute(elem: &Payload, acc: &mut i64) {
        *acc += elem.value;
    }

    fn combine(partial: &i64, acc: &mut i64) {
        *acc += partial;
    }
}

#[test]
fn collectives_reduce_gather_and_broadcast() {
    run_multi_rank(2, |runtime| {
        let rank = runtime.rank();
        let phase = runtime.make_phase(4);
        let coll = runtime.make_collection::<Payload>(4);
        populate(runtime, &coll, &phase, |index| index as i64);

        let total = runtime.register_reduce::<SumValues, _>(&coll);
        assert_eq!(total, 6);

        let gathered = runtime.register_phase_gather::<Acc>(0, &coll);
        if rank == 0 {
            let gathered = gathered.unwrap();
            let indices: Vec<_> = gathered.iter().map(|(index, _)| *index).collect();
            assert_eq!(indices, vec![0, 1, 2, 3]);
            assert!(gathered
                .iter()
                .all(|(index, elem)| elem.value == *index as i64));
        } else {
            assert!(gathered.is_none());
        }

        let handle = runtime.get_element(&coll, if rank == 0 { 0 } else { 2 });
        if rank == 1 {
            handle.element().borrow_mut().value = 77;
        }
        runtime.register_phase_broadcast::<Acc>(1, &handle);
        assert_eq!(handle.element().borrow().value, 77);
    });
}

#[test]
fn global_mapping_reconstruction_handles_uneven_counts() {
    run_multi_rank(2, |runtime| {
        let rank = runtime.rank();
        let mut host = HostCollection::<Payload>::new(6);
        let home_indices: Vec<usize> = if rank == 0 {
            vec![5]
        } else {
            vec![0, 1, 2, 3, 4]
        };
        for &index in &home_indices {
            host.emplace_local(index, Payload::default());
        }
        let phase = runtime.make_phase_from_host(&host);
        assert_eq!(phase.size(), 6);
        for index in 0..6 {
            let info = phase.mapping()[index];
            if index == 5 {
                assert_eq!(info.rank, 0);
                assert_eq!(info.rank_unique_id, 0);
            } else {
                assert_eq!(info.rank, 1);
                assert_eq!(info.rank_unique_id, index as u32);
            }
        }
    });
}
