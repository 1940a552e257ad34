use log::debug;

use super::take_tasks;
use super::trade_tasks;
use super::WeightedTask;
use crate::communication::Communicator;
use crate::communication::Tag;
use crate::parameters::BalancerParameters;

const EXCHANGE_TAG: Tag = 451;

fn flatten(config: &[WeightedTask]) -> Vec<u64> {
    config
        .iter()
        .flat_map(|task| [task.weight, task.index])
        .collect()
}

fn unflatten(raw: Vec<u64>) -> Vec<WeightedTask> {
    debug_assert_eq!(raw.len() % 2, 0);
    raw.chunks_exact(2)
        .map(|pair| WeightedTask::new(pair[0], pair[1]))
        .collect()
}

/// One pairwise exchange round. Ranks are ordered by their work in a
/// split communicator; rank `r` of `n` pairs with `n - 1 - r`, so the
/// lightest trades with the heaviest. Partners exchange their full
/// configurations in a single sendrecv and then apply the same
/// decision to both sides, with the roles swapped.
pub(crate) fn run_balancer<C: Communicator>(
    comm: &mut C,
    params: &BalancerParameters,
    mut local_config: Vec<WeightedTask>,
    local_work: u64,
    allow_trades: bool,
    allow_give_take: bool,
) -> Vec<WeightedTask> {
    let key = (local_work / params.work_key_granularity) as i64;
    let order = comm.split_order_by_key(key);
    let balance_rank = order
        .iter()
        .position(|rank| *rank == comm.rank())
        .expect("own rank missing from split order");
    let partner = order.len() - 1 - balance_rank;
    debug!(
        "rank {} with local work {} became rank {} in the split ordering, partner {}",
        comm.rank(),
        local_work,
        balance_rank,
        partner
    );
    if partner == balance_rank {
        // the rank in the middle has nobody to trade with
        return local_config;
    }
    let partner_world_rank = order[partner];

    let incoming = comm.send_receive(partner_world_rank, EXCHANGE_TAG, &flatten(&local_config));
    let incoming_config = unflatten(incoming);
    let partner_work: u64 = incoming_config.iter().map(|task| task.weight).sum();

    debug!(
        "rank {}:{} has {} local and {} partner tasks",
        balance_rank,
        comm.rank(),
        local_config.len(),
        incoming_config.len()
    );

    if local_work < partner_work {
        // the change in task sizes should be half the difference,
        // since one side subtracts what the other adds
        let desired_delta = (partner_work - local_work) / 2;
        let min_closeness = desired_delta / 10;
        let min_exchange_closeness = 2 * desired_delta / 3;
        let mut exchange_failed = true;
        if local_config.len() >= incoming_config.len() && allow_trades {
            // less work but at least as many tasks: trade one big task
            // for a small one without changing either count
            let (big_idx, small_idx, closeness) =
                trade_tasks(desired_delta, &incoming_config, &local_config);
            if closeness < min_exchange_closeness {
                let big = incoming_config[big_idx];
                let small = local_config[small_idx];
                debug!(
                    "rank {}:{} trades small=({},{}) for big=({},{}) at closeness {} to delta {}",
                    balance_rank,
                    comm.rank(),
                    small.weight,
                    small.index,
                    big.weight,
                    big.index,
                    closeness,
                    desired_delta
                );
                local_config[small_idx] = big;
            }
            exchange_failed = closeness > min_closeness;
        }
        if exchange_failed && allow_give_take {
            let mut total_delta = 0;
            for big_idx in take_tasks(desired_delta, &incoming_config) {
                let big = incoming_config[big_idx];
                total_delta += big.weight;
                debug!(
                    "rank {}:{} takes ({},{}) for total {} of delta {}",
                    balance_rank,
                    comm.rank(),
                    big.weight,
                    big.index,
                    total_delta,
                    desired_delta
                );
                local_config.push(big);
            }
        }
    } else if local_work > partner_work {
        let desired_delta = (local_work - partner_work) / 2;
        let min_closeness = desired_delta / 10;
        let min_exchange_closeness = 2 * desired_delta / 3;
        let mut exchange_failed = true;
        if incoming_config.len() >= local_config.len() && allow_trades {
            let (big_idx, small_idx, closeness) =
                trade_tasks(desired_delta, &local_config, &incoming_config);
            if closeness < min_exchange_closeness {
                let big = local_config[big_idx];
                let small = incoming_config[small_idx];
                debug!(
                    "rank {}:{} trades big=({},{}) for small=({},{}) at closeness {} to delta {}",
                    balance_rank,
                    comm.rank(),
                    big.weight,
                    big.index,
                    small.weight,
                    small.index,
                    closeness,
                    desired_delta
                );
                local_config[big_idx] = small;
            }
            exchange_failed = closeness > min_closeness;
        }
        if exchange_failed && allow_give_take {
            let to_give = take_tasks(desired_delta, &local_config);
            let mut total_delta = 0;
            for big_idx in to_give.iter().rev() {
                let big = local_config[*big_idx];
                total_delta += big.weight;
                debug!(
                    "rank {}:{} gives ({},{}) for total {} of delta {}",
                    balance_rank,
                    comm.rank(),
                    big.weight,
                    big.index,
                    total_delta,
                    desired_delta
                );
                local_config.swap_remove(*big_idx);
            }
        }
    }
    // equal work: nothing to do

    local_config
}
