mod comm_split;
mod heuristics;

use log::debug;

pub(crate) use comm_split::run_balancer;
pub(crate) use heuristics::take_tasks;
pub(crate) use heuristics::trade_tasks;

use crate::communication::Communicator;
use crate::parameters::BalancerParameters;
use crate::perf::WorkReduce;
use crate::phase::LocalIndex;

/// One task in the balancer's books: the cycles measured for it last
/// phase and the global index of the element it runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WeightedTask {
    pub weight: u64,
    pub index: u64,
}

impl WeightedTask {
    pub fn new(weight: u64, index: u64) -> Self {
        Self { weight, index }
    }
}

pub(crate) fn balance<C: Communicator>(
    comm: &mut C,
    params: &BalancerParameters,
    local: &[LocalIndex],
) -> Vec<WeightedTask> {
    let config = local
        .iter()
        .map(|lidx| WeightedTask::new(lidx.counters.get(), lidx.index as u64))
        .collect();
    balance_config(comm, params, config)
}

/// The outer balancing loop: measure the global imbalance, stop when
/// it is small or stuck, otherwise run one pairwise exchange round.
/// Trades keep the per-rank task counts fixed; give/take starts once
/// trades stop helping or from the third round on.
pub(crate) fn balance_config<C: Communicator>(
    comm: &mut C,
    params: &BalancerParameters,
    mut old_config: Vec<WeightedTask>,
) -> Vec<WeightedTask> {
    let mut try_num = 0;
    let mut last_imbalance = 0;
    let allow_trades = true;
    let mut allow_give_take = false;
    loop {
        if try_num >= params.max_num_tries {
            return old_config;
        }

        let local_work: u64 = old_config.iter().map(|task| task.weight).sum();
        debug!(
            "rank {} has total {} from {} tasks",
            comm.rank(),
            local_work,
            old_config.len()
        );

        let global = comm.all_reduce_work(&WorkReduce::from_local_work(
            local_work,
            old_config.len(),
        ));
        let perf_balance = global.total / comm.size() as u64;
        if comm.is_main() {
            debug!(
                "try {} has global={} with max_tasks={} min_work={} max_work={} balanced={}",
                try_num,
                global.total,
                global.max_local_tasks,
                global.min,
                global.max,
                perf_balance
            );
        }

        let new_imbalance = u64::max(
            perf_balance.saturating_sub(global.min),
            global.max.saturating_sub(perf_balance),
        );
        if new_imbalance == last_imbalance {
            if allow_give_take {
                // stuck in a local minimum, stop trying
                return old_config;
            }
            allow_give_take = true;
        }
        last_imbalance = new_imbalance;

        let max_diff = global.max - global.min;
        let max_diff_fraction = max_diff as f64 / perf_balance as f64;
        if max_diff_fraction < params.imbalance_cutoff {
            return old_config;
        }

        allow_give_take = allow_give_take || try_num >= 2;
        // Both partners must sort identically; ties in weight are
        // broken by index to keep the exchange deterministic.
        old_config.sort_by_key(|task| (task.weight, task.index));
        old_config = run_balancer(
            comm,
            params,
            old_config,
            local_work,
            allow_trades,
            allow_give_take,
        );

        try_num += 1;
    }
}
