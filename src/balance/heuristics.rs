use log::debug;

use super::WeightedTask;

/// Find the pair of one big task (on the heavier rank) and one small
/// task (on the lighter rank) whose size difference comes closest to
/// `desired_delta`. Both inputs must be sorted ascending by weight.
///
/// Walks with two pointers from the smallest task on the light side
/// and the biggest task on the heavy side, advancing whichever pointer
/// changes the difference least, and stops as soon as a candidate gets
/// worse than the best seen. Returns `(big_idx, small_idx, closeness)`
/// where closeness is `|difference - desired_delta|` for the chosen
/// pair.
pub(crate) fn trade_tasks(
    desired_delta: u64,
    bigger: &[WeightedTask],
    smaller: &[WeightedTask],
) -> (usize, usize, u64) {
    if bigger.is_empty() || smaller.is_empty() {
        return (0, 0, u64::MAX);
    }
    let mut small_idx = 0;
    let small_stop = smaller.len() - 1;
    let mut big_idx = bigger.len() as isize - 1;
    let mut best_big_idx = big_idx;
    let mut best_small_idx = small_idx;
    let mut best_delta_delta = u64::MAX;
    // just to get us started
    let mut small_size = 0;
    let mut big_size = 1;
    while small_idx <= small_stop && big_idx >= 0 && small_size < big_size {
        small_size = smaller[small_idx].weight;
        big_size = bigger[big_idx as usize].weight;
        let delta = big_size.wrapping_sub(small_size);

        if desired_delta > delta {
            let delta_delta = desired_delta - delta;
            if best_delta_delta < delta_delta {
                // this is only getting worse, return what we had before
                return (best_big_idx as usize, best_small_idx, best_delta_delta);
            }
            // the best this scan can do, hope it is good enough
            return (big_idx as usize, small_idx, delta_delta);
        } else {
            let delta_delta = delta - desired_delta;
            if best_delta_delta < delta_delta {
                return (best_big_idx as usize, best_small_idx, best_delta_delta);
            }
            best_delta_delta = delta_delta;
            best_small_idx = small_idx;
            best_big_idx = big_idx;

            let mut small_task_delta = u64::MAX;
            let mut big_task_delta = u64::MAX;
            if small_idx < small_stop {
                small_task_delta = smaller[small_idx + 1].weight - smaller[small_idx].weight;
            }
            if big_idx > 0 {
                big_task_delta =
                    bigger[big_idx as usize].weight - bigger[big_idx as usize - 1].weight;
            }
            // advance whichever pointer changes the difference least
            if big_task_delta < small_task_delta {
                big_idx -= 1;
            } else {
                small_idx += 1;
            }
        }
    }
    // the closest pair left is the smallest task on the big side and
    // the biggest task on the small side
    (0, small_stop, best_delta_delta)
}

/// Pick the set of tasks the heavier rank hands over, walking from the
/// biggest to the smallest and greedily taking every task that still
/// fits into the remaining budget of `desired_delta` plus a tenth of
/// overage. Returns indices into `giver` in ascending order; because
/// the walk breaks at the first task that does not fit, they always
/// form a suffix of the sorted input.
pub(crate) fn take_tasks(desired_delta: u64, giver: &[WeightedTask]) -> Vec<usize> {
    let delta_cutoff = desired_delta / 10;
    let mut remaining_delta = desired_delta + delta_cutoff;
    let mut result = vec![];
    for i in (0..giver.len()).rev() {
        let task_size = giver[i].weight;
        debug!(
            "considering give/take of size={} for index {}",
            task_size, giver[i].index
        );
        if task_size < remaining_delta {
            result.push(i);
            remaining_delta -= task_size;
        } else {
            // can do no better
            break;
        }
    }
    result.reverse();
    result
}
