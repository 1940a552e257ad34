use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

use lazy_static::lazy_static;
use mpi::traits::Equivalence;
use serde::Deserialize;
use serde::Serialize;

lazy_static! {
    static ref PROGRAM_START: Instant = Instant::now();
}

/// Monotonic nanosecond clock used to attribute task run time to
/// elements.
pub(crate) fn task_clock() -> u64 {
    PROGRAM_START.elapsed().as_nanos() as u64
}

/// Cycles spent running tasks on one element within the current
/// phase. Shared between the phase's local slot and the tasks charged
/// against it.
#[derive(Clone, Debug, Default)]
pub struct PerfCounter(Rc<Cell<u64>>);

impl PerfCounter {
    pub fn add(&self, cycles: u64) {
        self.0.set(self.0.get() + cycles);
    }

    pub fn get(&self) -> u64 {
        self.0.get()
    }

    pub fn reset(&self) {
        self.0.set(0);
    }
}

/// Per-rank work summary, reduced across all ranks with the
/// elementwise combine below. Unused fields must start at the
/// identity of their combine.
#[derive(Equivalence, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkReduce {
    pub total: u64,
    pub max: u64,
    pub min: u64,
    pub max_local_tasks: u64,
}

impl WorkReduce {
    pub fn identity() -> Self {
        Self {
            total: 0,
            max: 0,
            min: u64::MAX,
            max_local_tasks: 0,
        }
    }

    pub fn from_local_work(local_work: u64, num_local_tasks: usize) -> Self {
        Self {
            total: local_work,
            max: local_work,
            min: local_work,
            max_local_tasks: num_local_tasks as u64,
        }
    }

    /// The associative, commutative combine: sum of totals, max/min of
    /// the extremes, max of the task counts.
    pub fn combine(&mut self, other: &Self) {
        self.total += other.total;
        self.max = self.max.max(other.max);
        self.min = self.min.min(other.min);
        self.max_local_tasks = self.max_local_tasks.max(other.max_local_tasks);
    }
}
