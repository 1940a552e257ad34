//! # Workshift
//! Workshift is a distributed task-runtime backend: it executes an
//! asynchronous task graph over a message-passing transport and
//! rebalances element ownership between bulk phases so that measured
//! per-task execution time is spread as evenly as possible across
//! ranks.
//!
//! A front end creates [collections](collection::Collection) of
//! elements indexed by contiguous integers, opens a
//! [phase](phase::Phase) over them and registers
//! [tasks](task::Task) that operate on local elements and issue
//! send/recv pairs against remote ones. The
//! [runtime](runtime::Runtime) drains those transfers with a
//! probe-and-test progress engine, releasing each task once its join
//! counter reaches zero. Between phases, per-element cycle counters
//! feed a pairwise comm-split balancer, and a two-message migration
//! protocol moves the serialized state of every element whose owner
//! changed.
//!
//! The transport is MPI by default; the `local` feature replaces it
//! with an in-process channel transport so that multi-rank behaviour
//! can be exercised by plain threads.

pub mod accessor;
pub mod balance;
pub mod collection;
pub mod communication;
mod listener;
pub mod logging;
mod migrate;
pub mod parameters;
pub mod perf;
pub mod phase;
pub mod prelude;
mod request;
pub mod runtime;
mod tag;
pub mod task;

#[cfg(all(test, feature = "local"))]
mod tests;
