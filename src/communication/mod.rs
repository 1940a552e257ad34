mod data_by_rank;
mod sized_communicator;
mod transport;

pub use data_by_rank::DataByRank;
pub use sized_communicator::SizedCommunicator;
pub use transport::CollectiveCommunicator;
pub use transport::Completion;
pub use transport::Envelope;
pub use transport::WorldCommunicator;

#[cfg(feature = "local")]
mod local;

#[cfg(feature = "local")]
pub use local::get_local_worlds;
#[cfg(feature = "local")]
pub use local::LocalWorld;
#[cfg(feature = "local")]
pub type World = local::LocalWorld;

#[cfg(not(feature = "local"))]
mod mpi_world;

#[cfg(not(feature = "local"))]
pub use mpi_world::MpiWorld;
#[cfg(not(feature = "local"))]
pub use mpi_world::MPI_UNIVERSE;
#[cfg(not(feature = "local"))]
pub type World = mpi_world::MpiWorld;

pub type Rank = mpi::Rank;
pub type Tag = mpi::Tag;

/// The full transport surface the runtime is written against.
pub trait Communicator:
    SizedCommunicator + WorldCommunicator + CollectiveCommunicator + 'static
{
}

impl<C> Communicator for C where
    C: SizedCommunicator + WorldCommunicator + CollectiveCommunicator + 'static
{
}
