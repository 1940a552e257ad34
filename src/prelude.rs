pub use crate::accessor::Accessor;
pub use crate::accessor::SerdeAccessor;
pub use crate::collection::AsyncRef;
pub use crate::collection::Collection;
pub use crate::collection::CollectionRef;
pub use crate::collection::HostCollection;
pub use crate::communication::Rank;
pub use crate::communication::World;
pub use crate::logging::setup_logging;
pub use crate::parameters::BalancerParameters;
pub use crate::phase::Phase;
pub use crate::runtime::ReduceFunctor;
pub use crate::runtime::Runtime;
pub use crate::task::Task;

#[cfg(feature = "local")]
pub use crate::communication::get_local_worlds;
