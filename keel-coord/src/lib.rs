//! KEEL Coordination
//!
//! Coordination primitives for a fleet of stateless instances that share
//! nothing but a lease store:
//! - [`DistributedLock`]: quorum lease acquisition over one or more stores
//! - [`LockCoordinator`]: run an operation at most once across the fleet,
//!   degrading to unprotected execution when no store is reachable
//! - [`ReadThroughCache`]: collapse concurrent misses into one recomputation

mod coordinator;
mod lock;
mod read_through;

pub use coordinator::{LockCoordinator, LockOutcome};
pub use lock::DistributedLock;
pub use read_through::{CacheInvalidator, ReadThroughCache};
