//! World Kernel: authoritative live world state, change log, snapshots and rollback.
//!
//! # Invariants
//! - All state mutations flow through explicit operations on [`StateStore`]
//!   and [`SnapshotManager`].
//! - The change log is append-only and totally ordered by `seq`.
//! - Snapshots never change after they are taken.
//! - Events are delivered after the mutation that raised them has committed
//!   and the state lock has been released.

pub mod change_log;
pub mod events;
pub mod policy;
pub mod repository;
pub mod snapshot;
pub mod store;
pub mod world;

#[cfg(test)]
pub(crate) mod testing;

pub use change_log::ChangeLog;
pub use events::{EventBus, EventKind, HandlerError, SubscriptionId, WorldEvent};
pub use policy::SignificancePolicy;
pub use repository::{Repository, RepositoryError};
pub use snapshot::SnapshotManager;
pub use store::{HistoryView, StateQuery, StateStore, StateStoreBuilder, StateWrite};
pub use world::{StateVariable, WorldState};
