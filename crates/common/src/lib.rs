//! Shared types for the world state store.
//!
//! Everything here is plain data: values, identifiers, change records,
//! snapshots and summaries. Ownership and mutation rules live in
//! `worldstate-kernel`.

pub mod change;
pub mod clock;
pub mod error;
pub mod snapshot;
pub mod summary;
pub mod types;
pub mod value;

pub use change::WorldStateChange;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::ValidationError;
pub use snapshot::{ActiveEffect, GlobalContext, RegionalSnapshot};
pub use summary::{HistoricalSummary, KeyChange, SnapshotLevel, compression_ratio};
pub use types::{
    ChangeId, ChangeType, EffectId, RegionId, Season, SnapshotId, StateCategory, SummaryId,
};
pub use value::StateValue;
