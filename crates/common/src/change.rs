use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChangeId, ChangeType, RegionId, StateCategory};
use crate::value::StateValue;

/// An immutable record of a single state mutation.
///
/// Change records are append-only. For a given key they are totally ordered
/// by `seq`, and `old_value` always equals the `new_value` of the previous
/// change to the same key (or `Null` when there is none).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldStateChange {
    pub id: ChangeId,
    /// Position in the change log; strictly increasing.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub change_type: ChangeType,
    pub state_key: String,
    pub old_value: StateValue,
    pub new_value: StateValue,
    /// Partition the change applies to (`global` for global variables).
    pub region: RegionId,
    pub category: StateCategory,
    /// Entity that caused the change, if any.
    pub entity_id: Option<String>,
    pub reason: Option<String>,
}

impl WorldStateChange {
    /// Whether this record is the whole-map replacement written by a rollback.
    pub fn is_rollback(&self) -> bool {
        self.state_key == self.region.rollback_key()
    }
}
