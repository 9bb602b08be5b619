use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{EffectId, RegionId, Season, SnapshotId};
use crate::value::StateValue;

/// Metadata key naming why a snapshot was taken.
pub const META_KIND: &str = "type";
/// `META_KIND` value for snapshots taken automatically on significant changes.
pub const KIND_AUTO: &str = "auto_snapshot";
/// `META_KIND` value for the backup taken before an atomic rollback.
pub const KIND_ROLLBACK_BACKUP: &str = "rollback_backup";

/// A timed effect acting on the world or on one region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveEffect {
    pub id: EffectId,
    pub name: String,
    /// Target region; `None` affects every region.
    pub region: Option<RegionId>,
    pub started_at: DateTime<Utc>,
    /// `None` means permanent until removed explicitly.
    pub expires_at: Option<DateTime<Utc>>,
    pub magnitude: f64,
}

impl ActiveEffect {
    pub fn new(name: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            id: EffectId::new(),
            name: name.into(),
            region: None,
            started_at,
            expires_at: None,
            magnitude: 1.0,
        }
    }

    pub fn in_region(mut self, region: RegionId) -> Self {
        self.region = Some(region);
        self
    }

    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn with_magnitude(mut self, magnitude: f64) -> Self {
        self.magnitude = magnitude;
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Whether the effect is relevant to `region`.
    pub fn targets(&self, region: &RegionId) -> bool {
        self.region.as_ref().is_none_or(|r| r == region)
    }
}

/// Slice of global state captured alongside a regional snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalContext {
    pub global_time: DateTime<Utc>,
    pub season: Season,
    pub year: u32,
    pub active_effects: Vec<ActiveEffect>,
}

/// An immutable full copy of one region's state at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionalSnapshot {
    pub snapshot_id: SnapshotId,
    pub region_id: RegionId,
    pub timestamp: DateTime<Utc>,
    /// Change-log high-water mark: every change with `seq <= change_seq`
    /// is already reflected in `local_state`.
    pub change_seq: u64,
    pub local_state: BTreeMap<String, StateValue>,
    pub global_context: Option<GlobalContext>,
    pub metadata: BTreeMap<String, String>,
}

impl RegionalSnapshot {
    /// The value of [`META_KIND`] in the metadata, if set.
    pub fn kind(&self) -> Option<&str> {
        self.metadata.get(META_KIND).map(String::as_str)
    }
}
