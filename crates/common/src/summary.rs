use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::change::WorldStateChange;
use crate::types::{ChangeType, RegionId, StateCategory, SummaryId};

/// Granularity of a retention tier, finest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotLevel {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl SnapshotLevel {
    pub const ALL: [SnapshotLevel; 6] = [
        Self::Hourly,
        Self::Daily,
        Self::Weekly,
        Self::Monthly,
        Self::Quarterly,
        Self::Yearly,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::Yearly => "yearly",
        }
    }

    /// Length of one period as the level's name implies it.
    pub fn nominal_length(self) -> Duration {
        match self {
            Self::Hourly => Duration::hours(1),
            Self::Daily => Duration::days(1),
            Self::Weekly => Duration::weeks(1),
            Self::Monthly => Duration::days(31),
            Self::Quarterly => Duration::days(92),
            Self::Yearly => Duration::days(366),
        }
    }
}

impl fmt::Display for SnapshotLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|l| l.as_str() == wanted)
            .ok_or_else(|| format!("unknown snapshot level: {s:?}"))
    }
}

/// Abbreviated change kept inside a summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyChange {
    pub timestamp: DateTime<Utc>,
    pub change_type: ChangeType,
    pub key: String,
    pub category: StateCategory,
    pub reason: Option<String>,
}

impl From<&WorldStateChange> for KeyChange {
    fn from(change: &WorldStateChange) -> Self {
        Self {
            timestamp: change.timestamp,
            change_type: change.change_type,
            key: change.state_key.clone(),
            category: change.category,
            reason: change.reason.clone(),
        }
    }
}

/// Compacted description of one region's changes over one tier period.
///
/// Immutable once created. `compression_ratio` is
/// `key_changes.len() / original_change_count`, bounded in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalSummary {
    pub summary_id: SummaryId,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub period_type: SnapshotLevel,
    pub regions_affected: Vec<RegionId>,
    pub summary_text: String,
    pub key_changes: Vec<KeyChange>,
    pub original_change_count: usize,
    pub compression_ratio: f64,
    pub categories_affected: Vec<StateCategory>,
    pub created_at: DateTime<Utc>,
}

impl HistoricalSummary {
    pub fn affects(&self, region: &RegionId) -> bool {
        self.regions_affected.contains(region)
    }

    /// Whether the summary period overlaps `[start, end]`.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.period_start <= end && self.period_end >= start
    }
}

/// Ratio of retained to original changes; zero when nothing happened.
pub fn compression_ratio(retained: usize, original: usize) -> f64 {
    if original == 0 {
        return 0.0;
    }
    (retained.min(original) as f64) / (original as f64)
}
