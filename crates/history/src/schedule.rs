use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use worldstate_common::SnapshotLevel;

/// Longest frequency or retention a tier may have: one hundred years.
pub const MAX_TIER_DAYS: u32 = 36_500;

/// How often one tier is summarized and how long raw detail is kept for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    pub frequency_days: u32,
    pub retention_days: u32,
}

impl TierPolicy {
    pub const fn new(frequency_days: u32, retention_days: u32) -> Self {
        Self {
            frequency_days,
            retention_days,
        }
    }

    pub fn frequency(&self) -> Duration {
        Duration::days(i64::from(self.frequency_days))
    }

    pub fn retention(&self) -> Duration {
        Duration::days(i64::from(self.retention_days))
    }
}

/// A tier policy that cannot be scheduled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("{0} tier: frequency must be at least one day")]
    ZeroFrequency(SnapshotLevel),

    #[error("{level} tier: {field} of {days} days exceeds the 100 year limit")]
    TooLong {
        level: SnapshotLevel,
        field: &'static str,
        days: u32,
    },

    #[error(
        "{level} tier: retention of {retention_days} days is shorter than its frequency \
         of {frequency_days} days"
    )]
    RetentionTooShort {
        level: SnapshotLevel,
        frequency_days: u32,
        retention_days: u32,
    },
}

/// Retention tiers in finest-first order. Levels without a policy are not
/// summarized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetentionSchedule {
    tiers: BTreeMap<SnapshotLevel, TierPolicy>,
}

impl Default for RetentionSchedule {
    fn default() -> Self {
        Self {
            tiers: BTreeMap::from([
                (SnapshotLevel::Daily, TierPolicy::new(1, 7)),
                (SnapshotLevel::Weekly, TierPolicy::new(7, 28)),
                (SnapshotLevel::Monthly, TierPolicy::new(28, 90)),
                (SnapshotLevel::Quarterly, TierPolicy::new(90, 365)),
                (SnapshotLevel::Yearly, TierPolicy::new(365, 730)),
            ]),
        }
    }
}

impl RetentionSchedule {
    /// A schedule with no tiers.
    pub fn empty() -> Self {
        Self {
            tiers: BTreeMap::new(),
        }
    }

    pub fn with_tier(mut self, level: SnapshotLevel, policy: TierPolicy) -> Self {
        self.tiers.insert(level, policy);
        self
    }

    pub fn policy(&self, level: SnapshotLevel) -> Option<&TierPolicy> {
        self.tiers.get(&level)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SnapshotLevel, TierPolicy)> + '_ {
        self.tiers.iter().map(|(level, policy)| (*level, *policy))
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        for (level, policy) in self.iter() {
            if policy.frequency_days == 0 {
                return Err(ScheduleError::ZeroFrequency(level));
            }
            for (field, days) in [
                ("frequency", policy.frequency_days),
                ("retention", policy.retention_days),
            ] {
                if days > MAX_TIER_DAYS {
                    return Err(ScheduleError::TooLong { level, field, days });
                }
            }
            if policy.retention_days < policy.frequency_days {
                return Err(ScheduleError::RetentionTooShort {
                    level,
                    frequency_days: policy.frequency_days,
                    retention_days: policy.retention_days,
                });
            }
        }
        Ok(())
    }
}
