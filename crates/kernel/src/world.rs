use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use worldstate_common::{
    ActiveEffect, ChangeId, ChangeType, RegionId, Season, StateCategory, StateValue,
    WorldStateChange,
};

use crate::change_log::ChangeLog;

/// A single tracked key with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateVariable {
    pub key: String,
    pub value: StateValue,
    pub category: StateCategory,
    pub region: RegionId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything a write needs besides the key and value.
#[derive(Debug, Clone, Default)]
pub(crate) struct WriteMeta {
    pub category: StateCategory,
    pub change_type: Option<ChangeType>,
    pub entity_id: Option<String>,
    pub reason: Option<String>,
}

type Scope = BTreeMap<String, StateVariable>;

/// The live world aggregate.
///
/// Global variables, one variable map per region, the change history and
/// the world calendar. This is the only mutable aggregate in the store;
/// snapshots and summaries are derived from it and never change.
///
/// Uses BTreeMap for deterministic iteration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldState {
    global: Scope,
    regions: BTreeMap<RegionId, Scope>,
    change_history: ChangeLog,
    current_time: DateTime<Utc>,
    season: Season,
    year: u32,
    active_effects: Vec<ActiveEffect>,
}

impl WorldState {
    /// Create an empty world whose calendar starts at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            global: Scope::new(),
            regions: BTreeMap::new(),
            change_history: ChangeLog::new(),
            current_time: now,
            season: Season::default(),
            year: 1,
            active_effects: Vec::new(),
        }
    }

    pub fn current_time(&self) -> DateTime<Utc> {
        self.current_time
    }

    pub fn season(&self) -> Season {
        self.season
    }

    pub fn year(&self) -> u32 {
        self.year
    }

    pub fn set_calendar(&mut self, season: Season, year: u32) {
        self.season = season;
        self.year = year;
    }

    pub(crate) fn set_current_time(&mut self, now: DateTime<Utc>) {
        self.current_time = now;
    }

    /// Read-only access to the change history.
    pub fn change_history(&self) -> &ChangeLog {
        &self.change_history
    }

    pub(crate) fn change_history_mut(&mut self) -> &mut ChangeLog {
        &mut self.change_history
    }

    /// Drop change records older than `cutoff`. Live values are unaffected.
    pub fn prune_changes_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        self.change_history.prune_before(cutoff)
    }

    /// Regions that currently hold at least one variable.
    pub fn regions(&self) -> impl Iterator<Item = &RegionId> {
        self.regions.keys()
    }

    fn scope(&self, region: &RegionId) -> Option<&Scope> {
        if region.is_global() {
            Some(&self.global)
        } else {
            self.regions.get(region)
        }
    }

    fn scope_mut(&mut self, region: &RegionId) -> &mut Scope {
        if region.is_global() {
            &mut self.global
        } else {
            self.regions.entry(region.clone()).or_default()
        }
    }

    pub fn variable(&self, key: &str, region: &RegionId) -> Option<&StateVariable> {
        self.scope(region)?.get(key)
    }

    pub fn variables(&self, region: &RegionId) -> impl Iterator<Item = &StateVariable> {
        self.scope(region).into_iter().flat_map(|s| s.values())
    }

    /// Plain key/value copy of one scope.
    pub fn values(&self, region: &RegionId) -> BTreeMap<String, StateValue> {
        self.variables(region)
            .map(|v| (v.key.clone(), v.value.clone()))
            .collect()
    }

    /// Write one key and append the matching change record.
    pub(crate) fn put(
        &mut self,
        region: &RegionId,
        key: &str,
        value: StateValue,
        meta: WriteMeta,
        at: DateTime<Utc>,
    ) -> WorldStateChange {
        let scope = self.scope_mut(region);
        let (old_value, default_type) = match scope.get_mut(key) {
            Some(var) => {
                let old = std::mem::replace(&mut var.value, value.clone());
                var.category = meta.category;
                var.updated_at = at;
                (old, ChangeType::Updated)
            }
            None => {
                scope.insert(
                    key.to_string(),
                    StateVariable {
                        key: key.to_string(),
                        value: value.clone(),
                        category: meta.category,
                        region: region.clone(),
                        created_at: at,
                        updated_at: at,
                    },
                );
                (StateValue::Null, ChangeType::Created)
            }
        };

        self.record(WorldStateChange {
            id: ChangeId::new(),
            seq: 0,
            timestamp: at,
            change_type: meta.change_type.unwrap_or(default_type),
            state_key: key.to_string(),
            old_value,
            new_value: value,
            region: region.clone(),
            category: meta.category,
            entity_id: meta.entity_id,
            reason: meta.reason,
        })
    }

    /// Remove one key, recording a tombstone. Returns `None` if it was absent.
    pub(crate) fn remove(
        &mut self,
        region: &RegionId,
        key: &str,
        meta: WriteMeta,
        at: DateTime<Utc>,
    ) -> Option<WorldStateChange> {
        let removed = self.scope_mut(region).remove(key)?;
        if !region.is_global() && self.regions.get(region).is_some_and(|s| s.is_empty()) {
            self.regions.remove(region);
        }
        Some(self.record(WorldStateChange {
            id: ChangeId::new(),
            seq: 0,
            timestamp: at,
            change_type: ChangeType::Deleted,
            state_key: key.to_string(),
            old_value: removed.value,
            new_value: StateValue::Null,
            region: region.clone(),
            category: removed.category,
            entity_id: meta.entity_id,
            reason: meta.reason,
        }))
    }

    /// Replace a whole scope with `values` in a single assignment and record
    /// the replacement under the region's rollback key.
    pub(crate) fn restore_scope(
        &mut self,
        region: &RegionId,
        values: &BTreeMap<String, StateValue>,
        reason: String,
        at: DateTime<Utc>,
    ) -> WorldStateChange {
        let previous = self.values(region);
        let current = self.scope(region);
        let restored: Scope = values
            .iter()
            .map(|(key, value)| {
                let var = match current.and_then(|s| s.get(key)) {
                    Some(existing) => StateVariable {
                        value: value.clone(),
                        updated_at: at,
                        ..existing.clone()
                    },
                    None => StateVariable {
                        key: key.clone(),
                        value: value.clone(),
                        category: StateCategory::Other,
                        region: region.clone(),
                        created_at: at,
                        updated_at: at,
                    },
                };
                (key.clone(), var)
            })
            .collect();

        if region.is_global() {
            self.global = restored;
        } else {
            self.regions.insert(region.clone(), restored);
        }

        self.record(WorldStateChange {
            id: ChangeId::new(),
            seq: 0,
            timestamp: at,
            change_type: ChangeType::Updated,
            state_key: region.rollback_key(),
            old_value: StateValue::Map(previous),
            new_value: StateValue::Map(values.clone()),
            region: region.clone(),
            category: StateCategory::Other,
            entity_id: None,
            reason: Some(reason),
        })
    }

    fn record(&mut self, change: WorldStateChange) -> WorldStateChange {
        self.change_history.append(change)
    }

    pub fn active_effects(&self) -> &[ActiveEffect] {
        &self.active_effects
    }

    pub(crate) fn add_effect(&mut self, effect: ActiveEffect) {
        self.active_effects.push(effect);
    }

    /// Effects that apply to `region`: global ones plus those targeting it.
    pub fn effects_for(&self, region: &RegionId) -> Vec<ActiveEffect> {
        self.active_effects
            .iter()
            .filter(|e| e.targets(region))
            .cloned()
            .collect()
    }

    /// Drop every effect expired at `now` and return the dropped ones.
    pub(crate) fn remove_expired_effects(&mut self, now: DateTime<Utc>) -> Vec<ActiveEffect> {
        let (expired, active) = std::mem::take(&mut self.active_effects)
            .into_iter()
            .partition(|e| e.is_expired(now));
        self.active_effects = active;
        expired
    }
}
