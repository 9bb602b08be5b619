//! The live key/value store and the shared core behind it.
//!
//! [`StateStore`] and [`SnapshotManager`](crate::SnapshotManager) are cheap
//! clone handles over one [`Shared`] core. All live data sits behind a
//! single `RwLock`. Repository writes and event delivery happen after the
//! lock is released, from data queued while it was held, so they run in
//! commit order.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use worldstate_common::snapshot::{KIND_AUTO, META_KIND};
use worldstate_common::{
    ActiveEffect, ChangeType, Clock, GlobalContext, RegionId, RegionalSnapshot, Season,
    SnapshotId, StateCategory, StateValue, SystemClock, ValidationError, WorldStateChange,
};

use crate::events::{EventBus, EventKind, HandlerError, SubscriptionId, WorldEvent};
use crate::policy::SignificancePolicy;
use crate::repository::Repository;
use crate::snapshot::SnapshotManager;
use crate::world::{StateVariable, WorldState, WriteMeta};

/// Data guarded by the state lock.
pub(crate) struct Live {
    pub(crate) world: WorldState,
    pub(crate) snapshots: BTreeMap<RegionId, Vec<RegionalSnapshot>>,
    last_stamp: Option<DateTime<Utc>>,
}

impl Live {
    fn new(world: WorldState) -> Self {
        let last_stamp = world.change_history().last_timestamp();
        Self {
            world,
            snapshots: BTreeMap::new(),
            last_stamp,
        }
    }

    /// Next record timestamp: `now`, unless the clock went backwards.
    pub(crate) fn stamp(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let at = self.last_stamp.map_or(now, |last| last.max(now));
        self.last_stamp = Some(at);
        at
    }

    fn observe(&mut self, at: DateTime<Utc>) {
        self.last_stamp = Some(self.last_stamp.map_or(at, |last| last.max(at)));
    }

    pub(crate) fn global_context(&self, region: &RegionId) -> GlobalContext {
        GlobalContext {
            global_time: self.world.current_time(),
            season: self.world.season(),
            year: self.world.year(),
            active_effects: self.world.effects_for(region),
        }
    }

    /// Copy the region's current values into a new snapshot and keep it.
    pub(crate) fn capture(
        &mut self,
        region: &RegionId,
        at: DateTime<Utc>,
        include_global_context: bool,
        metadata: BTreeMap<String, String>,
    ) -> RegionalSnapshot {
        let snapshot = RegionalSnapshot {
            snapshot_id: SnapshotId::new(),
            region_id: region.clone(),
            timestamp: at,
            change_seq: self.world.change_history().last_seq(),
            local_state: self.world.values(region),
            global_context: include_global_context.then(|| self.global_context(region)),
            metadata,
        };
        self.snapshots
            .entry(region.clone())
            .or_default()
            .push(snapshot.clone());
        snapshot
    }

    /// Merge snapshots loaded from storage, skipping ids already held.
    pub(crate) fn merge_snapshots(&mut self, loaded: Vec<RegionalSnapshot>) -> usize {
        let mut added = 0;
        for snapshot in loaded {
            let held = self
                .snapshots
                .get(&snapshot.region_id)
                .is_some_and(|list| list.iter().any(|s| s.snapshot_id == snapshot.snapshot_id));
            if held {
                continue;
            }
            self.world
                .change_history_mut()
                .reserve_through(snapshot.change_seq);
            self.observe(snapshot.timestamp);
            self.snapshots
                .entry(snapshot.region_id.clone())
                .or_default()
                .push(snapshot);
            added += 1;
        }
        for list in self.snapshots.values_mut() {
            list.sort_by_key(|s| (s.timestamp, s.change_seq));
        }
        added
    }
}

/// One side effect of a commit.
enum Outbound {
    Persist(RegionalSnapshot),
    Deliver(WorldEvent),
}

/// Side effects collected under the state lock.
#[derive(Default)]
pub(crate) struct Staged {
    items: Vec<Outbound>,
}

impl Staged {
    pub(crate) fn snapshot(&mut self, snapshot: RegionalSnapshot) {
        let created = WorldEvent::SnapshotCreated {
            snapshot_id: snapshot.snapshot_id,
            region: snapshot.region_id.clone(),
            timestamp: snapshot.timestamp,
            kind: snapshot.kind().map(str::to_string),
        };
        self.items.push(Outbound::Persist(snapshot));
        self.items.push(Outbound::Deliver(created));
    }

    pub(crate) fn event(&mut self, event: WorldEvent) {
        self.items.push(Outbound::Deliver(event));
    }

    /// Queue behind everything committed earlier. Must be called with the
    /// state lock held so that queue order is commit order.
    pub(crate) fn enqueue(self, shared: &Shared) {
        if !self.items.is_empty() {
            shared.outbox.lock().queue.extend(self.items);
        }
    }
}

/// Commit-ordered side effects waiting to be carried out.
#[derive(Default)]
pub(crate) struct Outbox {
    queue: VecDeque<Outbound>,
    draining: bool,
}

/// Core shared by every handle onto one store.
pub(crate) struct Shared {
    pub(crate) live: RwLock<Live>,
    pub(crate) bus: EventBus,
    pub(crate) repository: Option<Arc<dyn Repository>>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) policy: SignificancePolicy,
    pub(crate) outbox: Mutex<Outbox>,
}

impl Shared {
    /// Carry out queued side effects in commit order, persisting each
    /// snapshot before announcing it.
    ///
    /// One thread drains at a time. A caller that finds a drain in progress,
    /// including a handler writing from inside delivery, leaves its work to
    /// that drain, which runs until the queue is empty. No lock is held
    /// while the repository or a handler runs.
    pub(crate) fn drain(&self) {
        {
            let mut outbox = self.outbox.lock();
            if outbox.draining {
                return;
            }
            outbox.draining = true;
        }
        loop {
            let next = {
                let mut outbox = self.outbox.lock();
                match outbox.queue.pop_front() {
                    Some(next) => next,
                    None => {
                        outbox.draining = false;
                        return;
                    }
                }
            };
            match next {
                Outbound::Persist(snapshot) => self.persist(&snapshot),
                Outbound::Deliver(event) => {
                    self.bus.trigger(&event);
                }
            }
        }
    }

    fn persist(&self, snapshot: &RegionalSnapshot) {
        let Some(repo) = &self.repository else {
            return;
        };
        if let Err(err) = repo.save_snapshot(snapshot) {
            warn!(
                region = %snapshot.region_id,
                snapshot = %snapshot.snapshot_id,
                error = %err,
                "failed to persist snapshot"
            );
        }
    }
}

/// A write request: key and value plus optional metadata.
#[derive(Debug, Clone)]
pub struct StateWrite {
    key: String,
    value: StateValue,
    region: Option<String>,
    meta: WriteMeta,
}

impl StateWrite {
    pub fn new(key: impl Into<String>, value: impl Into<StateValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            region: None,
            meta: WriteMeta::default(),
        }
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn category(mut self, category: StateCategory) -> Self {
        self.meta.category = category;
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.meta.reason = Some(reason.into());
        self
    }

    /// The entity responsible for the change.
    pub fn entity(mut self, entity_id: impl Into<String>) -> Self {
        self.meta.entity_id = Some(entity_id.into());
        self
    }

    /// Override the derived `created`/`updated` type, e.g. for merged or
    /// calculated values.
    pub fn change_type(mut self, change_type: ChangeType) -> Self {
        self.meta.change_type = Some(change_type);
        self
    }
}

/// Filter for [`StateStore::query`]. Empty criteria match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateQuery {
    pub category: Option<StateCategory>,
    /// Substring the key must contain.
    pub key_pattern: Option<String>,
    /// Inclusive bounds on the variable's last update.
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl StateQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn category(mut self, category: StateCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn key_contains(mut self, pattern: impl Into<String>) -> Self {
        self.key_pattern = Some(pattern.into());
        self
    }

    pub fn updated_between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.time_range = Some((start, end));
        self
    }

    fn matches(&self, var: &StateVariable) -> bool {
        if self.category.is_some_and(|c| c != var.category) {
            return false;
        }
        if let Some(pattern) = &self.key_pattern
            && !var.key.contains(pattern.as_str())
        {
            return false;
        }
        if let Some((start, end)) = self.time_range
            && (var.updated_at < start || var.updated_at > end)
        {
            return false;
        }
        true
    }
}

/// Builder for a [`StateStore`].
#[derive(Default)]
pub struct StateStoreBuilder {
    repository: Option<Arc<dyn Repository>>,
    clock: Option<Arc<dyn Clock>>,
    policy: SignificancePolicy,
    initial: Option<WorldState>,
}

impl StateStoreBuilder {
    pub fn repository(mut self, repository: Arc<dyn Repository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn policy(mut self, policy: SignificancePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Start from an existing world instead of an empty one.
    pub fn world(mut self, world: WorldState) -> Self {
        self.initial = Some(world);
        self
    }

    pub fn build(self) -> StateStore {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let world = self
            .initial
            .unwrap_or_else(|| WorldState::new(clock.now()));
        StateStore {
            shared: Arc::new(Shared {
                live: RwLock::new(Live::new(world)),
                bus: EventBus::new(),
                repository: self.repository,
                clock,
                policy: self.policy,
                outbox: Mutex::new(Outbox::default()),
            }),
        }
    }
}

/// Key/value access to live world state.
#[derive(Clone)]
pub struct StateStore {
    shared: Arc<Shared>,
}

impl fmt::Debug for StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let live = self.shared.live.read();
        f.debug_struct("StateStore")
            .field("changes", &live.world.change_history().len())
            .field("regions", &live.world.regions().count())
            .field("persistent", &self.shared.repository.is_some())
            .finish()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn resolve_key(key: &str) -> Result<&str, ValidationError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(ValidationError::EmptyKey);
    }
    Ok(key)
}

impl StateStore {
    pub fn builder() -> StateStoreBuilder {
        StateStoreBuilder::default()
    }

    /// A memory-only store on the system clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot manager over the same live state.
    pub fn snapshot_manager(&self) -> SnapshotManager {
        SnapshotManager::new(Arc::clone(&self.shared))
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.bus
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&WorldEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.shared.bus.subscribe(kind, handler)
    }

    pub fn repository(&self) -> Option<Arc<dyn Repository>> {
        self.shared.repository.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.shared.clock)
    }

    pub fn policy(&self) -> &SignificancePolicy {
        &self.shared.policy
    }

    /// Current value of `key`, or `None` if it is absent or the region name
    /// is malformed.
    pub fn get(&self, key: &str, region: Option<&str>) -> Option<StateValue> {
        let key = resolve_key(key).ok()?;
        let region = RegionId::scope(region).ok()?;
        let live = self.shared.live.read();
        live.world.variable(key, &region).map(|v| v.value.clone())
    }

    pub fn get_or(&self, key: &str, region: Option<&str>, default: StateValue) -> StateValue {
        self.get(key, region).unwrap_or(default)
    }

    pub fn variable(&self, key: &str, region: Option<&str>) -> Option<StateVariable> {
        let key = resolve_key(key).ok()?;
        let region = RegionId::scope(region).ok()?;
        self.shared
            .live
            .read()
            .world
            .variable(key, &region)
            .cloned()
    }

    /// Set `key` in `region` (global when `None`).
    pub fn set(
        &self,
        key: &str,
        value: impl Into<StateValue>,
        region: Option<&str>,
    ) -> Result<WorldStateChange, ValidationError> {
        let mut write = StateWrite::new(key, value);
        write.region = region.map(str::to_string);
        self.apply(write)
    }

    /// Commit one write: update the value, append its change record, raise
    /// `state_changed`, and snapshot the region if the change is significant.
    pub fn apply(&self, write: StateWrite) -> Result<WorldStateChange, ValidationError> {
        let key = resolve_key(&write.key)?;
        let region = RegionId::scope(write.region.as_deref())?;
        if key == region.rollback_key() {
            return Err(ValidationError::ReservedKey(key.to_string()));
        }

        let now = self.shared.clock.now();
        let mut staged = Staged::default();
        let change = {
            let mut live = self.shared.live.write();
            let at = live.stamp(now);
            let change = live.world.put(&region, key, write.value, write.meta, at);
            staged.event(WorldEvent::state_changed(&change));
            if self.shared.policy.should_auto_snapshot(&change) {
                let metadata = BTreeMap::from([
                    (META_KIND.to_string(), KIND_AUTO.to_string()),
                    ("triggered_by_change".to_string(), change.id.to_string()),
                    ("change_category".to_string(), change.category.to_string()),
                ]);
                staged.snapshot(live.capture(&region, at, true, metadata));
            }
            staged.enqueue(&self.shared);
            change
        };

        debug!(
            key = %change.state_key,
            region = %change.region,
            seq = change.seq,
            change_type = ?change.change_type,
            "state set"
        );
        self.shared.drain();
        Ok(change)
    }

    /// Remove `key`, recording a tombstone. `Ok(None)` if it was absent.
    pub fn delete(
        &self,
        key: &str,
        region: Option<&str>,
        reason: Option<&str>,
    ) -> Result<Option<WorldStateChange>, ValidationError> {
        let key = resolve_key(key)?;
        let region = RegionId::scope(region)?;
        let now = self.shared.clock.now();
        let meta = WriteMeta {
            reason: reason.map(str::to_string),
            ..WriteMeta::default()
        };

        let change = {
            let mut live = self.shared.live.write();
            if live.world.variable(key, &region).is_none() {
                return Ok(None);
            }
            let at = live.stamp(now);
            let change = live.world.remove(&region, key, meta, at);
            if let Some(change) = &change {
                let mut staged = Staged::default();
                staged.event(WorldEvent::state_changed(change));
                staged.enqueue(&self.shared);
            }
            change
        };

        if let Some(change) = &change {
            debug!(
                key = %change.state_key,
                region = %change.region,
                seq = change.seq,
                "state deleted"
            );
        }
        self.shared.drain();
        Ok(change)
    }

    /// Current values in `region` that match every criterion in `query`.
    pub fn query(&self, query: &StateQuery, region: Option<&str>) -> BTreeMap<String, StateValue> {
        let Ok(region) = RegionId::scope(region) else {
            return BTreeMap::new();
        };
        let live = self.shared.live.read();
        live.world
            .variables(&region)
            .filter(|v| query.matches(v))
            .map(|v| (v.key.clone(), v.value.clone()))
            .collect()
    }

    /// Every retained change to `key`, oldest first.
    pub fn history(&self, key: &str, region: Option<&str>) -> Vec<WorldStateChange> {
        let (Ok(key), Ok(region)) = (resolve_key(key), RegionId::scope(region)) else {
            return Vec::new();
        };
        let live = self.shared.live.read();
        live.world
            .change_history()
            .for_key(key, &region)
            .cloned()
            .collect()
    }

    pub fn change_count(&self) -> usize {
        self.shared.live.read().world.change_history().len()
    }

    /// Regions holding at least one variable.
    pub fn regions(&self) -> Vec<RegionId> {
        self.shared.live.read().world.regions().cloned().collect()
    }

    pub fn current_time(&self) -> DateTime<Utc> {
        self.shared.live.read().world.current_time()
    }

    pub fn calendar(&self) -> (Season, u32) {
        let live = self.shared.live.read();
        (live.world.season(), live.world.year())
    }

    pub fn set_calendar(&self, season: Season, year: u32) {
        self.shared.live.write().world.set_calendar(season, year);
    }

    pub fn add_effect(&self, effect: ActiveEffect) {
        debug!(effect = %effect.name, "effect added");
        self.shared.live.write().world.add_effect(effect);
    }

    pub fn active_effects(&self) -> Vec<ActiveEffect> {
        self.shared.live.read().world.active_effects().to_vec()
    }

    /// Move the world clock to now and expire due effects, raising
    /// `effect_expired` for each. Returns the expired effects.
    pub fn advance_time(&self) -> Vec<ActiveEffect> {
        let now = self.shared.clock.now();
        let expired = {
            let mut live = self.shared.live.write();
            let at = live.stamp(now);
            live.world.set_current_time(at);
            let expired = live.world.remove_expired_effects(at);
            let mut staged = Staged::default();
            for effect in &expired {
                staged.event(WorldEvent::EffectExpired {
                    effect: effect.clone(),
                });
            }
            staged.enqueue(&self.shared);
            expired
        };
        for effect in &expired {
            debug!(effect = %effect.name, "effect expired");
        }
        self.shared.drain();
        expired
    }

    /// Drop in-memory change records older than `cutoff`.
    pub fn prune_changes_before(&self, cutoff: DateTime<Utc>) -> usize {
        let removed = self
            .shared
            .live
            .write()
            .world
            .change_history_mut()
            .prune_before(cutoff);
        if removed > 0 {
            info!(removed, %cutoff, "pruned change history");
        }
        removed
    }

    /// A copy of the live aggregate, for persistence.
    pub fn export_state(&self) -> WorldState {
        self.shared.live.read().world.clone()
    }

    /// Replace the live aggregate, e.g. with one loaded from storage.
    /// Snapshots already held are kept.
    pub fn import_state(&self, world: WorldState) {
        let mut live = self.shared.live.write();
        if let Some(last) = world.change_history().last_timestamp() {
            live.observe(last);
        }
        let max_snapshot_seq = live
            .snapshots
            .values()
            .flatten()
            .map(|s| s.change_seq)
            .max()
            .unwrap_or(0);
        live.world = world;
        live.world
            .change_history_mut()
            .reserve_through(max_snapshot_seq);
    }

    /// Persist the live aggregate. Returns `false` without a repository or
    /// when the backend fails.
    pub fn save_state(&self) -> bool {
        let Some(repo) = &self.shared.repository else {
            return false;
        };
        let world = self.export_state();
        match repo.save_state(&world) {
            Ok(()) => {
                debug!(changes = world.change_history().len(), "state saved");
                true
            }
            Err(err) => {
                warn!(error = %err, "failed to save state");
                false
            }
        }
    }

    /// Replace the live aggregate with the stored one. Returns `false` when
    /// nothing is stored or the backend fails.
    pub fn load_state(&self) -> bool {
        let Some(repo) = &self.shared.repository else {
            return false;
        };
        match repo.load_state() {
            Ok(Some(world)) => {
                self.import_state(world);
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!(error = %err, "failed to load state");
                false
            }
        }
    }

    /// Read access for reconstruction. Holds the state lock until dropped,
    /// so keep it short-lived.
    pub fn history_view(&self) -> HistoryView<'_> {
        HistoryView {
            live: self.shared.live.read(),
        }
    }
}

/// A consistent read-only view of snapshots and the change log.
pub struct HistoryView<'a> {
    live: RwLockReadGuard<'a, Live>,
}

impl HistoryView<'_> {
    /// The newest snapshot of `region` taken at or before `at`.
    pub fn base_snapshot(&self, region: &RegionId, at: DateTime<Utc>) -> Option<&RegionalSnapshot> {
        self.live
            .snapshots
            .get(region)?
            .iter()
            .rev()
            .find(|s| s.timestamp <= at)
    }

    /// Changes to `region` after `after_seq` and no later than `until`.
    pub fn replay_changes<'s>(
        &'s self,
        region: &'s RegionId,
        after_seq: u64,
        until: DateTime<Utc>,
    ) -> impl Iterator<Item = &'s WorldStateChange> {
        self.live
            .world
            .change_history()
            .replay_after(region, after_seq, until)
    }

    pub fn changes_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> &[WorldStateChange] {
        self.live.world.change_history().between(start, end)
    }

    pub fn pruned_before(&self) -> Option<DateTime<Utc>> {
        self.live.world.change_history().pruned_before()
    }

    pub fn oldest_change(&self) -> Option<DateTime<Utc>> {
        self.live.world.change_history().first_timestamp()
    }

    /// Global context as it stands now, for `region`.
    pub fn global_context(&self, region: &RegionId) -> GlobalContext {
        self.live.global_context(region)
    }
}
