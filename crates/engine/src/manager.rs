//! Component wiring and the per-tick driver.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn};
use worldstate_common::{
    ActiveEffect, Clock, HistoricalSummary, RegionId, SnapshotLevel, SystemClock,
};
use worldstate_history::{HistoryReconstructor, SummarizationScheduler};
use worldstate_kernel::{
    EventKind, HandlerError, Repository, SnapshotManager, StateStore, SubscriptionId, WorldEvent,
};
use worldstate_persist::{FileRepository, InMemoryRepository, StoreError};

use crate::config::{ConfigError, EngineConfig, RepositoryBackend, RepositoryConfig};

/// Errors raised while assembling a manager.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open repository: {0}")]
    Repository(#[from] StoreError),
}

/// What one call to [`WorldStateManager::process_tick`] did.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub timestamp: DateTime<Utc>,
    pub expired_effects: Vec<ActiveEffect>,
    /// Summaries created per tier; empty when no tier was due.
    pub summaries_created: BTreeMap<SnapshotLevel, usize>,
}

/// Open the repository a config asks for.
pub fn open_repository(
    config: &RepositoryConfig,
) -> Result<Option<Arc<dyn Repository>>, EngineError> {
    match config.backend {
        RepositoryBackend::None => Ok(None),
        RepositoryBackend::Memory => Ok(Some(Arc::new(InMemoryRepository::new()))),
        RepositoryBackend::File => {
            let path = config.path.as_ref().ok_or_else(|| {
                ConfigError::Invalid("repository.path is required for the file backend".into())
            })?;
            Ok(Some(Arc::new(FileRepository::open(path)?)))
        }
    }
}

/// Owns one store and the components built on it.
///
/// The store, snapshot manager, reconstructor and scheduler all share the
/// same state, event bus, clock and repository.
#[derive(Debug)]
pub struct WorldStateManager {
    config: EngineConfig,
    store: StateStore,
    snapshots: SnapshotManager,
    history: HistoryReconstructor,
    scheduler: SummarizationScheduler,
}

impl WorldStateManager {
    /// Validate `config`, open its repository and wire everything up with
    /// the system clock.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let repository = open_repository(&config.repository)?;
        Ok(Self::from_parts(config, repository, Arc::new(SystemClock)))
    }

    /// Wire components from already-built parts. The config's repository
    /// section is ignored in favor of `repository`.
    pub fn from_parts(
        config: EngineConfig,
        repository: Option<Arc<dyn Repository>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut builder = StateStore::builder()
            .clock(clock)
            .policy(config.significance.clone());
        if let Some(repository) = repository {
            builder = builder.repository(repository);
        }
        let store = builder.build();
        let snapshots = store.snapshot_manager();
        let history = HistoryReconstructor::new(store.clone());
        let scheduler =
            SummarizationScheduler::new(store.clone(), config.summarization.tiers.clone())
                .enabled(config.summarization.enabled);
        Self {
            config,
            store,
            snapshots,
            history,
            scheduler,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    pub fn history(&self) -> &HistoryReconstructor {
        &self.history
    }

    pub fn scheduler(&self) -> &SummarizationScheduler {
        &self.scheduler
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&WorldEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.store.subscribe(kind, handler)
    }

    /// Advance world time, expire effects, run due summarization tiers and
    /// announce the tick.
    pub fn process_tick(&self) -> TickReport {
        let _span = info_span!("tick").entered();

        let expired_effects = self.store.advance_time();
        let summaries_created = self.scheduler.process_batch_summarization(false);
        let timestamp = self.store.current_time();

        self.store.events().trigger(&WorldEvent::TickProcessed {
            timestamp,
            expired_effects: expired_effects.len(),
        });
        debug!(
            %timestamp,
            expired = expired_effects.len(),
            summarized = summaries_created.values().sum::<usize>(),
            "tick processed"
        );

        TickReport {
            timestamp,
            expired_effects,
            summaries_created,
        }
    }

    /// Persist the live state. Snapshots are persisted as they are taken.
    pub fn save_to_repository(&self) -> bool {
        self.store.save_state()
    }

    /// Load stored state, then every stored snapshot of each region the
    /// state or the repository knows about, then resume summarization
    /// coverage. Returns `false` when no state was stored.
    pub fn load_from_repository(&self) -> bool {
        if !self.store.load_state() {
            return false;
        }
        let mut regions: BTreeSet<RegionId> = self.store.regions().into_iter().collect();
        if let Some(repo) = self.store.repository() {
            match repo.snapshot_regions() {
                Ok(stored) => regions.extend(stored),
                Err(err) => warn!(error = %err, "failed to list snapshot regions"),
            }
        }

        let mut restored = self.snapshots.restore_from_repository(
            None,
            DateTime::<Utc>::MIN_UTC,
            DateTime::<Utc>::MAX_UTC,
        );
        for region in regions {
            restored += self.snapshots.restore_from_repository(
                Some(region.as_str()),
                DateTime::<Utc>::MIN_UTC,
                DateTime::<Utc>::MAX_UTC,
            );
        }
        let tiers = self.scheduler.resume_from_repository();
        info!(
            changes = self.store.change_count(),
            snapshots = restored,
            tiers,
            "world state loaded"
        );
        true
    }

    /// Summaries of every tier overlapping `[start, end]`, optionally only
    /// those affecting `region`, ordered by period start.
    pub fn summaries_for_period(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        region: Option<&str>,
    ) -> Vec<HistoricalSummary> {
        let region = match region.map(RegionId::new).transpose() {
            Ok(region) => region,
            Err(err) => {
                warn!(error = %err, "invalid region filter");
                return Vec::new();
            }
        };

        let mut found = match self.store.repository() {
            Some(repo) => {
                let mut found = Vec::new();
                for level in SnapshotLevel::ALL {
                    match repo.load_summaries(level, start, end) {
                        Ok(summaries) => found.extend(summaries),
                        Err(err) => warn!(tier = %level, error = %err, "failed to load summaries"),
                    }
                }
                found
            }
            None => self
                .scheduler
                .unpersisted_summaries()
                .into_iter()
                .filter(|s| s.overlaps(start, end))
                .collect(),
        };

        if let Some(region) = &region {
            found.retain(|s| s.affects(region));
        }
        found.sort_by_key(|s| (s.period_start, s.period_type));
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SummarizationConfig;
    use chrono::{Duration, TimeZone};
    use parking_lot::Mutex;
    use worldstate_common::{ManualClock, StateCategory, StateValue};
    use worldstate_history::{RetentionSchedule, TierPolicy};
    use worldstate_kernel::StateWrite;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn daily_only() -> EngineConfig {
        EngineConfig {
            summarization: SummarizationConfig {
                enabled: true,
                tiers: RetentionSchedule::empty()
                    .with_tier(SnapshotLevel::Daily, TierPolicy::new(1, 3)),
            },
            ..EngineConfig::default()
        }
    }

    fn memory_manager(config: EngineConfig) -> (Arc<ManualClock>, WorldStateManager) {
        let clock = Arc::new(ManualClock::new(t0()));
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let manager = WorldStateManager::from_parts(config, Some(repo), clock.clone());
        (clock, manager)
    }

    #[test]
    fn tick_expires_effects_and_announces_itself() {
        let (clock, manager) = memory_manager(daily_only());
        manager.store().add_effect(
            ActiveEffect::new("drought", t0())
                .in_region(RegionId::new("r1").unwrap())
                .expiring_at(t0() + Duration::hours(5)),
        );

        let ticks = Arc::new(Mutex::new(Vec::new()));
        let seen = ticks.clone();
        manager.subscribe(EventKind::TickProcessed, move |event| {
            if let WorldEvent::TickProcessed {
                timestamp,
                expired_effects,
            } = event
            {
                seen.lock().push((*timestamp, *expired_effects));
            }
            Ok(())
        });

        clock.advance(Duration::hours(1));
        let first = manager.process_tick();
        assert!(first.expired_effects.is_empty());

        clock.advance(Duration::hours(5));
        let second = manager.process_tick();
        assert_eq!(second.expired_effects.len(), 1);
        assert_eq!(second.timestamp, t0() + Duration::hours(6));
        assert!(manager.store().active_effects().is_empty());

        assert_eq!(
            *ticks.lock(),
            vec![(t0() + Duration::hours(1), 0), (t0() + Duration::hours(6), 1)]
        );
    }

    #[test]
    fn tick_runs_due_summarization_once() {
        let (clock, manager) = memory_manager(daily_only());
        for hour in 0..48 {
            clock.set(t0() + Duration::hours(hour));
            manager
                .store()
                .apply(
                    StateWrite::new("grain", hour)
                        .region("r1")
                        .category(StateCategory::Economic),
                )
                .unwrap();
        }
        clock.set(t0() + Duration::days(3));

        let report = manager.process_tick();
        assert_eq!(report.summaries_created[&SnapshotLevel::Daily], 1);
        assert!(manager.process_tick().summaries_created.is_empty());

        let end = t0() + Duration::days(3);
        let summaries = manager.summaries_for_period(t0(), end, Some("r1"));
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].original_change_count, 48);
        let elsewhere = manager.summaries_for_period(t0(), end, Some("r2"));
        assert!(elsewhere.is_empty());
    }

    #[test]
    fn disabled_summarization_skips_tiers() {
        let mut config = daily_only();
        config.summarization.enabled = false;
        let (clock, manager) = memory_manager(config);
        manager.store().set("grain", 1, Some("r1")).unwrap();
        clock.advance(Duration::days(5));
        assert!(manager.process_tick().summaries_created.is_empty());
        assert_eq!(manager.store().change_count(), 1);
    }

    #[test]
    fn summaries_without_repository_come_from_memory() {
        let clock = Arc::new(ManualClock::new(t0()));
        let manager = WorldStateManager::from_parts(daily_only(), None, clock.clone());
        manager.store().set("grain", 1, Some("r1")).unwrap();
        clock.advance(Duration::days(2));
        manager.process_tick();

        assert!(!manager.save_to_repository());
        let summaries = manager.summaries_for_period(t0(), t0() + Duration::days(2), None);
        assert_eq!(summaries.len(), 1);
        let (later, end) = (t0() + Duration::days(10), t0() + Duration::days(11));
        assert!(manager.summaries_for_period(later, end, None).is_empty());
    }

    #[test]
    fn new_rejects_invalid_config() {
        let mut config = EngineConfig::default();
        config.repository.backend = RepositoryBackend::File;
        assert!(matches!(
            WorldStateManager::new(config),
            Err(EngineError::Config(ConfigError::Invalid(_)))
        ));
    }

    #[test]
    fn none_backend_has_no_repository() {
        let mut config = EngineConfig::default();
        config.repository.backend = RepositoryBackend::None;
        let manager = WorldStateManager::new(config).unwrap();
        assert!(manager.store().repository().is_none());
        assert!(!manager.load_from_repository());
    }

    #[test]
    fn file_backend_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = daily_only();
        config.repository = RepositoryConfig::file(dir.path().join("world"));
        let clock = Arc::new(ManualClock::new(t0()));

        let snapshot_id = {
            let repo = open_repository(&config.repository).unwrap();
            let manager = WorldStateManager::from_parts(config.clone(), repo, clock.clone());
            manager.store().set("gold", 100, Some("r1")).unwrap();
            let snap = manager
                .snapshots()
                .create_snapshot(Some("r1"), true, BTreeMap::new())
                .unwrap();
            clock.advance(Duration::hours(2));
            manager.store().set("gold", 50, Some("r1")).unwrap();
            clock.advance(Duration::days(2));
            manager.process_tick();
            assert!(manager.save_to_repository());
            snap.snapshot_id
        };

        let repo = open_repository(&config.repository).unwrap();
        let manager = WorldStateManager::from_parts(config, repo, clock.clone());
        assert!(manager.load_from_repository());
        assert_eq!(
            manager.store().get("gold", Some("r1")),
            Some(StateValue::Int(50))
        );
        let snapshots = manager.snapshots();
        assert!(snapshots.snapshot(Some("r1"), snapshot_id).is_some());
        assert_eq!(
            manager.scheduler().covered_until(SnapshotLevel::Daily),
            Some(t0() + Duration::days(1) + Duration::hours(2))
        );

        let past = manager
            .history()
            .get_historical_state(Some("r1"), t0() + Duration::hours(1), false)
            .unwrap();
        assert_eq!(past.regional_state["gold"], StateValue::Int(100));
        assert_eq!(past.base_snapshot_id, snapshot_id);

        // New writes sort after everything loaded.
        let change = manager.store().set("gold", 10, Some("r1")).unwrap();
        assert!(change.seq > manager.store().history("gold", Some("r1"))[0].seq);
    }

    #[test]
    fn load_restores_snapshots_of_emptied_regions() {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let clock = Arc::new(ManualClock::new(t0()));

        let manager =
            WorldStateManager::from_parts(daily_only(), Some(repo.clone()), clock.clone());
        manager.store().set("walls", 3, Some("ruins")).unwrap();
        let snap = manager
            .snapshots()
            .create_snapshot(Some("ruins"), false, BTreeMap::new())
            .unwrap();
        manager
            .store()
            .delete("walls", Some("ruins"), None)
            .unwrap();
        assert!(manager.save_to_repository());

        let reloaded = WorldStateManager::from_parts(daily_only(), Some(repo), clock);
        assert!(reloaded.load_from_repository());
        assert_eq!(reloaded.store().get("walls", Some("ruins")), None);
        let restored = reloaded
            .snapshots()
            .snapshot(Some("ruins"), snap.snapshot_id);
        assert_eq!(
            restored.map(|s| s.local_state["walls"].clone()),
            Some(StateValue::Int(3))
        );
    }

    #[test]
    fn set_then_get_through_manager() {
        let (_, manager) = memory_manager(EngineConfig::default());
        manager.store().set("ruler", "Maren", Some("r1")).unwrap();
        assert_eq!(
            manager.store().get("ruler", Some("r1")),
            Some(StateValue::from("Maren"))
        );
    }
}
