//! Tiered compaction of the change log into summaries, followed by pruning.
//!
//! Each pass walks the tiers finest first. A due tier summarizes the next
//! window in its sequence, one summary per region, and then asks the
//! repository to delete detail older than its retention cutoff. Pruning is
//! clamped so that nothing is deleted that some enabled tier has not yet
//! summarized.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, info_span, warn};
use worldstate_common::{
    HistoricalSummary, KeyChange, RegionId, SnapshotLevel, SummaryId, WorldStateChange,
    compression_ratio,
};
use worldstate_kernel::{SignificancePolicy, StateStore};

use crate::schedule::{RetentionSchedule, TierPolicy};

#[derive(Debug, Clone, Copy, Default)]
struct TierState {
    last_run: Option<DateTime<Utc>>,
    /// End of the last window summarized without failures.
    covered_until: Option<DateTime<Utc>>,
    /// Window whose summaries did not all persist; retried as-is.
    retry: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

/// What one tier did in one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TierOutcome {
    created: usize,
    failed: usize,
    window: (DateTime<Utc>, DateTime<Utc>),
    changes: usize,
}

/// Runs summarization passes over the change log of one store.
pub struct SummarizationScheduler {
    store: StateStore,
    schedule: RetentionSchedule,
    enabled: bool,
    tiers: Mutex<BTreeMap<SnapshotLevel, TierState>>,
    /// Summaries produced while no repository is configured.
    unpersisted: Mutex<Vec<HistoricalSummary>>,
}

impl std::fmt::Debug for SummarizationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummarizationScheduler")
            .field("schedule", &self.schedule)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl SummarizationScheduler {
    pub fn new(store: StateStore, schedule: RetentionSchedule) -> Self {
        Self {
            store,
            schedule,
            enabled: true,
            tiers: Mutex::new(BTreeMap::new()),
            unpersisted: Mutex::new(Vec::new()),
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn schedule(&self) -> &RetentionSchedule {
        &self.schedule
    }

    pub fn last_run(&self, level: SnapshotLevel) -> Option<DateTime<Utc>> {
        self.tiers.lock().get(&level).and_then(|s| s.last_run)
    }

    /// End of the newest window `level` has fully summarized.
    pub fn covered_until(&self, level: SnapshotLevel) -> Option<DateTime<Utc>> {
        self.tiers.lock().get(&level).and_then(|s| s.covered_until)
    }

    /// Summaries kept in memory because there was nowhere to persist them.
    pub fn unpersisted_summaries(&self) -> Vec<HistoricalSummary> {
        self.unpersisted.lock().clone()
    }

    /// Seed each tier's coverage from summaries already in the repository,
    /// so a restarted process continues the window sequence instead of
    /// starting over. Returns how many tiers were resumed.
    pub fn resume_from_repository(&self) -> usize {
        let Some(repo) = self.store.repository() else {
            return 0;
        };
        let mut resumed = 0;
        for (level, _) in self.schedule.iter() {
            let stored = match repo.load_summaries(
                level,
                DateTime::<Utc>::MIN_UTC,
                DateTime::<Utc>::MAX_UTC,
            ) {
                Ok(stored) => stored,
                Err(err) => {
                    warn!(tier = %level, error = %err, "failed to load summaries");
                    continue;
                }
            };
            let Some(covered) = stored.iter().map(|s| s.period_end).max() else {
                continue;
            };
            let last_run = stored.iter().map(|s| s.created_at).max();
            let mut tiers = self.tiers.lock();
            let state = tiers.entry(level).or_default();
            state.covered_until = Some(state.covered_until.map_or(covered, |c| c.max(covered)));
            state.last_run = state.last_run.max(last_run);
            resumed += 1;
        }
        debug!(resumed, "summarization coverage resumed");
        resumed
    }

    /// Run every tier that is due (or every tier, with `force`) and return
    /// how many summaries each created.
    pub fn process_batch_summarization(&self, force: bool) -> BTreeMap<SnapshotLevel, usize> {
        let mut created = BTreeMap::new();
        if !self.enabled {
            debug!("summarization disabled");
            return created;
        }

        let now = self.store.clock().now();
        let _span = info_span!("summarization", force, %now).entered();

        for (level, policy) in self.schedule.iter() {
            let last_run = self.last_run(level);
            let due = force || last_run.is_none_or(|t| now - t >= policy.frequency());
            if !due {
                continue;
            }

            let Some(outcome) = self.summarize_period(level, policy, now) else {
                continue;
            };
            created.insert(level, outcome.created);

            if outcome.failed > 0 {
                error!(
                    tier = %level,
                    failed = outcome.failed,
                    "summaries failed to persist; tier will retry"
                );
                self.tiers.lock().entry(level).or_default().retry = Some(outcome.window);
                continue;
            }

            {
                let mut tiers = self.tiers.lock();
                let state = tiers.entry(level).or_default();
                state.last_run = Some(now);
                state.retry = None;
                state.covered_until = Some(
                    state
                        .covered_until
                        .map_or(outcome.window.1, |c| c.max(outcome.window.1)),
                );
            }

            if outcome.changes > 0 {
                self.prune(level, policy, now);
            }
        }

        let total: usize = created.values().sum();
        info!(total, tiers = created.len(), "summarization pass complete");
        created
    }

    /// Summarize the next window for `level`: one summary per region.
    ///
    /// `None` when the tier's frequency reaches past the start of the
    /// calendar, so no window can be placed.
    fn summarize_period(
        &self,
        level: SnapshotLevel,
        policy: TierPolicy,
        now: DateTime<Utc>,
    ) -> Option<TierOutcome> {
        let frequency = policy.frequency();
        let Some((default_start, default_end)) = window_before(now, frequency) else {
            warn!(
                tier = %level,
                frequency_days = policy.frequency_days,
                "tier frequency is out of range; skipping"
            );
            return None;
        };
        let state = self.tiers.lock().get(&level).copied().unwrap_or_default();

        let (window, by_region) = {
            let view = self.store.history_view();
            let (start, end) = state.retry.unwrap_or_else(|| {
                let start = state.covered_until.unwrap_or_else(|| {
                    view.oldest_change()
                        .map_or(default_start, |oldest| oldest.min(default_start))
                });
                (start, default_end)
            });
            if start >= end {
                return Some(TierOutcome {
                    created: 0,
                    failed: 0,
                    window: (start, start.max(end)),
                    changes: 0,
                });
            }

            let mut by_region: BTreeMap<RegionId, Vec<WorldStateChange>> = BTreeMap::new();
            for change in view
                .changes_between(start, end)
                .iter()
                .filter(|c| c.timestamp < end)
            {
                by_region
                    .entry(change.region.clone())
                    .or_default()
                    .push(change.clone());
            }
            ((start, end), by_region)
        };
        let (start, end) = window;

        let changes = by_region.values().map(Vec::len).sum();
        let mut outcome = TierOutcome {
            created: 0,
            failed: 0,
            window: (start, end),
            changes,
        };
        let repository = self.store.repository();

        for (region, region_changes) in &by_region {
            let summary = create_period_summary(
                level,
                region,
                start,
                end,
                region_changes,
                self.store.policy(),
                now,
            );
            match &repository {
                Some(repo) => match repo.save_summary(&summary) {
                    Ok(()) => outcome.created += 1,
                    Err(err) => {
                        warn!(
                            tier = %level,
                            region = %region,
                            error = %err,
                            "failed to save summary"
                        );
                        outcome.failed += 1;
                    }
                },
                None => {
                    let mut kept = self.unpersisted.lock();
                    if !kept.iter().any(|s| s.summary_id == summary.summary_id) {
                        kept.push(summary);
                    }
                    outcome.created += 1;
                }
            }
        }

        debug!(
            tier = %level,
            %start,
            %end,
            changes,
            created = outcome.created,
            "period summarized"
        );
        Some(outcome)
    }

    /// Delete detail past `level`'s retention, never past what every
    /// enabled tier has already summarized.
    fn prune(&self, level: SnapshotLevel, policy: TierPolicy, now: DateTime<Utc>) {
        let Some(repo) = self.store.repository() else {
            debug!(tier = %level, "no repository; skipping prune");
            return;
        };

        let coverage = {
            let tiers = self.tiers.lock();
            self.schedule
                .iter()
                .map(|(l, _)| tiers.get(&l).and_then(|s| s.covered_until))
                .collect::<Option<Vec<_>>>()
        };
        let Some(coverage) = coverage else {
            debug!(tier = %level, "not every tier has summarized yet; skipping prune");
            return;
        };
        let Some(retention_cutoff) = now.checked_sub_signed(policy.retention()) else {
            debug!(tier = %level, "retention reaches past the calendar; nothing to prune");
            return;
        };
        let cutoff = coverage
            .into_iter()
            .fold(retention_cutoff, |acc, c| acc.min(c));

        match repo.delete_changes_before(cutoff) {
            Ok(deleted) => {
                let local = self.store.prune_changes_before(cutoff);
                info!(tier = %level, %cutoff, deleted, local, "pruned change detail");
            }
            Err(err) => {
                warn!(
                    tier = %level,
                    %cutoff,
                    error = %err,
                    "prune failed; will retry next pass"
                );
            }
        }
    }
}

/// The default window ending one `frequency` before `now`, one
/// `frequency` long. `None` if either bound falls off the calendar.
fn window_before(
    now: DateTime<Utc>,
    frequency: Duration,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let end = now.checked_sub_signed(frequency)?;
    let start = end.checked_sub_signed(frequency)?;
    Some((start, end))
}

/// Whole days, or whole hours when under a day.
fn describe_span(span: Duration) -> String {
    let days = span.num_days();
    if days >= 1 {
        format!("{days} days")
    } else {
        format!("{} hours", span.num_hours())
    }
}

/// Build the summary of `changes` for one region and one tier window.
///
/// Key changes are the ones `policy` deems significant. The id is derived
/// from tier, region and window, so rebuilding the same window yields the
/// same id.
pub fn create_period_summary(
    level: SnapshotLevel,
    region: &RegionId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    changes: &[WorldStateChange],
    policy: &SignificancePolicy,
    now: DateTime<Utc>,
) -> HistoricalSummary {
    let key_changes: Vec<KeyChange> = changes
        .iter()
        .filter(|c| policy.is_key_change(c))
        .map(KeyChange::from)
        .collect();
    let categories: BTreeSet<_> = changes.iter().map(|c| c.category).collect();
    let category_list = if categories.is_empty() {
        "no specific categories".to_string()
    } else {
        categories
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut summary_text = format!(
        "During this {level} period, region {region} experienced {} state changes \
         affecting {category_list}.",
        changes.len()
    );
    let span = end - start;
    if span > level.nominal_length() {
        summary_text.push_str(&format!(
            " This catch-up window spans {}.",
            describe_span(span)
        ));
    }
    summary_text.push_str(&format!(
        " Summary generated on {}.",
        now.format("%Y-%m-%d %H:%M:%S")
    ));
    let summary_id = SummaryId::derived(&format!(
        "{level}/{region}/{}/{}",
        start.to_rfc3339(),
        end.to_rfc3339()
    ));

    HistoricalSummary {
        summary_id,
        period_start: start,
        period_end: end,
        period_type: level,
        regions_affected: vec![region.clone()],
        summary_text,
        compression_ratio: compression_ratio(key_changes.len(), changes.len()),
        key_changes,
        original_change_count: changes.len(),
        categories_affected: categories.into_iter().collect(),
        created_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;
    use worldstate_common::{ManualClock, RegionalSnapshot, StateCategory, StateValue};
    use worldstate_kernel::{Repository, RepositoryError, StateWrite, WorldState};
    use worldstate_persist::InMemoryRepository;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        Summary {
            level: SnapshotLevel,
            end: DateTime<Utc>,
        },
        Delete(DateTime<Utc>),
    }

    /// Records the order of summary saves and prunes; can fail one region.
    #[derive(Default)]
    struct AuditRepository {
        inner: InMemoryRepository,
        ops: Mutex<Vec<Op>>,
        fail_region: Mutex<Option<RegionId>>,
    }

    impl Repository for AuditRepository {
        fn save_state(&self, state: &WorldState) -> Result<(), RepositoryError> {
            self.inner.save_state(state)
        }

        fn load_state(&self) -> Result<Option<WorldState>, RepositoryError> {
            self.inner.load_state()
        }

        fn save_snapshot(&self, snapshot: &RegionalSnapshot) -> Result<(), RepositoryError> {
            self.inner.save_snapshot(snapshot)
        }

        fn load_snapshots(
            &self,
            region: &RegionId,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<RegionalSnapshot>, RepositoryError> {
            self.inner.load_snapshots(region, start, end)
        }

        fn snapshot_regions(&self) -> Result<Vec<RegionId>, RepositoryError> {
            self.inner.snapshot_regions()
        }

        fn save_summary(&self, summary: &HistoricalSummary) -> Result<(), RepositoryError> {
            if let Some(region) = self.fail_region.lock().as_ref()
                && summary.affects(region)
            {
                return Err(RepositoryError::Unavailable("disk full".into()));
            }
            self.ops.lock().push(Op::Summary {
                level: summary.period_type,
                end: summary.period_end,
            });
            self.inner.save_summary(summary)
        }

        fn load_summaries(
            &self,
            level: SnapshotLevel,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<HistoricalSummary>, RepositoryError> {
            self.inner.load_summaries(level, start, end)
        }

        fn delete_changes_before(&self, cutoff: DateTime<Utc>) -> Result<usize, RepositoryError> {
            self.ops.lock().push(Op::Delete(cutoff));
            self.inner.delete_changes_before(cutoff)
        }
    }

    fn two_tiers() -> RetentionSchedule {
        RetentionSchedule::empty()
            .with_tier(SnapshotLevel::Daily, TierPolicy::new(1, 2))
            .with_tier(SnapshotLevel::Weekly, TierPolicy::new(7, 14))
    }

    /// Thirty days of writes every six hours in two regions.
    fn populate(store: &StateStore, clock: &ManualClock) {
        for step in 0..120i64 {
            clock.set(t0() + Duration::hours(6 * step));
            store
                .apply(
                    StateWrite::new("gold", step)
                        .region("r1")
                        .category(StateCategory::Economic),
                )
                .unwrap();
            store
                .apply(
                    StateWrite::new("troops", step * 150)
                        .region("r2")
                        .category(StateCategory::Social),
                )
                .unwrap();
        }
        clock.set(t0() + Duration::days(30));
    }

    fn setup(repo: Option<Arc<AuditRepository>>) -> (Arc<ManualClock>, StateStore) {
        let clock = Arc::new(ManualClock::new(t0()));
        let mut builder = StateStore::builder().clock(clock.clone());
        if let Some(repo) = repo {
            builder = builder.repository(repo);
        }
        let store = builder.build();
        populate(&store, &clock);
        (clock, store)
    }

    fn assert_summaries_precede_deletes(ops: &[Op], levels: &[SnapshotLevel]) {
        for (i, op) in ops.iter().enumerate() {
            let Op::Delete(cutoff) = op else { continue };
            for level in levels {
                assert!(
                    ops[..i].iter().any(|prior| matches!(
                        prior,
                        Op::Summary { level: l, end } if l == level && end >= cutoff
                    )),
                    "delete before {cutoff} has no covering {level} summary"
                );
            }
        }
    }

    #[test]
    fn summaries_are_saved_before_detail_is_pruned() {
        let repo = Arc::new(AuditRepository::default());
        let (clock, store) = setup(Some(repo.clone()));
        let scheduler = SummarizationScheduler::new(store.clone(), two_tiers());

        let created = scheduler.process_batch_summarization(false);
        assert_eq!(created[&SnapshotLevel::Daily], 2);
        assert_eq!(created[&SnapshotLevel::Weekly], 2);

        let levels = [SnapshotLevel::Daily, SnapshotLevel::Weekly];
        let ops = repo.ops.lock().clone();
        assert!(ops.iter().any(|op| matches!(op, Op::Delete(_))));
        assert_summaries_precede_deletes(&ops, &levels);

        let cutoff = t0() + Duration::days(16);
        assert_eq!(ops.last(), Some(&Op::Delete(cutoff)));
        assert!(store.history_view().oldest_change().unwrap() >= cutoff);
        // Live values are untouched by pruning.
        assert_eq!(store.get("gold", Some("r1")), Some(StateValue::Int(119)));

        // Next day only the daily tier is due.
        clock.advance(Duration::days(1));
        let created = scheduler.process_batch_summarization(false);
        assert_eq!(
            created.keys().collect::<Vec<_>>(),
            vec![&SnapshotLevel::Daily]
        );
        let ops = repo.ops.lock().clone();
        assert_summaries_precede_deletes(&ops, &levels);
        assert_eq!(ops.last(), Some(&Op::Delete(t0() + Duration::days(23))));
    }

    #[test]
    fn compression_stays_bounded() {
        let repo = Arc::new(AuditRepository::default());
        let (_, store) = setup(Some(repo.clone()));
        SummarizationScheduler::new(store, two_tiers()).process_batch_summarization(false);

        let summaries = repo.inner.summaries();
        assert_eq!(summaries.len(), 4);
        for s in &summaries {
            assert!((0.0..=1.0).contains(&s.compression_ratio));
            assert!(s.key_changes.len() <= s.original_change_count);
        }
        // r2's troop swings exceed the delta threshold; r1's gold does not.
        let r2 = RegionId::new("r2").unwrap();
        let troops = summaries.iter().find(|s| s.affects(&r2)).unwrap();
        assert!(troops.key_changes.len() >= troops.original_change_count - 1);
        let r1 = RegionId::new("r1").unwrap();
        let gold = summaries.iter().find(|s| s.affects(&r1)).unwrap();
        assert!(gold.key_changes.is_empty());
        assert_eq!(gold.compression_ratio, 0.0);
    }

    #[test]
    fn failed_region_blocks_pruning_and_retries_same_window() {
        let repo = Arc::new(AuditRepository::default());
        *repo.fail_region.lock() = Some(RegionId::new("r2").unwrap());
        let (clock, store) = setup(Some(repo.clone()));
        let scheduler = SummarizationScheduler::new(store.clone(), two_tiers());

        let created = scheduler.process_batch_summarization(false);
        // Other regions still get summarized.
        assert_eq!(created[&SnapshotLevel::Daily], 1);
        assert!(!repo.ops.lock().iter().any(|op| matches!(op, Op::Delete(_))));
        assert!(scheduler.last_run(SnapshotLevel::Daily).is_none());
        assert!(scheduler.covered_until(SnapshotLevel::Daily).is_none());
        let before = store.change_count();

        *repo.fail_region.lock() = None;
        clock.advance(Duration::hours(1));
        scheduler.process_batch_summarization(false);

        // Same windows, same ids: r1 summaries are not duplicated.
        assert_eq!(repo.inner.summary_count(), 4);
        assert!(scheduler.last_run(SnapshotLevel::Daily).is_some());
        assert_eq!(
            scheduler.covered_until(SnapshotLevel::Daily),
            Some(t0() + Duration::days(29))
        );
        assert!(store.change_count() < before);
        assert_summaries_precede_deletes(
            &repo.ops.lock(),
            &[SnapshotLevel::Daily, SnapshotLevel::Weekly],
        );
    }

    #[test]
    fn not_due_tiers_are_skipped_unless_forced() {
        let repo = Arc::new(AuditRepository::default());
        let (_, store) = setup(Some(repo));
        let scheduler = SummarizationScheduler::new(store, two_tiers());
        scheduler.process_batch_summarization(false);

        assert!(scheduler.process_batch_summarization(false).is_empty());
        let forced = scheduler.process_batch_summarization(true);
        assert_eq!(forced[&SnapshotLevel::Daily], 0);
        assert_eq!(forced[&SnapshotLevel::Weekly], 0);
    }

    #[test]
    fn disabled_scheduler_does_nothing() {
        let repo = Arc::new(AuditRepository::default());
        let (_, store) = setup(Some(repo.clone()));
        let scheduler = SummarizationScheduler::new(store, two_tiers()).enabled(false);
        assert!(scheduler.process_batch_summarization(true).is_empty());
        assert!(repo.ops.lock().is_empty());
    }

    #[test]
    fn without_repository_summaries_stay_in_memory() {
        let (_, store) = setup(None);
        let before = store.change_count();
        let scheduler = SummarizationScheduler::new(store.clone(), two_tiers());
        let created = scheduler.process_batch_summarization(false);
        let total: usize = created.values().sum();
        assert_eq!(total, 4);
        assert_eq!(scheduler.unpersisted_summaries().len(), 4);
        assert_eq!(store.change_count(), before);
    }

    #[test]
    fn restarted_scheduler_continues_from_stored_coverage() {
        let repo = Arc::new(AuditRepository::default());
        let (clock, store) = setup(Some(repo.clone()));
        SummarizationScheduler::new(store.clone(), two_tiers()).process_batch_summarization(false);
        let stored = repo.inner.summary_count();

        let restarted = SummarizationScheduler::new(store, two_tiers());
        assert_eq!(restarted.resume_from_repository(), 2);
        assert_eq!(
            restarted.covered_until(SnapshotLevel::Daily),
            Some(t0() + Duration::days(29))
        );
        assert!(restarted.process_batch_summarization(false).is_empty());

        clock.advance(Duration::days(1));
        restarted.process_batch_summarization(false);
        let daily: Vec<_> = repo
            .inner
            .summaries()
            .into_iter()
            .filter(|s| s.period_type == SnapshotLevel::Daily)
            .collect();
        assert_eq!(repo.inner.summary_count(), stored + 2);
        let resumed_start = t0() + Duration::days(29);
        assert!(daily.iter().any(|s| s.period_start == resumed_start));
    }

    #[test]
    fn default_schedule_never_runs_hourly() {
        let repo = Arc::new(AuditRepository::default());
        let (_, store) = setup(Some(repo));
        let created = SummarizationScheduler::new(store, RetentionSchedule::default())
            .process_batch_summarization(true);
        assert!(!created.contains_key(&SnapshotLevel::Hourly));
        assert_eq!(created.len(), 5);
    }

    #[test]
    fn period_summary_text_and_id() {
        let store = StateStore::new();
        store
            .apply(
                StateWrite::new("ruler", "Maren")
                    .region("r1")
                    .category(StateCategory::Political),
            )
            .unwrap();
        store
            .apply(
                StateWrite::new("bread", 3)
                    .region("r1")
                    .category(StateCategory::Economic),
            )
            .unwrap();
        let changes = store
            .history("ruler", Some("r1"))
            .into_iter()
            .chain(store.history("bread", Some("r1")))
            .collect::<Vec<_>>();
        let region = RegionId::new("r1").unwrap();
        let end = t0() + Duration::days(1);
        let policy = SignificancePolicy::default();
        let daily = |start, now| {
            create_period_summary(
                SnapshotLevel::Daily,
                &region,
                start,
                end,
                &changes,
                &policy,
                now,
            )
        };

        let a = daily(t0(), end);
        let b = daily(t0(), end + Duration::hours(3));
        assert_eq!(a.summary_id, b.summary_id);
        assert_eq!(a.key_changes.len(), 1);
        assert_eq!(a.key_changes[0].key, "ruler");
        assert_eq!(a.compression_ratio, 0.5);
        assert_eq!(
            a.summary_text,
            "During this daily period, region r1 experienced 2 state changes affecting \
             political, economic. Summary generated on 2024-01-02 00:00:00."
        );

        let catch_up = daily(t0() - Duration::days(2), end);
        assert!(
            catch_up
                .summary_text
                .contains("This catch-up window spans 3 days."),
            "{}",
            catch_up.summary_text
        );

        let weekly = create_period_summary(
            SnapshotLevel::Weekly,
            &region,
            t0(),
            end,
            &changes,
            &policy,
            end,
        );
        assert_ne!(weekly.summary_id, a.summary_id);
        assert!(!weekly.summary_text.contains("catch-up"));
    }

    #[test]
    fn first_pass_over_old_history_is_labelled_catch_up() {
        let repo = Arc::new(AuditRepository::default());
        let (_, store) = setup(Some(repo.clone()));
        SummarizationScheduler::new(store, two_tiers()).process_batch_summarization(false);
        let daily: Vec<_> = repo
            .inner
            .summaries()
            .into_iter()
            .filter(|s| s.period_type == SnapshotLevel::Daily)
            .collect();
        assert!(!daily.is_empty());
        for summary in &daily {
            assert!(summary.summary_text.contains("This catch-up window spans"));
            assert!(summary.summary_text.contains(" Summary generated on "));
        }
    }

    #[test]
    fn out_of_range_tiers_are_skipped_without_panicking() {
        let repo = Arc::new(AuditRepository::default());
        let (_, store) = setup(Some(repo.clone()));
        // Not validated: a hand-built schedule can still carry these.
        let schedule = RetentionSchedule::empty()
            .with_tier(SnapshotLevel::Daily, TierPolicy::new(1, 2))
            .with_tier(SnapshotLevel::Weekly, TierPolicy::new(7, u32::MAX))
            .with_tier(SnapshotLevel::Yearly, TierPolicy::new(u32::MAX, u32::MAX));
        let scheduler = SummarizationScheduler::new(store, schedule);

        let created = scheduler.process_batch_summarization(true);
        assert_eq!(created.get(&SnapshotLevel::Daily), Some(&2));
        assert_eq!(created.get(&SnapshotLevel::Weekly), Some(&2));
        assert!(!created.contains_key(&SnapshotLevel::Yearly));
        assert_eq!(scheduler.covered_until(SnapshotLevel::Yearly), None);
        // The yearly tier never covers anything, so nothing is pruned.
        assert!(!repo.ops.lock().iter().any(|op| matches!(op, Op::Delete(_))));
    }
}
