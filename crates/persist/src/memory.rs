use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use worldstate_common::{HistoricalSummary, RegionId, RegionalSnapshot, SnapshotLevel, SummaryId};
use worldstate_kernel::{Repository, RepositoryError, WorldState};

#[derive(Debug, Default)]
struct Inner {
    state: Option<WorldState>,
    snapshots: Vec<RegionalSnapshot>,
    summaries: BTreeMap<SummaryId, HistoricalSummary>,
    prune_cutoffs: Vec<DateTime<Utc>>,
}

/// Repository that keeps everything in process memory.
///
/// Useful for tests and for running without durable storage while still
/// exercising summarization and pruning.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    inner: RwLock<Inner>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot_count(&self) -> usize {
        self.inner.read().snapshots.len()
    }

    pub fn summary_count(&self) -> usize {
        self.inner.read().summaries.len()
    }

    /// Every stored summary, ordered by id.
    pub fn summaries(&self) -> Vec<HistoricalSummary> {
        self.inner.read().summaries.values().cloned().collect()
    }

    /// Cutoffs passed to `delete_changes_before`, in call order.
    pub fn prune_cutoffs(&self) -> Vec<DateTime<Utc>> {
        self.inner.read().prune_cutoffs.clone()
    }
}

impl Repository for InMemoryRepository {
    fn save_state(&self, state: &WorldState) -> Result<(), RepositoryError> {
        self.inner.write().state = Some(state.clone());
        Ok(())
    }

    fn load_state(&self) -> Result<Option<WorldState>, RepositoryError> {
        Ok(self.inner.read().state.clone())
    }

    fn save_snapshot(&self, snapshot: &RegionalSnapshot) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write();
        if !inner
            .snapshots
            .iter()
            .any(|s| s.snapshot_id == snapshot.snapshot_id)
        {
            inner.snapshots.push(snapshot.clone());
        }
        Ok(())
    }

    fn load_snapshots(
        &self,
        region: &RegionId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RegionalSnapshot>, RepositoryError> {
        let mut found: Vec<_> = self
            .inner
            .read()
            .snapshots
            .iter()
            .filter(|s| &s.region_id == region && s.timestamp >= start && s.timestamp <= end)
            .cloned()
            .collect();
        found.sort_by_key(|s| (s.timestamp, s.change_seq));
        Ok(found)
    }

    fn snapshot_regions(&self) -> Result<Vec<RegionId>, RepositoryError> {
        let regions: BTreeSet<RegionId> = self
            .inner
            .read()
            .snapshots
            .iter()
            .map(|s| s.region_id.clone())
            .collect();
        Ok(regions.into_iter().collect())
    }

    fn save_summary(&self, summary: &HistoricalSummary) -> Result<(), RepositoryError> {
        self.inner
            .write()
            .summaries
            .entry(summary.summary_id)
            .or_insert_with(|| summary.clone());
        Ok(())
    }

    fn load_summaries(
        &self,
        level: SnapshotLevel,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HistoricalSummary>, RepositoryError> {
        let mut found: Vec<_> = self
            .inner
            .read()
            .summaries
            .values()
            .filter(|s| s.period_type == level && s.overlaps(start, end))
            .cloned()
            .collect();
        found.sort_by_key(|s| s.period_start);
        Ok(found)
    }

    fn delete_changes_before(&self, cutoff: DateTime<Utc>) -> Result<usize, RepositoryError> {
        let mut inner = self.inner.write();
        inner.prune_cutoffs.push(cutoff);
        Ok(inner
            .state
            .as_mut()
            .map_or(0, |state| state.prune_changes_before(cutoff)))
    }
}
