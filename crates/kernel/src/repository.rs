use chrono::{DateTime, Utc};
use worldstate_common::{HistoricalSummary, RegionId, RegionalSnapshot, SnapshotLevel};

use crate::world::WorldState;

/// Errors raised by a persistence backend.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Codec(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Durable storage for world state, snapshots and summaries.
///
/// Every method is synchronous. Components that call a repository treat a
/// failure as a soft error: they log it and report `false`, zero or an
/// empty result instead of propagating.
pub trait Repository: Send + Sync {
    fn save_state(&self, state: &WorldState) -> Result<(), RepositoryError>;

    /// `Ok(None)` when nothing has been saved yet.
    fn load_state(&self) -> Result<Option<WorldState>, RepositoryError>;

    fn save_snapshot(&self, snapshot: &RegionalSnapshot) -> Result<(), RepositoryError>;

    /// Snapshots of `region` with `start <= timestamp <= end`, oldest first.
    fn load_snapshots(
        &self,
        region: &RegionId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RegionalSnapshot>, RepositoryError>;

    /// Every region with at least one stored snapshot.
    fn snapshot_regions(&self) -> Result<Vec<RegionId>, RepositoryError>;

    /// Summaries are keyed by id. Saving an id that is already stored is a
    /// successful no-op.
    fn save_summary(&self, summary: &HistoricalSummary) -> Result<(), RepositoryError>;

    /// Summaries of `level` whose period overlaps `[start, end]`.
    fn load_summaries(
        &self,
        level: SnapshotLevel,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HistoricalSummary>, RepositoryError>;

    /// Remove persisted change records older than `cutoff`. Returns how many.
    fn delete_changes_before(&self, cutoff: DateTime<Utc>) -> Result<usize, RepositoryError>;
}
