use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use worldstate_common::snapshot::{KIND_ROLLBACK_BACKUP, META_KIND};
use worldstate_common::{RegionId, RegionalSnapshot, SnapshotId, ValidationError};

use crate::events::WorldEvent;
use crate::store::{Shared, Staged};

/// Point-in-time copies of regional state, and rollback to them.
///
/// Shares live state with the [`StateStore`](crate::StateStore) it came
/// from. Snapshots are immutable once taken and kept per region in time
/// order.
#[derive(Clone)]
pub struct SnapshotManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SnapshotManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let live = self.shared.live.read();
        let snapshots: usize = live.snapshots.values().map(Vec::len).sum();
        f.debug_struct("SnapshotManager")
            .field("regions", &live.snapshots.len())
            .field("snapshots", &snapshots)
            .finish()
    }
}

impl SnapshotManager {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Capture the current state of `region` (global when `None`).
    ///
    /// The snapshot is kept in memory, handed to the repository if one is
    /// configured, and announced as `snapshot_created`. A failed repository
    /// write is logged; the snapshot is still returned.
    pub fn create_snapshot(
        &self,
        region: Option<&str>,
        include_global_context: bool,
        metadata: BTreeMap<String, String>,
    ) -> Result<RegionalSnapshot, ValidationError> {
        let region = RegionId::scope(region)?;
        let now = self.shared.clock.now();
        let snapshot = {
            let mut live = self.shared.live.write();
            let at = live.stamp(now);
            let snapshot = live.capture(&region, at, include_global_context, metadata);
            let mut staged = Staged::default();
            staged.snapshot(snapshot.clone());
            staged.enqueue(&self.shared);
            snapshot
        };
        debug!(
            region = %region,
            snapshot = %snapshot.snapshot_id,
            keys = snapshot.local_state.len(),
            "snapshot created"
        );
        self.shared.drain();
        Ok(snapshot)
    }

    /// Restore `region` to the state captured in `snapshot_id`.
    ///
    /// With `atomic`, a backup snapshot of the current state is taken first.
    /// The region's map is replaced in one step and recorded as a single
    /// change under the region's rollback key. Returns `false`, leaving
    /// state untouched, if the snapshot does not exist for that region.
    pub fn rollback_to_snapshot(
        &self,
        region: Option<&str>,
        snapshot_id: SnapshotId,
        atomic: bool,
    ) -> bool {
        let region = match RegionId::scope(region) {
            Ok(region) => region,
            Err(err) => {
                error!(error = %err, "rollback rejected");
                return false;
            }
        };

        let now = self.shared.clock.now();
        let mut staged = Staged::default();
        {
            let mut live = self.shared.live.write();
            let Some(target) = live
                .snapshots
                .get(&region)
                .and_then(|list| list.iter().find(|s| s.snapshot_id == snapshot_id))
                .cloned()
            else {
                error!(
                    region = %region,
                    snapshot = %snapshot_id,
                    "snapshot not found for rollback"
                );
                return false;
            };

            let at = live.stamp(now);
            if atomic {
                let metadata = BTreeMap::from([
                    (META_KIND.to_string(), KIND_ROLLBACK_BACKUP.to_string()),
                    ("original_snapshot".to_string(), snapshot_id.to_string()),
                ]);
                staged.snapshot(live.capture(&region, at, true, metadata));
            }

            let reason = format!("Rollback to snapshot {snapshot_id}");
            live.world
                .restore_scope(&region, &target.local_state, reason, at);
            staged.event(WorldEvent::StateRolledBack {
                region: region.clone(),
                snapshot_id,
                timestamp: at,
            });
            staged.enqueue(&self.shared);
        }

        info!(region = %region, snapshot = %snapshot_id, atomic, "state rolled back");
        self.shared.drain();
        true
    }

    /// Every snapshot held for `region`, oldest first.
    pub fn snapshots(&self, region: Option<&str>) -> Vec<RegionalSnapshot> {
        let Ok(region) = RegionId::scope(region) else {
            return Vec::new();
        };
        self.shared
            .live
            .read()
            .snapshots
            .get(&region)
            .cloned()
            .unwrap_or_default()
    }

    pub fn snapshot(
        &self,
        region: Option<&str>,
        snapshot_id: SnapshotId,
    ) -> Option<RegionalSnapshot> {
        let region = RegionId::scope(region).ok()?;
        self.shared
            .live
            .read()
            .snapshots
            .get(&region)?
            .iter()
            .find(|s| s.snapshot_id == snapshot_id)
            .cloned()
    }

    pub fn latest(&self, region: Option<&str>) -> Option<RegionalSnapshot> {
        let region = RegionId::scope(region).ok()?;
        self.shared
            .live
            .read()
            .snapshots
            .get(&region)?
            .last()
            .cloned()
    }

    /// Load persisted snapshots of `region` taken in `[start, end]` into
    /// memory. Returns how many were new.
    pub fn restore_from_repository(
        &self,
        region: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> usize {
        let Some(repo) = &self.shared.repository else {
            return 0;
        };
        let Ok(region) = RegionId::scope(region) else {
            return 0;
        };
        let loaded = match repo.load_snapshots(&region, start, end) {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(region = %region, error = %err, "failed to load snapshots");
                return 0;
            }
        };
        let added = self.shared.live.write().merge_snapshots(loaded);
        debug!(region = %region, added, "snapshots restored");
        added
    }
}
