//! Test doubles shared by the kernel's unit tests.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::mpsc::{self, Receiver, Sender};
use worldstate_common::{HistoricalSummary, RegionId, RegionalSnapshot, SnapshotLevel};

use crate::repository::{Repository, RepositoryError};
use crate::world::WorldState;

pub(crate) fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Keeps everything in memory; optionally fails every call or holds the
/// first snapshot save until released.
#[derive(Default)]
pub(crate) struct RecordingRepository {
    fail: bool,
    state: Mutex<Option<WorldState>>,
    snapshots: Mutex<Vec<RegionalSnapshot>>,
    gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
}

impl RecordingRepository {
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// The first `save_snapshot` signals the returned receiver, then waits
    /// until the returned sender fires.
    pub(crate) fn gated() -> (Self, Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let repo = Self {
            gate: Mutex::new(Some((entered_tx, release_rx))),
            ..Self::default()
        };
        (repo, entered_rx, release_tx)
    }

    pub(crate) fn snapshot_count(&self) -> usize {
        self.snapshots.lock().len()
    }

    fn check(&self) -> Result<(), RepositoryError> {
        if self.fail {
            return Err(RepositoryError::Unavailable("test backend down".into()));
        }
        Ok(())
    }
}

impl Repository for RecordingRepository {
    fn save_state(&self, state: &WorldState) -> Result<(), RepositoryError> {
        self.check()?;
        *self.state.lock() = Some(state.clone());
        Ok(())
    }

    fn load_state(&self) -> Result<Option<WorldState>, RepositoryError> {
        self.check()?;
        Ok(self.state.lock().clone())
    }

    fn save_snapshot(&self, snapshot: &RegionalSnapshot) -> Result<(), RepositoryError> {
        self.check()?;
        let gate = self.gate.lock().take();
        if let Some((entered, release)) = gate {
            let _ = entered.send(());
            let _ = release.recv();
        }
        self.snapshots.lock().push(snapshot.clone());
        Ok(())
    }

    fn snapshot_regions(&self) -> Result<Vec<RegionId>, RepositoryError> {
        self.check()?;
        let mut regions: Vec<_> = self
            .snapshots
            .lock()
            .iter()
            .map(|s| s.region_id.clone())
            .collect();
        regions.sort();
        regions.dedup();
        Ok(regions)
    }

    fn load_snapshots(
        &self,
        region: &RegionId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RegionalSnapshot>, RepositoryError> {
        self.check()?;
        Ok(self
            .snapshots
            .lock()
            .iter()
            .filter(|s| &s.region_id == region && s.timestamp >= start && s.timestamp <= end)
            .cloned()
            .collect())
    }

    fn save_summary(&self, _summary: &HistoricalSummary) -> Result<(), RepositoryError> {
        self.check()
    }

    fn load_summaries(
        &self,
        _level: SnapshotLevel,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<HistoricalSummary>, RepositoryError> {
        self.check()?;
        Ok(Vec::new())
    }

    fn delete_changes_before(&self, _cutoff: DateTime<Utc>) -> Result<usize, RepositoryError> {
        self.check()?;
        Ok(0)
    }
}
