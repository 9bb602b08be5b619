//! File-backed repository.
//!
//! Layout inside the store directory:
//! ```text
//! world.meta.json                                   - metadata and schema versions
//! state/
//!   current.state.cbor.zst                          - latest saved world state
//! snapshots/<region>/
//!   <timestamp>_<id>.snapshot.cbor.zst              - CBOR+zstd regional snapshots
//! summaries/<tier>/
//!   <start>_<end>_<id>.summary.cbor.zst             - CBOR+zstd historical summaries
//! integrity/
//!   manifest.json                                   - hash chain manifest
//! ```
//!
//! Snapshot and summary files are append-only and chained in the manifest.
//! The state file is rewritten on every save; its hash is tracked separately.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use worldstate_common::{HistoricalSummary, RegionId, RegionalSnapshot, SnapshotLevel};
use worldstate_kernel::{Repository, RepositoryError, WorldState};

/// Current schema versions.
const STATE_SCHEMA_VERSION: u32 = 1;
const RECORD_SCHEMA_VERSION: u32 = 1;

const META_FILE: &str = "world.meta.json";
const MANIFEST_FILE: &str = "integrity/manifest.json";
const STATE_FILE: &str = "state/current.state.cbor.zst";
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.6fZ";

/// Errors from file-backed persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CBOR serialization error: {0}")]
    CborEncode(String),
    #[error("CBOR deserialization error: {0}")]
    CborDecode(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("integrity check failed for {file}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        file: String,
        expected: String,
        actual: String,
    },
    #[error("schema version mismatch: file has v{file_version}, expected v{expected_version}")]
    SchemaMismatch {
        file_version: u32,
        expected_version: u32,
    },
}

impl From<StoreError> for RepositoryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Io(e) => RepositoryError::Io(e),
            StoreError::CborEncode(msg) | StoreError::CborDecode(msg) => {
                RepositoryError::Codec(msg)
            }
            StoreError::Json(e) => RepositoryError::Codec(e.to_string()),
            e @ (StoreError::IntegrityMismatch { .. } | StoreError::SchemaMismatch { .. }) => {
                RepositoryError::Integrity(e.to_string())
            }
        }
    }
}

/// Metadata stored in world.meta.json.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldMeta {
    pub state_schema_version: u32,
    pub record_schema_version: u32,
    pub snapshot_count: u32,
    pub summary_count: u32,
    pub state_saves: u32,
}

/// A single entry in the integrity manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the store root.
    pub filename: String,
    pub sha256: String,
    pub prev_hash: Option<String>,
}

/// Hash chain over every snapshot and summary file, plus the hash of the
/// current state file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityManifest {
    pub entries: Vec<ManifestEntry>,
    pub state_sha256: Option<String>,
}

impl IntegrityManifest {
    fn hash_of(&self, filename: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.filename == filename)
            .map(|e| e.sha256.as_str())
    }
}

#[derive(Debug)]
struct Catalog {
    meta: WorldMeta,
    manifest: IntegrityManifest,
}

/// File-backed repository with schema versioning and integrity checking.
#[derive(Debug)]
pub struct FileRepository {
    root: PathBuf,
    catalog: Mutex<Catalog>,
}

impl FileRepository {
    /// Open or create a store at the given path.
    ///
    /// Fails closed if the existing metadata has a different schema version.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = path.as_ref().to_path_buf();
        for dir in ["state", "snapshots", "summaries", "integrity"] {
            std::fs::create_dir_all(root.join(dir))?;
        }

        let meta_path = root.join(META_FILE);
        let manifest_path = root.join(MANIFEST_FILE);

        let (meta, manifest) = if meta_path.exists() {
            let meta: WorldMeta = serde_json::from_reader(std::fs::File::open(&meta_path)?)?;
            if meta.state_schema_version != STATE_SCHEMA_VERSION {
                return Err(StoreError::SchemaMismatch {
                    file_version: meta.state_schema_version,
                    expected_version: STATE_SCHEMA_VERSION,
                });
            }
            if meta.record_schema_version != RECORD_SCHEMA_VERSION {
                return Err(StoreError::SchemaMismatch {
                    file_version: meta.record_schema_version,
                    expected_version: RECORD_SCHEMA_VERSION,
                });
            }
            let manifest: IntegrityManifest = if manifest_path.exists() {
                serde_json::from_reader(std::fs::File::open(&manifest_path)?)?
            } else {
                IntegrityManifest::default()
            };
            (meta, manifest)
        } else {
            let meta = WorldMeta {
                state_schema_version: STATE_SCHEMA_VERSION,
                record_schema_version: RECORD_SCHEMA_VERSION,
                snapshot_count: 0,
                summary_count: 0,
                state_saves: 0,
            };
            let manifest = IntegrityManifest::default();
            serde_json::to_writer_pretty(std::fs::File::create(&meta_path)?, &meta)?;
            serde_json::to_writer_pretty(std::fs::File::create(&manifest_path)?, &manifest)?;
            (meta, manifest)
        };

        debug!(root = %root.display(), snapshots = meta.snapshot_count, "file repository opened");
        Ok(Self {
            root,
            catalog: Mutex::new(Catalog { meta, manifest }),
        })
    }

    /// Get the path to the store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get a copy of the metadata.
    pub fn meta(&self) -> WorldMeta {
        self.catalog.lock().meta.clone()
    }

    /// Verify the manifest chain, every chained file, and the state file.
    pub fn verify_integrity(&self) -> Result<(), StoreError> {
        let catalog = self.catalog.lock();
        let mut prev_hash: Option<String> = None;
        for entry in &catalog.manifest.entries {
            if entry.prev_hash != prev_hash {
                return Err(StoreError::IntegrityMismatch {
                    file: entry.filename.clone(),
                    expected: prev_hash.unwrap_or_else(|| "None".into()),
                    actual: entry.prev_hash.clone().unwrap_or_else(|| "None".into()),
                });
            }
            let data = std::fs::read(self.root.join(&entry.filename))?;
            check_hash(&entry.filename, &entry.sha256, &data)?;
            prev_hash = Some(entry.sha256.clone());
        }

        if let Some(expected) = &catalog.manifest.state_sha256 {
            let data = std::fs::read(self.root.join(STATE_FILE))?;
            check_hash(STATE_FILE, expected, &data)?;
        }
        Ok(())
    }

    fn write_state(&self, catalog: &mut Catalog, state: &WorldState) -> Result<(), StoreError> {
        let compressed = zstd_compress(&cbor_serialize(state)?)?;
        let path = self.root.join(STATE_FILE);
        let tmp = path.with_extension("zst.tmp");
        std::fs::write(&tmp, &compressed)?;
        std::fs::rename(&tmp, &path)?;

        catalog.manifest.state_sha256 = Some(sha256_hex(&compressed));
        catalog.meta.state_saves += 1;
        self.save_catalog(catalog)
    }

    fn read_state(&self, catalog: &Catalog) -> Result<Option<WorldState>, StoreError> {
        let path = self.root.join(STATE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let compressed = std::fs::read(&path)?;
        if let Some(expected) = &catalog.manifest.state_sha256 {
            check_hash(STATE_FILE, expected, &compressed)?;
        }
        Ok(Some(cbor_deserialize(&zstd_decompress(&compressed)?)?))
    }

    /// Write an append-only record and chain it in the manifest. Existing
    /// files are left alone.
    fn append_record<T: Serialize>(
        &self,
        catalog: &mut Catalog,
        relative: String,
        record: &T,
    ) -> Result<bool, StoreError> {
        let path = self.root.join(&relative);
        if path.exists() {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let compressed = zstd_compress(&cbor_serialize(record)?)?;
        let hash = sha256_hex(&compressed);
        let prev_hash = catalog.manifest.entries.last().map(|e| e.sha256.clone());

        std::fs::write(&path, &compressed)?;

        catalog.manifest.entries.push(ManifestEntry {
            filename: relative,
            sha256: hash,
            prev_hash,
        });
        Ok(true)
    }

    /// Decode every record under `dir`, checking each against the manifest.
    fn read_records<T: for<'de> Deserialize<'de>>(
        &self,
        catalog: &Catalog,
        dir: &str,
    ) -> Result<Vec<T>, StoreError> {
        let full = self.root.join(dir);
        if !full.is_dir() {
            return Ok(Vec::new());
        }
        let mut names: Vec<String> = std::fs::read_dir(&full)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.ends_with(".cbor.zst"))
            .collect();
        names.sort();

        let mut records = Vec::with_capacity(names.len());
        for name in names {
            let relative = format!("{dir}/{name}");
            let compressed = std::fs::read(self.root.join(&relative))?;
            if let Some(expected) = catalog.manifest.hash_of(&relative) {
                check_hash(&relative, expected, &compressed)?;
            }
            records.push(cbor_deserialize(&zstd_decompress(&compressed)?)?);
        }
        Ok(records)
    }

    fn save_catalog(&self, catalog: &Catalog) -> Result<(), StoreError> {
        serde_json::to_writer_pretty(
            std::fs::File::create(self.root.join(META_FILE))?,
            &catalog.meta,
        )?;
        serde_json::to_writer_pretty(
            std::fs::File::create(self.root.join(MANIFEST_FILE))?,
            &catalog.manifest,
        )?;
        Ok(())
    }
}

impl Repository for FileRepository {
    fn save_state(&self, state: &WorldState) -> Result<(), RepositoryError> {
        let mut catalog = self.catalog.lock();
        self.write_state(&mut catalog, state)?;
        Ok(())
    }

    fn load_state(&self) -> Result<Option<WorldState>, RepositoryError> {
        let catalog = self.catalog.lock();
        Ok(self.read_state(&catalog)?)
    }

    fn save_snapshot(&self, snapshot: &RegionalSnapshot) -> Result<(), RepositoryError> {
        let relative = format!(
            "{}/{}_{}.snapshot.cbor.zst",
            snapshot_dir(&snapshot.region_id),
            snapshot.timestamp.format(TIMESTAMP_FORMAT),
            snapshot.snapshot_id
        );
        let mut catalog = self.catalog.lock();
        if self.append_record(&mut catalog, relative, snapshot)? {
            catalog.meta.snapshot_count += 1;
            self.save_catalog(&catalog)?;
        }
        Ok(())
    }

    fn load_snapshots(
        &self,
        region: &RegionId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RegionalSnapshot>, RepositoryError> {
        let catalog = self.catalog.lock();
        let mut found: Vec<RegionalSnapshot> = self
            .read_records::<RegionalSnapshot>(&catalog, &snapshot_dir(region))?
            .into_iter()
            .filter(|s| &s.region_id == region && s.timestamp >= start && s.timestamp <= end)
            .collect();
        found.sort_by_key(|s| (s.timestamp, s.change_seq));
        Ok(found)
    }

    fn snapshot_regions(&self) -> Result<Vec<RegionId>, RepositoryError> {
        let catalog = self.catalog.lock();
        let full = self.root.join("snapshots");
        let mut dirs: Vec<String> = std::fs::read_dir(&full)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        dirs.sort();

        let mut regions = BTreeSet::new();
        for dir in dirs {
            let records =
                self.read_records::<RegionalSnapshot>(&catalog, &format!("snapshots/{dir}"))?;
            regions.extend(records.into_iter().map(|s| s.region_id));
        }
        Ok(regions.into_iter().collect())
    }

    fn save_summary(&self, summary: &HistoricalSummary) -> Result<(), RepositoryError> {
        let relative = format!(
            "summaries/{}/{}_{}_{}.summary.cbor.zst",
            summary.period_type,
            summary.period_start.format(TIMESTAMP_FORMAT),
            summary.period_end.format(TIMESTAMP_FORMAT),
            summary.summary_id
        );
        let mut catalog = self.catalog.lock();
        if self.append_record(&mut catalog, relative, summary)? {
            catalog.meta.summary_count += 1;
            self.save_catalog(&catalog)?;
        }
        Ok(())
    }

    fn load_summaries(
        &self,
        level: SnapshotLevel,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HistoricalSummary>, RepositoryError> {
        let catalog = self.catalog.lock();
        let mut found: Vec<HistoricalSummary> = self
            .read_records::<HistoricalSummary>(&catalog, &format!("summaries/{level}"))?
            .into_iter()
            .filter(|s| s.period_type == level && s.overlaps(start, end))
            .collect();
        found.sort_by_key(|s| s.period_start);
        Ok(found)
    }

    fn delete_changes_before(&self, cutoff: DateTime<Utc>) -> Result<usize, RepositoryError> {
        let mut catalog = self.catalog.lock();
        let Some(mut state) = self.read_state(&catalog)? else {
            return Ok(0);
        };
        let removed = state.prune_changes_before(cutoff);
        self.write_state(&mut catalog, &state)?;
        Ok(removed)
    }
}

/// Directory for a region's snapshots. Names are reduced to a filesystem
/// safe alphabet; the region id inside each record stays authoritative.
fn snapshot_dir(region: &RegionId) -> String {
    let safe: String = region
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("snapshots/{safe}")
}

fn check_hash(file: &str, expected: &str, data: &[u8]) -> Result<(), StoreError> {
    let actual = sha256_hex(data);
    if actual != expected {
        return Err(StoreError::IntegrityMismatch {
            file: file.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

fn cbor_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::CborEncode(e.to_string()))?;
    Ok(buf)
}

fn cbor_deserialize<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, StoreError> {
    ciborium::from_reader(data).map_err(|e| StoreError::CborDecode(e.to_string()))
}

fn zstd_compress(data: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut encoder = zstd::Encoder::new(Vec::new(), 3)?;
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn zstd_decompress(data: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut decoder = zstd::Decoder::new(data)?;
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf)?;
    Ok(buf)
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use worldstate_common::{
        KeyChange, ManualClock, StateCategory, StateValue, SummaryId,
    };
    use worldstate_kernel::{StateStore, StateWrite};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn summary(
        level: SnapshotLevel,
        start: DateTime<Utc>,
        days: i64,
        text: &str,
    ) -> HistoricalSummary {
        let end = start + Duration::days(days);
        HistoricalSummary {
            summary_id: SummaryId::derived(&format!("{level}/r1/{start}/{end}")),
            period_start: start,
            period_end: end,
            period_type: level,
            regions_affected: vec![RegionId::new("r1").unwrap()],
            summary_text: text.to_string(),
            key_changes: vec![KeyChange {
                timestamp: start,
                change_type: worldstate_common::ChangeType::Updated,
                key: "ruler".into(),
                category: StateCategory::Political,
                reason: None,
            }],
            original_change_count: 4,
            compression_ratio: 0.25,
            categories_affected: vec![StateCategory::Political],
            created_at: end,
        }
    }

    fn store_with(repo: Arc<FileRepository>) -> (Arc<ManualClock>, StateStore) {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = StateStore::builder()
            .repository(repo)
            .clock(clock.clone())
            .build();
        (clock, store)
    }

    #[test]
    fn store_open_creates_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = FileRepository::open(tmp.path().join("world_data")).unwrap();
        assert_eq!(repo.meta().snapshot_count, 0);
        for dir in ["state", "snapshots", "summaries", "integrity"] {
            assert!(repo.root().join(dir).is_dir());
        }
        assert!(repo.load_state().unwrap().is_none());
    }

    #[test]
    fn state_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = Arc::new(FileRepository::open(tmp.path().join("world_data")).unwrap());
        let (_, store) = store_with(repo.clone());
        store.set("gold", 100, Some("r1")).unwrap();
        store.set("ratio", 0.5, Some("r1")).unwrap();
        store.set("ruler", "Aldric", None).unwrap();
        assert!(store.save_state());

        let reopened = Arc::new(FileRepository::open(tmp.path().join("world_data")).unwrap());
        let (_, fresh) = store_with(reopened);
        assert!(fresh.load_state());
        assert_eq!(fresh.get("gold", Some("r1")), Some(StateValue::Int(100)));
        assert_eq!(fresh.get("ratio", Some("r1")), Some(StateValue::Float(0.5)));
        assert_eq!(fresh.get("ruler", None), Some(StateValue::from("Aldric")));
        assert_eq!(fresh.change_count(), 3);
    }

    #[test]
    fn snapshots_persist_and_filter() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = Arc::new(FileRepository::open(tmp.path().join("world_data")).unwrap());
        let (clock, store) = store_with(repo.clone());
        store
            .apply(
                StateWrite::new("siege", true)
                    .region("north/keep")
                    .category(StateCategory::Military),
            )
            .unwrap();
        clock.advance(Duration::days(2));
        store
            .snapshot_manager()
            .create_snapshot(Some("north/keep"), true, BTreeMap::new())
            .unwrap();

        let region = RegionId::new("north/keep").unwrap();
        assert_eq!(repo.meta().snapshot_count, 2);
        let all = repo
            .load_snapshots(&region, t0(), t0() + Duration::days(3))
            .unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].timestamp < all[1].timestamp);
        let early = repo
            .load_snapshots(&region, t0(), t0() + Duration::days(1))
            .unwrap();
        assert_eq!(early.len(), 1);
        assert_eq!(early[0].local_state["siege"], StateValue::Bool(true));
    }

    #[test]
    fn snapshot_regions_come_from_records() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = Arc::new(FileRepository::open(tmp.path().join("world_data")).unwrap());
        assert!(repo.snapshot_regions().unwrap().is_empty());

        let (_, store) = store_with(repo.clone());
        let mgr = store.snapshot_manager();
        mgr
            .create_snapshot(Some("north/keep"), false, BTreeMap::new())
            .unwrap();
        mgr
            .create_snapshot(Some("north_keep"), false, BTreeMap::new())
            .unwrap();
        mgr.create_snapshot(None, false, BTreeMap::new()).unwrap();

        // Both names share one directory; the records keep them apart.
        let regions = repo.snapshot_regions().unwrap();
        assert_eq!(regions.len(), 3);
        assert!(regions.contains(&RegionId::new("north/keep").unwrap()));
        assert!(regions.contains(&RegionId::new("north_keep").unwrap()));
        assert!(regions.contains(&RegionId::global()));
    }

    #[test]
    fn summaries_are_first_write_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = FileRepository::open(tmp.path().join("world_data")).unwrap();
        let first = summary(SnapshotLevel::Daily, t0(), 1, "first");
        let mut second = first.clone();
        second.summary_text = "second".into();
        repo.save_summary(&first).unwrap();
        repo.save_summary(&second).unwrap();
        repo
            .save_summary(&summary(SnapshotLevel::Weekly, t0(), 7, "week"))
            .unwrap();

        let daily = repo
            .load_summaries(SnapshotLevel::Daily, t0(), t0() + Duration::days(1))
            .unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].summary_text, "first");
        assert_eq!(repo.meta().summary_count, 2);
        let later = repo
            .load_summaries(
                SnapshotLevel::Daily,
                t0() + Duration::days(5),
                t0() + Duration::days(6),
            )
            .unwrap();
        assert!(later.is_empty());
    }

    #[test]
    fn delete_changes_before_rewrites_state() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = Arc::new(FileRepository::open(tmp.path().join("world_data")).unwrap());
        let (clock, store) = store_with(repo.clone());
        store.set("gold", 1, Some("r1")).unwrap();
        clock.advance(Duration::days(10));
        store.set("gold", 2, Some("r1")).unwrap();
        assert!(store.save_state());

        let cutoff = t0() + Duration::days(5);
        assert_eq!(repo.delete_changes_before(cutoff).unwrap(), 1);
        let state = repo.load_state().unwrap().unwrap();
        assert_eq!(state.change_history().len(), 1);
        assert_eq!(
            state.change_history().pruned_before(),
            Some(t0() + Duration::days(5))
        );
        repo.verify_integrity().unwrap();
    }

    #[test]
    fn integrity_fail_closed_on_corruption() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("world_data");
        let repo = Arc::new(FileRepository::open(&path).unwrap());
        let (_, store) = store_with(repo.clone());
        store.set("gold", 1, Some("r1")).unwrap();
        let snap = store
            .snapshot_manager()
            .create_snapshot(Some("r1"), false, BTreeMap::new())
            .unwrap();
        repo.verify_integrity().unwrap();

        let snap_path = path.join(format!(
            "snapshots/r1/{}_{}.snapshot.cbor.zst",
            snap.timestamp.format(TIMESTAMP_FORMAT),
            snap.snapshot_id
        ));
        let mut data = std::fs::read(&snap_path).unwrap();
        if let Some(byte) = data.last_mut() {
            *byte ^= 0xff;
        }
        std::fs::write(&snap_path, &data).unwrap();

        let reopened = FileRepository::open(&path).unwrap();
        assert!(matches!(
            reopened.verify_integrity(),
            Err(StoreError::IntegrityMismatch { .. })
        ));
        let region = RegionId::new("r1").unwrap();
        assert!(matches!(
            reopened.load_snapshots(&region, t0(), t0()),
            Err(RepositoryError::Integrity(_))
        ));
    }

    #[test]
    fn corrupted_state_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("world_data");
        let repo = Arc::new(FileRepository::open(&path).unwrap());
        let (_, store) = store_with(repo.clone());
        store.set("gold", 1, None).unwrap();
        assert!(store.save_state());

        let state_path = path.join(STATE_FILE);
        let mut data = std::fs::read(&state_path).unwrap();
        data[0] ^= 0xff;
        std::fs::write(&state_path, &data).unwrap();

        assert!(repo.verify_integrity().is_err());
        assert!(!store.load_state());
    }

    #[test]
    fn manifest_chain_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("world_data");
        {
            let repo = FileRepository::open(&path).unwrap();
            repo
                .save_summary(&summary(SnapshotLevel::Daily, t0(), 1, "a"))
                .unwrap();
        }
        let repo = FileRepository::open(&path).unwrap();
        repo.save_summary(&summary(SnapshotLevel::Daily, t0() + Duration::days(1), 1, "b"))
            .unwrap();
        assert_eq!(repo.meta().summary_count, 2);
        repo.verify_integrity().unwrap();
    }

    #[test]
    fn schema_mismatch_fail_closed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("world_data");

        let _repo = FileRepository::open(&path).unwrap();

        let meta_path = path.join(META_FILE);
        let mut meta: WorldMeta =
            serde_json::from_reader(std::fs::File::open(&meta_path).unwrap()).unwrap();
        meta.state_schema_version = 999;
        serde_json::to_writer_pretty(std::fs::File::create(&meta_path).unwrap(), &meta).unwrap();

        match FileRepository::open(&path) {
            Err(StoreError::SchemaMismatch {
                file_version,
                expected_version,
            }) => {
                assert_eq!(file_version, 999);
                assert_eq!(expected_version, STATE_SCHEMA_VERSION);
            }
            Err(e) => panic!("expected SchemaMismatch, got: {e}"),
            Ok(_) => panic!("expected error, got Ok"),
        }
    }
}
