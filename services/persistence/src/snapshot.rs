//! Snapshot System: per-partition aggregate snapshots with integrity and
//! compression
//!
//! Each key partition owns a directory under the snapshot root
//! (`p0000/`, `p0001/`, ...). The durable aggregate store writes one
//! snapshot of a partition per committed batch of that partition, before
//! the batch's checkpoint is advanced. A partition's snapshot therefore
//! always contains at least the effects covered by its checkpoint on disk.
//!
//! A snapshot holds the partition's rows and the recent-state cache its
//! resolver had after the batch, so UPDATEs arriving after a restart can
//! still be netted against their prior contribution.
//!
//! Features:
//! - `BTreeMap` state for deterministic serialization and hashing
//! - SHA-256 integrity hash over the serialized partition image
//! - Optional zstd compression
//! - Format versioning
//! - Retention policy (keep last N snapshots per partition)

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use types::aggregate::{AggregateKey, AggregateRow, RecentEntries};

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Integrity check failed: expected {expected}, got {actual}")]
    IntegrityFailure { expected: String, actual: String },

    #[error("Unsupported snapshot version: {0}")]
    UnsupportedVersion(u32),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("No snapshots found")]
    NoSnapshots,

    #[error("Snapshot in directory of partition {dir} belongs to partition {found}")]
    PartitionMismatch { dir: u32, found: u32 },

    #[error("Snapshots were written for {found} partitions, expected {expected}")]
    PartitionCountMismatch { expected: u32, found: u32 },
}

// ── Aggregate State ─────────────────────────────────────────────────

/// Every aggregate row, keyed by (merchant, bucket).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateState {
    pub rows: BTreeMap<AggregateKey, AggregateRow>,
}

impl AggregateState {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: BTreeMap<AggregateKey, AggregateRow>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Deterministic SHA-256 over the bincode encoding of the rows.
    pub fn compute_hash(&self) -> Result<String, SnapshotError> {
        let bytes =
            bincode::serialize(self).map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

// ── Partition Image ─────────────────────────────────────────────────

/// Everything one key partition persists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionImage {
    pub partition: u32,
    /// Partition count the rows were routed with
    pub partition_count: u32,
    pub state: AggregateState,
    /// Recent-state cache entries, oldest first
    pub recent_state: RecentEntries,
}

impl PartitionImage {
    pub fn new(partition: u32, partition_count: u32, state: AggregateState, recent_state: RecentEntries) -> Self {
        Self {
            partition,
            partition_count,
            state,
            recent_state,
        }
    }

    pub fn compute_hash(&self) -> Result<String, SnapshotError> {
        let bytes =
            bincode::serialize(self).map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

// ── Snapshot ────────────────────────────────────────────────────────

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    /// Monotonic per-partition counter; also the file name key.
    pub generation: u64,
    /// Unix milliseconds when the snapshot was taken.
    pub taken_at: i64,
    pub image: PartitionImage,
    /// SHA-256 hash of the serialized image.
    pub checksum: String,
    pub compressed: bool,
}

impl Snapshot {
    pub fn new(
        generation: u64,
        taken_at: i64,
        image: PartitionImage,
        compressed: bool,
    ) -> Result<Self, SnapshotError> {
        let checksum = image.compute_hash()?;
        Ok(Self {
            version: SNAPSHOT_VERSION,
            generation,
            taken_at,
            image,
            checksum,
            compressed,
        })
    }

    pub fn verify_integrity(&self) -> bool {
        matches!(self.image.compute_hash(), Ok(hash) if hash == self.checksum)
    }
}

// ── Snapshot Writer ─────────────────────────────────────────────────

pub struct SnapshotWriter {
    dir: PathBuf,
    compress: bool,
}

impl SnapshotWriter {
    /// Create a new writer. `compress` enables zstd compression.
    pub fn new(dir: impl Into<PathBuf>, compress: bool) -> Self {
        Self {
            dir: dir.into(),
            compress,
        }
    }

    pub fn compress(&self) -> bool {
        self.compress
    }

    /// Write a snapshot atomically: serialize, compress, write tmp, fsync,
    /// rename. A crash leaves either the old set of files or the new one.
    pub fn write(&self, snapshot: &Snapshot) -> Result<PathBuf, SnapshotError> {
        fs::create_dir_all(&self.dir)?;

        let data = bincode::serialize(snapshot)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;

        let (final_data, ext) = if self.compress {
            let compressed = zstd::encode_all(data.as_slice(), 3)
                .map_err(|e| SnapshotError::Compression(e.to_string()))?;
            (compressed, "snap.zst")
        } else {
            (data, "snap")
        };

        let filename = format!("snapshot-{:012}.{}", snapshot.generation, ext);
        let path = self.dir.join(&filename);
        let tmp_path = self.dir.join(format!("{}.tmp", filename));

        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&final_data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;

        Ok(path)
    }
}

// ── Snapshot Loader ─────────────────────────────────────────────────

/// Loads snapshots from disk, verifying integrity.
pub struct SnapshotLoader {
    dir: PathBuf,
}

impl SnapshotLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn load(&self, path: &Path) -> Result<Snapshot, SnapshotError> {
        let data = fs::read(path)?;

        let is_compressed = path.extension().map(|e| e == "zst").unwrap_or(false);
        let decompressed = if is_compressed {
            zstd::decode_all(data.as_slice())
                .map_err(|e| SnapshotError::Compression(e.to_string()))?
        } else {
            data
        };

        let snapshot: Snapshot = bincode::deserialize(&decompressed)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;

        if snapshot.version > SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(snapshot.version));
        }

        let actual = snapshot.image.compute_hash()?;
        if actual != snapshot.checksum {
            return Err(SnapshotError::IntegrityFailure {
                expected: snapshot.checksum.clone(),
                actual,
            });
        }

        Ok(snapshot)
    }

    /// Load the snapshot with the highest generation.
    ///
    /// A damaged latest snapshot is an error, never a silent fallback to an
    /// older one: checkpoints on disk may already cover its effects.
    pub fn load_latest(&self) -> Result<Snapshot, SnapshotError> {
        let path = self.find_latest()?;
        self.load(&path)
    }

    pub fn find_latest(&self) -> Result<PathBuf, SnapshotError> {
        self.list_snapshots()?
            .pop()
            .map(|(_, path)| path)
            .ok_or(SnapshotError::NoSnapshots)
    }

    /// All snapshots as (generation, path), ascending by generation.
    pub fn list_snapshots(&self) -> Result<Vec<(u64, PathBuf)>, SnapshotError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(generation) = parse_generation(&name) {
                results.push((generation, entry.path()));
            }
        }
        results.sort_by_key(|(generation, _)| *generation);
        Ok(results)
    }
}

fn parse_generation(filename: &str) -> Option<u64> {
    let rest = filename.strip_prefix("snapshot-")?;
    let digits = rest
        .strip_suffix(".snap.zst")
        .or_else(|| rest.strip_suffix(".snap"))?;
    digits.parse::<u64>().ok()
}

// ── Partition Directories ───────────────────────────────────────────

/// Snapshot directory of one partition under the snapshot root.
pub fn partition_dir(root: &Path, partition: u32) -> PathBuf {
    root.join(format!("p{:04}", partition))
}

fn parse_partition_dir(name: &str) -> Option<u32> {
    let digits = name.strip_prefix('p')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Load the latest snapshot of every partition directory under `root`.
///
/// Partitions with an empty directory are absent from the result. Every
/// snapshot must sit in its own partition's directory and all of them must
/// agree on the partition count.
pub fn load_latest_per_partition(root: &Path) -> Result<BTreeMap<u32, Snapshot>, SnapshotError> {
    let mut latest = BTreeMap::new();
    if !root.exists() {
        return Ok(latest);
    }

    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(partition) = parse_partition_dir(&name) else {
            continue;
        };
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let snapshot = match SnapshotLoader::new(entry.path()).load_latest() {
            Ok(snapshot) => snapshot,
            Err(SnapshotError::NoSnapshots) => continue,
            Err(e) => return Err(e),
        };
        if snapshot.image.partition != partition {
            return Err(SnapshotError::PartitionMismatch {
                dir: partition,
                found: snapshot.image.partition,
            });
        }
        latest.insert(partition, snapshot);
    }

    let mut counts = latest.values().map(|s| s.image.partition_count);
    if let Some(expected) = counts.next() {
        if let Some(found) = counts.find(|c| *c != expected) {
            return Err(SnapshotError::PartitionCountMismatch { expected, found });
        }
    }
    Ok(latest)
}

// ── Snapshot Cleanup Policy ─────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SnapshotCleanupPolicy {
    /// Maximum number of snapshots to retain.
    pub max_snapshots: usize,
}

impl SnapshotCleanupPolicy {
    pub fn new(max_snapshots: usize) -> Self {
        Self {
            max_snapshots: max_snapshots.max(1),
        }
    }

    /// Remove old snapshots, keeping only the most recent `max_snapshots`.
    pub fn cleanup(&self, dir: &Path) -> Result<Vec<PathBuf>, SnapshotError> {
        let snapshots = SnapshotLoader::new(dir).list_snapshots()?;

        let mut removed = Vec::new();
        if snapshots.len() > self.max_snapshots {
            let to_remove = snapshots.len() - self.max_snapshots;
            for (_, path) in snapshots.iter().take(to_remove) {
                fs::remove_file(path)?;
                removed.push(path.clone());
            }
        }
        Ok(removed)
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use tempfile::TempDir;
    use types::aggregate::{PriorContribution, TimeBucket};
    use types::event::{SequenceToken, TransactionStatus};
    use types::ids::{MerchantId, TransactionId};

    fn key(merchant: &str) -> AggregateKey {
        AggregateKey::new(MerchantId::new(merchant), TimeBucket::from_start_secs(1_709_287_200))
    }

    fn sample_state() -> AggregateState {
        let mut state = AggregateState::empty();
        state.rows.insert(
            key("m1"),
            AggregateRow {
                transaction_count: 2,
                total_amount: Decimal::new(16500, 2),
                success_count: 2,
                failure_count: 0,
                last_updated_sequence_token: Some(SequenceToken::new(3, 0)),
            },
        );
        state.rows.insert(
            key("m2"),
            AggregateRow {
                transaction_count: 1,
                total_amount: Decimal::new(999, 2),
                success_count: 0,
                failure_count: 1,
                last_updated_sequence_token: Some(SequenceToken::new(2, 7)),
            },
        );
        state
    }

    fn sample_image() -> PartitionImage {
        let recent = vec![(
            TransactionId::new("t1"),
            PriorContribution {
                key: key("m1"),
                amount: Decimal::new(9000, 2),
                status: TransactionStatus::SUCCESS,
                sequence_token: SequenceToken::new(3, 0),
            },
        )];
        PartitionImage::new(0, 1, sample_state(), recent)
    }

    fn empty_image(partition: u32, partition_count: u32) -> PartitionImage {
        PartitionImage::new(partition, partition_count, AggregateState::empty(), Vec::new())
    }

    #[test]
    fn test_snapshot_write_and_load_uncompressed() {
        let tmp = TempDir::new().unwrap();
        let snapshot = Snapshot::new(7, 1_709_290_000_000, sample_image(), false).unwrap();

        let writer = SnapshotWriter::new(tmp.path(), false);
        let path = writer.write(&snapshot).unwrap();
        assert!(path.to_string_lossy().ends_with("snapshot-000000000007.snap"));

        let loaded = SnapshotLoader::new(tmp.path()).load(&path).unwrap();
        assert_eq!(loaded.version, SNAPSHOT_VERSION);
        assert_eq!(loaded.generation, 7);
        assert_eq!(loaded.image, sample_image());
        assert_eq!(loaded.image.recent_state.len(), 1);
        assert!(loaded.verify_integrity());
    }

    #[test]
    fn test_snapshot_write_and_load_compressed() {
        let tmp = TempDir::new().unwrap();
        let snapshot = Snapshot::new(1, 0, sample_image(), true).unwrap();

        let path = SnapshotWriter::new(tmp.path(), true).write(&snapshot).unwrap();
        assert!(path.to_string_lossy().ends_with(".snap.zst"));

        let loaded = SnapshotLoader::new(tmp.path()).load_latest().unwrap();
        assert_eq!(loaded.image.state, sample_state());
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(
            sample_state().compute_hash().unwrap(),
            sample_state().compute_hash().unwrap()
        );
        assert_ne!(
            sample_state().compute_hash().unwrap(),
            AggregateState::empty().compute_hash().unwrap()
        );
    }

    #[test]
    fn test_recent_state_is_covered_by_checksum() {
        let mut snapshot = Snapshot::new(1, 0, sample_image(), false).unwrap();
        snapshot.image.recent_state.clear();
        assert!(!snapshot.verify_integrity());
    }

    #[test]
    fn test_tampered_snapshot_fails_integrity() {
        let tmp = TempDir::new().unwrap();
        let mut snapshot = Snapshot::new(1, 0, sample_image(), false).unwrap();
        snapshot.checksum = "0".repeat(64);
        let path = SnapshotWriter::new(tmp.path(), false).write(&snapshot).unwrap();

        match SnapshotLoader::new(tmp.path()).load(&path) {
            Err(SnapshotError::IntegrityFailure { expected, .. }) => {
                assert_eq!(expected, "0".repeat(64));
            }
            other => panic!("Expected integrity failure, got {:?}", other),
        }
    }

    #[test]
    fn test_load_latest_picks_highest_generation() {
        let tmp = TempDir::new().unwrap();
        let writer = SnapshotWriter::new(tmp.path(), false);
        writer.write(&Snapshot::new(3, 0, empty_image(0, 1), false).unwrap()).unwrap();
        writer.write(&Snapshot::new(12, 0, sample_image(), false).unwrap()).unwrap();
        writer.write(&Snapshot::new(9, 0, empty_image(0, 1), false).unwrap()).unwrap();

        let latest = SnapshotLoader::new(tmp.path()).load_latest().unwrap();
        assert_eq!(latest.generation, 12);
        assert_eq!(latest.image.state.len(), 2);
    }

    #[test]
    fn test_no_snapshots() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            SnapshotLoader::new(tmp.path()).load_latest(),
            Err(SnapshotError::NoSnapshots)
        ));
    }

    #[test]
    fn test_load_latest_per_partition() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let p0 = SnapshotWriter::new(partition_dir(root, 0), false);
        p0.write(&Snapshot::new(1, 0, empty_image(0, 3), false).unwrap()).unwrap();
        p0.write(&Snapshot::new(2, 0, empty_image(0, 3), false).unwrap()).unwrap();
        SnapshotWriter::new(partition_dir(root, 2), false)
            .write(&Snapshot::new(5, 0, empty_image(2, 3), false).unwrap())
            .unwrap();
        fs::create_dir_all(partition_dir(root, 1)).unwrap();
        fs::create_dir_all(root.join("scratch")).unwrap();

        let latest = load_latest_per_partition(root).unwrap();
        assert_eq!(latest.keys().copied().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(latest[&0].generation, 2);
        assert_eq!(latest[&2].generation, 5);

        assert!(load_latest_per_partition(&root.join("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_partition_snapshots_must_agree() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        SnapshotWriter::new(partition_dir(root, 0), false)
            .write(&Snapshot::new(1, 0, empty_image(0, 2), false).unwrap())
            .unwrap();
        SnapshotWriter::new(partition_dir(root, 1), false)
            .write(&Snapshot::new(1, 0, empty_image(1, 4), false).unwrap())
            .unwrap();
        assert!(matches!(
            load_latest_per_partition(root),
            Err(SnapshotError::PartitionCountMismatch { expected: 2, found: 4 })
        ));

        let misplaced = TempDir::new().unwrap();
        SnapshotWriter::new(partition_dir(misplaced.path(), 3), false)
            .write(&Snapshot::new(1, 0, empty_image(1, 4), false).unwrap())
            .unwrap();
        assert!(matches!(
            load_latest_per_partition(misplaced.path()),
            Err(SnapshotError::PartitionMismatch { dir: 3, found: 1 })
        ));
    }

    #[test]
    fn test_cleanup_keeps_most_recent() {
        let tmp = TempDir::new().unwrap();
        let writer = SnapshotWriter::new(tmp.path(), false);
        for generation in 1..=5 {
            writer
                .write(&Snapshot::new(generation, 0, empty_image(0, 1), false).unwrap())
                .unwrap();
        }

        let removed = SnapshotCleanupPolicy::new(2).cleanup(tmp.path()).unwrap();
        assert_eq!(removed.len(), 3);

        let remaining: Vec<u64> = SnapshotLoader::new(tmp.path())
            .list_snapshots()
            .unwrap()
            .into_iter()
            .map(|(generation, _)| generation)
            .collect();
        assert_eq!(remaining, vec![4, 5]);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!(parse_generation("snapshot-000000000042.snap"), Some(42));
        assert_eq!(parse_generation("snapshot-000000000042.snap.zst"), Some(42));
        assert_eq!(parse_generation("snapshot-000000000042.snap.tmp"), None);
        assert_eq!(parse_generation("processing-000001.log"), None);
        assert_eq!(parse_partition_dir("p0007"), Some(7));
        assert_eq!(parse_partition_dir("p"), None);
        assert_eq!(parse_partition_dir("p-1"), None);
        assert_eq!(partition_dir(Path::new("/s"), 12), PathBuf::from("/s/p0012"));
    }
}
