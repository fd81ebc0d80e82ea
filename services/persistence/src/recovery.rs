//! Recovery Flow: rebuild engine state after a restart
//!
//! Recovery process:
//! 1. Load the latest snapshot of every partition (if any)
//! 2. Load every partition checkpoint
//! 3. Scan the processing log for diagnostics and its next sequence
//! 4. Verify that no checkpoint claims effects its partition's snapshot
//!    does not hold
//!
//! Events are then re-consumed from the source starting at each partition's
//! checkpoint. Anything re-delivered that the snapshots already cover is
//! rejected by per-row token gating, so at-least-once re-delivery after
//! recovery never double counts. The recent-state cache of each partition
//! comes back with its rows.

use crate::checkpoint::{CheckpointFileError, CheckpointRecord, FileCheckpointStore};
use crate::layout::StateLayout;
use crate::reader::{JournalReader, ReaderError};
use crate::snapshot::{load_latest_per_partition, AggregateState, SnapshotError};
use std::collections::BTreeMap;
use std::time::Instant;
use thiserror::Error;
use types::aggregate::RecentEntries;
use types::event::SequenceToken;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointFileError),

    #[error("Processing log error: {0}")]
    Reader(#[from] ReaderError),

    #[error("Checkpoint for partition {partition} is at {checkpoint} but the partition has no snapshot")]
    CheckpointWithoutSnapshot {
        partition: u32,
        checkpoint: SequenceToken,
    },
}

// ── Recovery Metrics ────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct RecoveryMetrics {
    pub snapshot_load_time_ms: u64,
    /// Partition snapshots loaded (0 on cold start)
    pub snapshots_loaded: usize,
    pub recent_entries_restored: usize,
    pub rows_restored: usize,
    pub checkpoints_loaded: usize,
    pub log_records_scanned: u64,
    pub log_corruptions: usize,
    pub total_recovery_time_ms: u64,
}

// ── Recovery Log ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RecoveryLogEntry {
    pub stage: RecoveryStage,
    pub message: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryStage {
    Start,
    SnapshotLoad,
    CheckpointLoad,
    LogScan,
    Validation,
    Complete,
}

// ── Recovered State ─────────────────────────────────────────────────

/// What the latest snapshot of one partition restored.
#[derive(Debug, Clone, Default)]
pub struct RecoveredPartition {
    pub generation: u64,
    pub rows: usize,
    pub recent_state: RecentEntries,
}

#[derive(Debug, Clone, Default)]
pub struct RecoveredState {
    /// Rows of every partition snapshot
    pub state: AggregateState,
    pub partitions: BTreeMap<u32, RecoveredPartition>,
    /// Partition count the snapshots were written with
    pub partition_count: Option<u32>,
    pub checkpoints: BTreeMap<u32, CheckpointRecord>,
    /// Processing log record counts, by record kind
    pub log_records_by_kind: BTreeMap<String, u64>,
    /// Sequence the processing log will assign next
    pub next_log_sequence: u64,
}

impl RecoveredState {
    pub fn checkpoint(&self, partition: u32) -> Option<&CheckpointRecord> {
        self.checkpoints.get(&partition)
    }

    pub fn generation(&self, partition: u32) -> Option<u64> {
        self.partitions.get(&partition).map(|p| p.generation)
    }

    pub fn recent_state(&self, partition: u32) -> Option<&RecentEntries> {
        self.partitions.get(&partition).map(|p| &p.recent_state)
    }

    /// Earliest position the source must be replayed from so that every
    /// partition sees everything after its own checkpoint.
    ///
    /// `None` means some partition has no checkpoint and the source must be
    /// replayed from the beginning.
    pub fn resume_token(&self, partition_count: u32) -> Option<SequenceToken> {
        (0..partition_count)
            .map(|p| self.checkpoints.get(&p).map(|c| c.sequence_token))
            .collect::<Option<Vec<_>>>()?
            .into_iter()
            .min()
    }
}

// ── Recovery Engine ─────────────────────────────────────────────────

pub struct RecoveryEngine {
    layout: StateLayout,
    log: Vec<RecoveryLogEntry>,
}

impl RecoveryEngine {
    pub fn new(layout: StateLayout) -> Self {
        Self {
            layout,
            log: Vec::new(),
        }
    }

    pub fn recover(&mut self) -> Result<(RecoveredState, RecoveryMetrics), RecoveryError> {
        let total_start = Instant::now();
        let mut metrics = RecoveryMetrics::default();
        self.log_stage(RecoveryStage::Start, "Recovery started", 0);

        // Snapshots
        let snapshot_start = Instant::now();
        let snapshots = load_latest_per_partition(&self.layout.snapshots())?;
        let partition_count = snapshots.values().next().map(|s| s.image.partition_count);
        let mut state = AggregateState::empty();
        let mut partitions = BTreeMap::new();
        for (partition, snapshot) in snapshots {
            let image = snapshot.image;
            metrics.recent_entries_restored += image.recent_state.len();
            partitions.insert(
                partition,
                RecoveredPartition {
                    generation: snapshot.generation,
                    rows: image.state.len(),
                    recent_state: image.recent_state,
                },
            );
            state.rows.extend(image.state.rows);
        }
        metrics.snapshot_load_time_ms = snapshot_start.elapsed().as_millis() as u64;
        metrics.snapshots_loaded = partitions.len();
        metrics.rows_restored = state.len();
        self.log_stage(
            RecoveryStage::SnapshotLoad,
            &if partitions.is_empty() {
                "No snapshot found, starting empty".to_string()
            } else {
                format!(
                    "Loaded snapshots of {} partitions with {} rows",
                    partitions.len(),
                    state.len()
                )
            },
            metrics.snapshot_load_time_ms,
        );

        // Checkpoints
        let checkpoints = FileCheckpointStore::open(self.layout.checkpoints())?.load_all()?;
        metrics.checkpoints_loaded = checkpoints.len();
        self.log_stage(
            RecoveryStage::CheckpointLoad,
            &format!("Loaded {} partition checkpoints", checkpoints.len()),
            total_start.elapsed().as_millis() as u64,
        );

        // Processing log
        let mut reader = JournalReader::open(&self.layout.processing_log())?;
        let (records, corruption) = reader.recover_records();
        let mut log_records_by_kind = BTreeMap::new();
        for record in &records {
            *log_records_by_kind.entry(record.kind.clone()).or_insert(0u64) += 1;
        }
        let next_log_sequence = records.last().map(|r| r.sequence + 1).unwrap_or(1);
        metrics.log_records_scanned = records.len() as u64;
        metrics.log_corruptions = corruption.len();
        self.log_stage(
            RecoveryStage::LogScan,
            &format!(
                "Scanned {} processing log records ({} corrupt regions)",
                records.len(),
                corruption.len()
            ),
            total_start.elapsed().as_millis() as u64,
        );

        // A checkpoint is only written after its batch's partition
        // snapshot, so a checkpoint without one means state was lost.
        if let Some(record) = checkpoints
            .values()
            .find(|c| c.sequence_token > SequenceToken::ZERO && !partitions.contains_key(&c.partition))
        {
            return Err(RecoveryError::CheckpointWithoutSnapshot {
                partition: record.partition,
                checkpoint: record.sequence_token,
            });
        }
        self.log_stage(RecoveryStage::Validation, "Checkpoints consistent with snapshots", 0);

        metrics.total_recovery_time_ms = total_start.elapsed().as_millis() as u64;
        self.log_stage(
            RecoveryStage::Complete,
            &format!("Recovery complete in {}ms", metrics.total_recovery_time_ms),
            metrics.total_recovery_time_ms,
        );

        Ok((
            RecoveredState {
                state,
                partitions,
                partition_count,
                checkpoints,
                log_records_by_kind,
                next_log_sequence,
            },
            metrics,
        ))
    }

    pub fn recovery_log(&self) -> &[RecoveryLogEntry] {
        &self.log
    }

    fn log_stage(&mut self, stage: RecoveryStage, message: &str, elapsed_ms: u64) {
        self.log.push(RecoveryLogEntry {
            stage,
            message: message.to_string(),
            elapsed_ms,
        });
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{JournalConfig, JournalWriter};
    use crate::snapshot::{PartitionImage, Snapshot, SnapshotWriter};
    use rust_decimal::Decimal;
    use tempfile::TempDir;
    use types::aggregate::{AggregateKey, AggregateRow, PriorContribution, TimeBucket};
    use types::event::TransactionStatus;
    use types::ids::{BatchId, MerchantId, TransactionId};

    fn checkpoint(partition: u32, version: u64) -> CheckpointRecord {
        CheckpointRecord {
            partition,
            sequence_token: SequenceToken::new(version, 0),
            last_batch_id: BatchId::new(1),
            updated_at: 0,
        }
    }

    fn row_state(merchant: &str, count: i64) -> AggregateState {
        let mut state = AggregateState::empty();
        state.rows.insert(
            AggregateKey::new(MerchantId::new(merchant), TimeBucket::from_start_secs(0)),
            AggregateRow {
                transaction_count: count,
                total_amount: Decimal::from(count * 10),
                success_count: count,
                failure_count: 0,
                last_updated_sequence_token: Some(SequenceToken::new(4, 0)),
            },
        );
        state
    }

    fn write_partition(layout: &StateLayout, generation: u64, image: PartitionImage) {
        SnapshotWriter::new(layout.partition_snapshots(image.partition), false)
            .write(&Snapshot::new(generation, 0, image, false).unwrap())
            .unwrap();
    }

    #[test]
    fn test_cold_start() {
        let tmp = TempDir::new().unwrap();
        let mut engine = RecoveryEngine::new(StateLayout::new(tmp.path()));
        let (recovered, metrics) = engine.recover().unwrap();

        assert!(recovered.state.is_empty());
        assert!(recovered.partitions.is_empty());
        assert_eq!(recovered.partition_count, None);
        assert_eq!(recovered.next_log_sequence, 1);
        assert_eq!(recovered.resume_token(4), None);
        assert_eq!(metrics.rows_restored, 0);
        assert_eq!(metrics.snapshots_loaded, 0);
        assert_eq!(engine.recovery_log().last().unwrap().stage, RecoveryStage::Complete);
    }

    #[test]
    fn test_recover_snapshots_checkpoints_and_log() {
        let tmp = TempDir::new().unwrap();
        let layout = StateLayout::new(tmp.path());

        let recent = vec![(
            TransactionId::new("t7"),
            PriorContribution {
                key: AggregateKey::new(MerchantId::new("m1"), TimeBucket::from_start_secs(0)),
                amount: Decimal::from(10),
                status: TransactionStatus::SUCCESS,
                sequence_token: SequenceToken::new(4, 0),
            },
        )];
        write_partition(&layout, 2, PartitionImage::new(0, 2, row_state("m1", 3), recent.clone()));
        write_partition(&layout, 5, PartitionImage::new(1, 2, row_state("m2", 1), Vec::new()));

        let checkpoints = FileCheckpointStore::open(layout.checkpoints()).unwrap();
        checkpoints.store(&checkpoint(0, 4)).unwrap();
        checkpoints.store(&checkpoint(1, 2)).unwrap();

        let mut writer = JournalWriter::open(JournalConfig::new(layout.processing_log())).unwrap();
        writer.write_record(0, "batch_committed", b"{}".to_vec()).unwrap();
        writer.write_record(0, "batch_committed", b"{}".to_vec()).unwrap();
        writer.write_record(0, "batch_dead", b"{}".to_vec()).unwrap();
        writer.sync().unwrap();

        let (recovered, metrics) = RecoveryEngine::new(layout).recover().unwrap();
        let mut merged = row_state("m1", 3);
        merged.rows.extend(row_state("m2", 1).rows);
        assert_eq!(recovered.state, merged);
        assert_eq!(recovered.partition_count, Some(2));
        assert_eq!(recovered.generation(0), Some(2));
        assert_eq!(recovered.generation(1), Some(5));
        assert_eq!(recovered.recent_state(0), Some(&recent));
        assert_eq!(recovered.recent_state(1).map(Vec::len), Some(0));
        assert_eq!(recovered.checkpoints.len(), 2);
        assert_eq!(recovered.log_records_by_kind["batch_committed"], 2);
        assert_eq!(recovered.log_records_by_kind["batch_dead"], 1);
        assert_eq!(recovered.next_log_sequence, 4);
        assert_eq!(metrics.checkpoints_loaded, 2);
        assert_eq!(metrics.snapshots_loaded, 2);
        assert_eq!(metrics.rows_restored, 2);
        assert_eq!(metrics.recent_entries_restored, 1);

        assert_eq!(recovered.resume_token(2), Some(SequenceToken::new(2, 0)));
        // Partition 2 never committed: replay from the start
        assert_eq!(recovered.resume_token(3), None);
    }

    #[test]
    fn test_checkpoint_without_snapshot_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let layout = StateLayout::new(tmp.path());
        FileCheckpointStore::open(layout.checkpoints())
            .unwrap()
            .store(&checkpoint(0, 3))
            .unwrap();

        match RecoveryEngine::new(layout).recover() {
            Err(RecoveryError::CheckpointWithoutSnapshot { partition, checkpoint }) => {
                assert_eq!(partition, 0);
                assert_eq!(checkpoint, SequenceToken::new(3, 0));
            }
            other => panic!("Expected inconsistency error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_checkpoint_needs_its_own_partition_snapshot() {
        let tmp = TempDir::new().unwrap();
        let layout = StateLayout::new(tmp.path());
        write_partition(&layout, 1, PartitionImage::new(0, 2, row_state("m1", 1), Vec::new()));
        let checkpoints = FileCheckpointStore::open(layout.checkpoints()).unwrap();
        checkpoints.store(&checkpoint(0, 3)).unwrap();
        checkpoints.store(&checkpoint(1, 3)).unwrap();

        match RecoveryEngine::new(layout).recover() {
            Err(RecoveryError::CheckpointWithoutSnapshot { partition, .. }) => assert_eq!(partition, 1),
            other => panic!("Expected inconsistency error, got {:?}", other.map(|_| ())),
        }
    }
}
