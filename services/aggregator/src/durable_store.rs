//! Snapshot-backed aggregate store
//!
//! Wraps [`InMemoryAggregateStore`] and persists each key partition on its
//! own: after a partition's batch is merged, that partition's rows and
//! recent-state cache are written as one snapshot under its directory.
//! `commit_partition` returns only once the snapshot is fsynced and renamed
//! into place, so a checkpoint written after it never runs ahead of what is
//! on disk.
//!
//! Every partition has its own lock, held across merge and persist. Batches
//! of different partitions merge and write concurrently; a snapshot only
//! costs the rows of its own partition.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use persistence::recovery::RecoveredState;
use persistence::snapshot::{
    load_latest_per_partition, partition_dir, AggregateState, PartitionImage, Snapshot, SnapshotCleanupPolicy,
    SnapshotError, SnapshotWriter,
};
use tracing::{debug, info, warn};
use types::aggregate::{AggregateDelta, AggregateKey, AggregateRow, RecentEntries};
use types::ids::MerchantId;

use crate::engine::partition_for;
use crate::store::{AggregateStore, ApplyOutcome, InMemoryAggregateStore, StoreError};

/// Keys owned by one partition and its last written generation.
#[derive(Default)]
struct PartitionLedger {
    generation: u64,
    keys: BTreeSet<AggregateKey>,
}

pub struct SnapshotAggregateStore {
    rows: InMemoryAggregateStore,
    root: PathBuf,
    compress: bool,
    cleanup: SnapshotCleanupPolicy,
    partition_count: u32,
    partitions: Vec<Mutex<PartitionLedger>>,
}

impl SnapshotAggregateStore {
    /// Open the store under `root`, restoring the latest snapshot of every
    /// partition.
    pub fn open(
        root: impl Into<PathBuf>,
        compress: bool,
        retention: usize,
        partition_count: u32,
    ) -> Result<Self, SnapshotError> {
        let root = root.into();
        let snapshots = load_latest_per_partition(&root)?;
        check_partition_count(snapshots.values().next().map(|s| s.image.partition_count), partition_count)?;

        let mut rows = BTreeMap::new();
        let mut generations = BTreeMap::new();
        let mut recent = BTreeMap::new();
        for (partition, snapshot) in snapshots {
            generations.insert(partition, snapshot.generation);
            recent.insert(partition, snapshot.image.recent_state);
            rows.extend(snapshot.image.state.rows);
        }
        info!(
            root = %root.display(),
            partitions = generations.len(),
            rows = rows.len(),
            "Aggregate store opened"
        );
        Ok(Self::with_state(
            root,
            compress,
            retention,
            partition_count,
            rows,
            generations,
            recent,
        ))
    }

    /// Build the store from state already loaded by startup recovery.
    pub fn from_recovered(
        root: impl Into<PathBuf>,
        compress: bool,
        retention: usize,
        partition_count: u32,
        recovered: &RecoveredState,
    ) -> Result<Self, SnapshotError> {
        check_partition_count(recovered.partition_count, partition_count)?;
        let generations = recovered
            .partitions
            .iter()
            .map(|(p, state)| (*p, state.generation))
            .collect();
        let recent = recovered
            .partitions
            .iter()
            .map(|(p, state)| (*p, state.recent_state.clone()))
            .collect();
        Ok(Self::with_state(
            root.into(),
            compress,
            retention,
            partition_count,
            recovered.state.rows.clone(),
            generations,
            recent,
        ))
    }

    fn with_state(
        root: PathBuf,
        compress: bool,
        retention: usize,
        partition_count: u32,
        rows: BTreeMap<AggregateKey, AggregateRow>,
        generations: BTreeMap<u32, u64>,
        recent: BTreeMap<u32, RecentEntries>,
    ) -> Self {
        let partition_count = partition_count.max(1);
        let mut ledgers: Vec<PartitionLedger> = (0..partition_count)
            .map(|p| PartitionLedger {
                generation: generations.get(&p).copied().unwrap_or(0),
                keys: BTreeSet::new(),
            })
            .collect();
        for key in rows.keys() {
            let partition = partition_for(&key.merchant_id, partition_count);
            ledgers[partition as usize].keys.insert(key.clone());
        }

        let store = InMemoryAggregateStore::from_rows(rows);
        for (partition, entries) in recent {
            store.set_recent_state(partition, entries);
        }
        Self {
            rows: store,
            root,
            compress,
            cleanup: SnapshotCleanupPolicy::new(retention),
            partition_count,
            partitions: ledgers.into_iter().map(Mutex::new).collect(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// Generation of the newest snapshot of `partition`, written or restored.
    pub fn generation(&self, partition: u32) -> Option<u64> {
        self.partitions
            .get(partition as usize)
            .map(|ledger| lock(ledger).generation)
    }

    fn ledger(&self, partition: u32) -> Result<MutexGuard<'_, PartitionLedger>, StoreError> {
        self.partitions
            .get(partition as usize)
            .map(lock)
            .ok_or_else(|| {
                StoreError::Fatal(format!(
                    "partition {} out of range, store has {}",
                    partition, self.partition_count
                ))
            })
    }

    /// Merge, then persist the partition at the next generation. The
    /// in-memory merge stays in place when persisting fails; a retry skips
    /// the already applied deltas and persists again.
    fn commit(
        &self,
        partition: u32,
        deltas: &[AggregateDelta],
        recent_state: Option<&RecentEntries>,
    ) -> Result<ApplyOutcome, StoreError> {
        let mut ledger = self.ledger(partition)?;

        let outcome = match recent_state {
            Some(recent) => self.rows.commit_partition(partition, deltas, recent)?,
            None => self.rows.apply_batch(deltas)?,
        };
        ledger.keys.extend(deltas.iter().map(|delta| delta.key.clone()));

        let next = ledger.generation + 1;
        let path = self
            .persist(partition, next, &ledger.keys)
            .map_err(|e| StoreError::Transient(format!("snapshot write failed: {}", e)))?;
        ledger.generation = next;
        debug!(partition, generation = next, path = %path.display(), "Partition snapshot written");

        let dir = partition_dir(&self.root, partition);
        match self.cleanup.cleanup(&dir) {
            Ok(removed) if !removed.is_empty() => {
                debug!(partition, removed = removed.len(), "Old partition snapshots removed");
            }
            Ok(_) => {}
            Err(e) => warn!(partition, error = %e, "Snapshot cleanup failed"),
        }
        Ok(outcome)
    }

    fn persist(&self, partition: u32, generation: u64, keys: &BTreeSet<AggregateKey>) -> Result<PathBuf, SnapshotError> {
        let rows = keys
            .iter()
            .filter_map(|key| self.rows.get(key).map(|row| (key.clone(), row)))
            .collect();
        let image = PartitionImage::new(
            partition,
            self.partition_count,
            AggregateState::from_rows(rows),
            self.rows.recent_state(partition).unwrap_or_default(),
        );
        let snapshot = Snapshot::new(generation, Utc::now().timestamp_millis(), image, self.compress)?;
        SnapshotWriter::new(partition_dir(&self.root, partition), self.compress).write(&snapshot)
    }
}

fn lock(ledger: &Mutex<PartitionLedger>) -> MutexGuard<'_, PartitionLedger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

fn check_partition_count(found: Option<u32>, expected: u32) -> Result<(), SnapshotError> {
    match found {
        Some(found) if found != expected => Err(SnapshotError::PartitionCountMismatch { expected, found }),
        _ => Ok(()),
    }
}

impl AggregateStore for SnapshotAggregateStore {
    /// Deltas are routed to their merchant's partition and each partition
    /// is committed on its own.
    fn apply_batch(&self, deltas: &[AggregateDelta]) -> Result<ApplyOutcome, StoreError> {
        let mut by_partition: BTreeMap<u32, Vec<AggregateDelta>> = BTreeMap::new();
        for delta in deltas {
            let partition = partition_for(&delta.key.merchant_id, self.partition_count);
            by_partition.entry(partition).or_default().push(delta.clone());
        }

        let mut total = ApplyOutcome::default();
        for (partition, group) in by_partition {
            let outcome = self.commit(partition, &group, None)?;
            total.applied += outcome.applied;
            total.skipped += outcome.skipped;
        }
        Ok(total)
    }

    fn commit_partition(
        &self,
        partition: u32,
        deltas: &[AggregateDelta],
        recent_state: &RecentEntries,
    ) -> Result<ApplyOutcome, StoreError> {
        self.commit(partition, deltas, Some(recent_state))
    }

    fn recent_state(&self, partition: u32) -> Option<RecentEntries> {
        self.rows.recent_state(partition)
    }

    fn get(&self, key: &AggregateKey) -> Option<AggregateRow> {
        self.rows.get(key)
    }

    fn rows_for_merchant(&self, merchant_id: &MerchantId) -> Vec<(AggregateKey, AggregateRow)> {
        self.rows.rows_for_merchant(merchant_id)
    }

    fn export(&self) -> BTreeMap<AggregateKey, AggregateRow> {
        self.rows.export()
    }

    fn len(&self) -> usize {
        self.rows.len()
    }
}
