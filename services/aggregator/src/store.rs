//! Aggregate store
//!
//! Rows live in a concurrent map of independently lockable cells. Applying
//! a batch takes each key's lock once and folds that key's deltas in
//! ascending token order; writers of different keys never contend.
//!
//! Partition workers commit through `commit_partition`, which also records
//! the partition's recent-state cache as of the batch. A restarted worker
//! reads it back with `recent_state` so UPDATEs of transactions committed
//! before the restart still find their prior contribution.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use persistence::snapshot::AggregateState;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use types::aggregate::{AggregateDelta, AggregateKey, AggregateRow, RecentEntries};
use types::ids::MerchantId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Safe to retry; re-application is idempotent.
    #[error("transient store error: {0}")]
    Transient(String),

    #[error("fatal store error: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Per-delta result of one `apply_batch` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    /// Deltas newer than their row and folded in
    pub applied: u64,
    /// Deltas at or below their row's token, ignored
    pub skipped: u64,
}

/// Keyed aggregate rows with token-gated, per-key atomic merges.
pub trait AggregateStore: Send + Sync {
    /// Merge a batch of deltas. Each key is merged atomically; there is no
    /// batch-wide atomicity.
    fn apply_batch(&self, deltas: &[AggregateDelta]) -> Result<ApplyOutcome, StoreError>;

    /// Merge one partition's batch and record `recent_state` as that
    /// partition's cache image. On success both are visible together.
    fn commit_partition(
        &self,
        partition: u32,
        deltas: &[AggregateDelta],
        recent_state: &RecentEntries,
    ) -> Result<ApplyOutcome, StoreError>;

    /// Cache image recorded by the last successful `commit_partition`.
    fn recent_state(&self, partition: u32) -> Option<RecentEntries>;

    fn get(&self, key: &AggregateKey) -> Option<AggregateRow>;

    fn rows_for_merchant(&self, merchant_id: &MerchantId) -> Vec<(AggregateKey, AggregateRow)>;

    /// Every row, sorted by key.
    fn export(&self) -> BTreeMap<AggregateKey, AggregateRow>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// SHA-256 over the exported rows.
    fn state_hash(&self) -> Result<String, StoreError> {
        AggregateState::from_rows(self.export())
            .compute_hash()
            .map_err(|e| StoreError::Fatal(e.to_string()))
    }
}

type Cell = Arc<Mutex<AggregateRow>>;

fn lock(cell: &Cell) -> MutexGuard<'_, AggregateRow> {
    // A panic mid-merge cannot leave a row half written: `AggregateRow::apply`
    // only mutates after its gate check and has no fallible steps.
    cell.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct InMemoryAggregateStore {
    rows: DashMap<AggregateKey, Cell>,
    recent: DashMap<u32, RecentEntries>,
}

impl InMemoryAggregateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: BTreeMap<AggregateKey, AggregateRow>) -> Self {
        let store = Self::new();
        for (key, row) in rows {
            store.rows.insert(key, Arc::new(Mutex::new(row)));
        }
        store
    }

    /// Seed a partition's cache image, as restored from disk.
    pub fn set_recent_state(&self, partition: u32, recent_state: RecentEntries) {
        self.recent.insert(partition, recent_state);
    }

    fn cell(&self, key: &AggregateKey) -> Cell {
        if let Some(cell) = self.rows.get(key) {
            return Arc::clone(cell.value());
        }
        let entry = self
            .rows
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(AggregateRow::zero())));
        Arc::clone(entry.value())
    }
}

/// Group deltas by key, each group in ascending token order.
fn group_by_key(deltas: &[AggregateDelta]) -> BTreeMap<&AggregateKey, Vec<&AggregateDelta>> {
    let mut groups: BTreeMap<&AggregateKey, Vec<&AggregateDelta>> = BTreeMap::new();
    for delta in deltas {
        groups.entry(&delta.key).or_default().push(delta);
    }
    for group in groups.values_mut() {
        group.sort_by_key(|delta| delta.sequence_token);
    }
    groups
}

impl AggregateStore for InMemoryAggregateStore {
    fn apply_batch(&self, deltas: &[AggregateDelta]) -> Result<ApplyOutcome, StoreError> {
        let mut outcome = ApplyOutcome::default();
        for (key, group) in group_by_key(deltas) {
            let cell = self.cell(key);
            let mut row = lock(&cell);
            for delta in group {
                if row.apply(delta) {
                    outcome.applied += 1;
                } else {
                    outcome.skipped += 1;
                }
            }
        }
        Ok(outcome)
    }

    fn commit_partition(
        &self,
        partition: u32,
        deltas: &[AggregateDelta],
        recent_state: &RecentEntries,
    ) -> Result<ApplyOutcome, StoreError> {
        let outcome = self.apply_batch(deltas)?;
        self.recent.insert(partition, recent_state.clone());
        Ok(outcome)
    }

    fn recent_state(&self, partition: u32) -> Option<RecentEntries> {
        self.recent.get(&partition).map(|entry| entry.value().clone())
    }

    fn get(&self, key: &AggregateKey) -> Option<AggregateRow> {
        let cell = self.rows.get(key).map(|entry| Arc::clone(entry.value()))?;
        let row = lock(&cell).clone();
        Some(row)
    }

    fn rows_for_merchant(&self, merchant_id: &MerchantId) -> Vec<(AggregateKey, AggregateRow)> {
        let mut rows: Vec<(AggregateKey, AggregateRow)> = self
            .rows
            .iter()
            .filter(|entry| &entry.key().merchant_id == merchant_id)
            .map(|entry| (entry.key().clone(), lock(entry.value()).clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    fn export(&self) -> BTreeMap<AggregateKey, AggregateRow> {
        self.rows
            .iter()
            .map(|entry| (entry.key().clone(), lock(entry.value()).clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.rows.len()
    }
}

impl<S: AggregateStore + ?Sized> AggregateStore for Arc<S> {
    fn apply_batch(&self, deltas: &[AggregateDelta]) -> Result<ApplyOutcome, StoreError> {
        (**self).apply_batch(deltas)
    }

    fn commit_partition(
        &self,
        partition: u32,
        deltas: &[AggregateDelta],
        recent_state: &RecentEntries,
    ) -> Result<ApplyOutcome, StoreError> {
        (**self).commit_partition(partition, deltas, recent_state)
    }

    fn recent_state(&self, partition: u32) -> Option<RecentEntries> {
        (**self).recent_state(partition)
    }

    fn get(&self, key: &AggregateKey) -> Option<AggregateRow> {
        (**self).get(key)
    }

    fn rows_for_merchant(&self, merchant_id: &MerchantId) -> Vec<(AggregateKey, AggregateRow)> {
        (**self).rows_for_merchant(merchant_id)
    }

    fn export(&self) -> BTreeMap<AggregateKey, AggregateRow> {
        (**self).export()
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

/// Test double that fails selected `apply_batch` and `commit_partition`
/// calls before delegating.
///
/// - the first `n` calls fail with a transient error
/// - any call containing a delta for a poisoned merchant fails
pub struct FaultInjectingStore<S> {
    inner: S,
    remaining_failures: AtomicU32,
    poisoned_merchants: Vec<MerchantId>,
    calls: AtomicU64,
    failures: AtomicU64,
}

impl<S: AggregateStore> FaultInjectingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            remaining_failures: AtomicU32::new(0),
            poisoned_merchants: Vec::new(),
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn fail_first(self, n: u32) -> Self {
        self.remaining_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn fail_merchant(mut self, merchant_id: MerchantId) -> Self {
        self.poisoned_merchants.push(merchant_id);
        self
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    fn check(&self, deltas: &[AggregateDelta]) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.should_fail(deltas) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Transient("injected fault".to_string()));
        }
        Ok(())
    }

    fn should_fail(&self, deltas: &[AggregateDelta]) -> bool {
        let scheduled = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        scheduled
            || deltas
                .iter()
                .any(|delta| self.poisoned_merchants.contains(&delta.key.merchant_id))
    }
}

impl<S: AggregateStore> AggregateStore for FaultInjectingStore<S> {
    fn apply_batch(&self, deltas: &[AggregateDelta]) -> Result<ApplyOutcome, StoreError> {
        self.check(deltas)?;
        self.inner.apply_batch(deltas)
    }

    fn commit_partition(
        &self,
        partition: u32,
        deltas: &[AggregateDelta],
        recent_state: &RecentEntries,
    ) -> Result<ApplyOutcome, StoreError> {
        self.check(deltas)?;
        self.inner.commit_partition(partition, deltas, recent_state)
    }

    fn recent_state(&self, partition: u32) -> Option<RecentEntries> {
        self.inner.recent_state(partition)
    }

    fn get(&self, key: &AggregateKey) -> Option<AggregateRow> {
        self.inner.get(key)
    }

    fn rows_for_merchant(&self, merchant_id: &MerchantId) -> Vec<(AggregateKey, AggregateRow)> {
        self.inner.rows_for_merchant(merchant_id)
    }

    fn export(&self) -> BTreeMap<AggregateKey, AggregateRow> {
        self.inner.export()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}
