//! Checkpoint manager
//!
//! One checkpoint per key partition: the highest sequence token whose
//! effects are durable in the aggregate store. It is advanced only after a
//! batch is applied and never moves backwards.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use persistence::checkpoint::{CheckpointFileError, CheckpointRecord, FileCheckpointStore};
use thiserror::Error;
use tracing::debug;
use types::event::SequenceToken;
use types::ids::BatchId;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint file error: {0}")]
    File(#[from] CheckpointFileError),

    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
}

/// Durable per-partition resume positions.
pub trait CheckpointStore: Send + Sync {
    fn load(&self, partition: u32) -> Result<Option<CheckpointRecord>, CheckpointError>;

    fn store(&self, record: &CheckpointRecord) -> Result<(), CheckpointError>;
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, partition: u32) -> Result<Option<CheckpointRecord>, CheckpointError> {
        Ok(FileCheckpointStore::load(self, partition)?)
    }

    fn store(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        Ok(FileCheckpointStore::store(self, record)?)
    }
}

impl<S: CheckpointStore + ?Sized> CheckpointStore for Arc<S> {
    fn load(&self, partition: u32) -> Result<Option<CheckpointRecord>, CheckpointError> {
        (**self).load(partition)
    }

    fn store(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        (**self).store(record)
    }
}

/// Checkpoints held in memory. Writes can be made to fail.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    records: Mutex<BTreeMap<u32, CheckpointRecord>>,
    fail_writes: AtomicBool,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn get(&self, partition: u32) -> Option<CheckpointRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&partition)
            .cloned()
    }

    pub fn all(&self) -> BTreeMap<u32, CheckpointRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn load(&self, partition: u32) -> Result<Option<CheckpointRecord>, CheckpointError> {
        Ok(self.get(partition))
    }

    fn store(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CheckpointError::Unavailable("injected write failure".to_string()));
        }
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        match records.get(&record.partition) {
            Some(existing) if existing.sequence_token > record.sequence_token => {}
            _ => {
                records.insert(record.partition, record.clone());
            }
        }
        Ok(())
    }
}

/// Tracks and advances the checkpoint of one partition.
pub struct CheckpointManager {
    partition: u32,
    store: Arc<dyn CheckpointStore>,
    current: Option<CheckpointRecord>,
}

impl CheckpointManager {
    pub fn load(partition: u32, store: Arc<dyn CheckpointStore>) -> Result<Self, CheckpointError> {
        let current = store.load(partition)?;
        debug!(
            partition,
            checkpoint = ?current.as_ref().map(|c| c.sequence_token),
            "Checkpoint loaded"
        );
        Ok(Self {
            partition,
            store,
            current,
        })
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn current(&self) -> Option<&CheckpointRecord> {
        self.current.as_ref()
    }

    pub fn current_token(&self) -> Option<SequenceToken> {
        self.current.as_ref().map(|c| c.sequence_token)
    }

    /// Id for the first batch after the checkpointed one.
    pub fn next_batch_id(&self) -> BatchId {
        self.current
            .as_ref()
            .map_or(BatchId::new(1), |c| c.last_batch_id.next())
    }

    /// Whether an event with `token` is already durably applied.
    pub fn covers(&self, token: SequenceToken) -> bool {
        self.current_token().map_or(false, |current| token <= current)
    }

    /// Move the checkpoint to `token`. Returns `Ok(false)` without writing
    /// when `token` is not newer than the current checkpoint.
    pub fn advance(
        &mut self,
        token: SequenceToken,
        batch_id: BatchId,
        now: DateTime<Utc>,
    ) -> Result<bool, CheckpointError> {
        if self.covers(token) {
            return Ok(false);
        }
        let record = CheckpointRecord {
            partition: self.partition,
            sequence_token: token,
            last_batch_id: batch_id,
            updated_at: now.timestamp_millis(),
        };
        self.store.store(&record)?;
        self.current = Some(record);
        Ok(true)
    }
}
