//! Processing log
//!
//! Append-only record of batch outcomes for monitoring. The engine never
//! reads it back. A failed append is retried a bounded number of times and
//! then reported; it never rolls back a committed batch.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use persistence::journal::{JournalConfig, JournalError, JournalWriter};
use persistence::reader::{JournalReader, ReaderError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use types::event::SequenceToken;
use types::ids::BatchId;
use uuid::Uuid;

use crate::sequencer::{Batch, BatchState, BatchStats};

pub const KIND_BATCH_COMMITTED: &str = "batch_committed";
pub const KIND_BATCH_DEAD: &str = "batch_dead";

#[derive(Debug, Error)]
pub enum ProcessingLogError {
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("journal read error: {0}")]
    Reader(#[from] ReaderError),

    #[error("failed to encode log entry: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("processing log unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of one batch, as reported to monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingLogEntry {
    pub entry_id: Uuid,
    pub partition: u32,
    pub batch_id: BatchId,
    pub status: BatchState,
    pub opened_at: DateTime<Utc>,
    pub sealed_at: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
    pub first_token: Option<SequenceToken>,
    pub max_token: Option<SequenceToken>,
    pub events: usize,
    pub stats: BatchStats,
    pub attempts: u32,
    pub error: Option<String>,
}

impl ProcessingLogEntry {
    pub fn from_batch(batch: &Batch, recorded_at: DateTime<Utc>) -> Self {
        Self {
            entry_id: Uuid::now_v7(),
            partition: batch.partition,
            batch_id: batch.id,
            status: batch.state,
            opened_at: batch.opened_at,
            sealed_at: batch.sealed_at,
            recorded_at,
            first_token: batch.first_token,
            max_token: batch.max_token,
            events: batch.event_count,
            stats: batch.stats.clone(),
            attempts: batch.attempts,
            error: batch.last_error.clone(),
        }
    }

    /// Journal record kind for this entry.
    pub fn kind(&self) -> String {
        match self.status {
            BatchState::COMMITTED => KIND_BATCH_COMMITTED.to_string(),
            BatchState::DEAD => KIND_BATCH_DEAD.to_string(),
            other => format!("batch_{}", format!("{:?}", other).to_ascii_lowercase()),
        }
    }
}

/// Monitoring sink for batch outcomes.
pub trait ProcessingLog: Send + Sync {
    fn append(&self, entry: &ProcessingLogEntry) -> Result<(), ProcessingLogError>;
}

impl<L: ProcessingLog + ?Sized> ProcessingLog for Arc<L> {
    fn append(&self, entry: &ProcessingLogEntry) -> Result<(), ProcessingLogError> {
        (**self).append(entry)
    }
}

/// Append `entry`, trying up to `attempts` times.
pub fn record_batch(
    log: &dyn ProcessingLog,
    entry: &ProcessingLogEntry,
    attempts: u32,
) -> Result<(), ProcessingLogError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match log.append(entry) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < attempts => {
                warn!(
                    partition = entry.partition,
                    batch_id = entry.batch_id.value(),
                    attempt,
                    error = %e,
                    "Processing log append failed, retrying"
                );
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[derive(Default)]
pub struct InMemoryProcessingLog {
    entries: Mutex<Vec<ProcessingLogEntry>>,
    fail_next: AtomicU32,
}

impl InMemoryProcessingLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` appends fail.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn entries(&self) -> Vec<ProcessingLogEntry> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn entries_for(&self, partition: u32) -> Vec<ProcessingLogEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.partition == partition)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProcessingLog for InMemoryProcessingLog {
    fn append(&self, entry: &ProcessingLogEntry) -> Result<(), ProcessingLogError> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ProcessingLogError::Unavailable("injected append failure".to_string()));
        }
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        Ok(())
    }
}

/// Processing log persisted as checksummed journal records with JSON
/// payloads.
pub struct JournalProcessingLog {
    writer: Mutex<JournalWriter>,
}

impl JournalProcessingLog {
    pub fn open(config: JournalConfig) -> Result<Self, ProcessingLogError> {
        Ok(Self {
            writer: Mutex::new(JournalWriter::open(config)?),
        })
    }

    /// Decode every intact entry under `dir`. A torn tail is ignored.
    pub fn read_entries(dir: &Path) -> Result<Vec<ProcessingLogEntry>, ProcessingLogError> {
        let mut reader = JournalReader::open(dir)?;
        let (records, _corruption) = reader.recover_records();
        records
            .iter()
            .map(|record| serde_json::from_slice(&record.payload).map_err(ProcessingLogError::from))
            .collect()
    }
}

impl ProcessingLog for JournalProcessingLog {
    fn append(&self, entry: &ProcessingLogEntry) -> Result<(), ProcessingLogError> {
        let payload = serde_json::to_vec(entry)?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_record(entry.recorded_at.timestamp_millis(), entry.kind(), payload)?;
        Ok(())
    }
}
