//! Batch sequencer
//!
//! Groups the resolved deltas of one key partition into batches. A batch
//! opens on the first observed event and is sealed when it reaches
//! `max_batch_size` observed events or when its window has elapsed,
//! whichever comes first. Windows that saw no events are never sealed.
//!
//! Batch lifecycle:
//! ```text
//! OPEN -> SEALED -> APPLYING -> COMMITTED
//!                       |  ^
//!                       v  |
//!                     FAILED -> DEAD
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;
use types::aggregate::AggregateDelta;
use types::event::{Operation, SequenceToken};
use types::ids::BatchId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BatchState {
    /// Accepting deltas
    OPEN,
    /// Closed, waiting to be applied
    SEALED,
    /// Store application in progress
    APPLYING,
    /// Applied durably and checkpointed
    COMMITTED,
    /// Last attempt failed, waiting for backoff
    FAILED,
    /// Retries exhausted
    DEAD,
}

impl BatchState {
    pub fn can_transition_to(&self, next: BatchState) -> bool {
        use BatchState::*;
        matches!(
            (self, next),
            (OPEN, SEALED)
                | (SEALED, APPLYING)
                | (APPLYING, COMMITTED)
                | (APPLYING, FAILED)
                | (FAILED, APPLYING)
                | (FAILED, DEAD)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchState::COMMITTED | BatchState::DEAD)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequencerError {
    #[error("illegal batch transition for batch {batch_id}: {from:?} -> {to:?}")]
    IllegalTransition {
        batch_id: BatchId,
        from: BatchState,
        to: BatchState,
    },
}

/// Counters carried by a batch into its processing log entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub rejected: u64,
    pub rejections_by_code: BTreeMap<String, u64>,
    pub reconciliation_gaps: u64,
    /// Events skipped because the checkpoint already covers them
    pub replayed_below_checkpoint: u64,
    pub deltas_applied: u64,
    pub deltas_skipped: u64,
}

impl BatchStats {
    fn count_operation(&mut self, operation: Operation) {
        match operation {
            Operation::INSERT => self.inserts += 1,
            Operation::UPDATE => self.updates += 1,
            Operation::DELETE => self.deletes += 1,
        }
    }

    pub fn accepted(&self) -> u64 {
        self.inserts + self.updates + self.deletes
    }
}

#[derive(Debug, Clone)]
pub struct Batch {
    pub id: BatchId,
    pub partition: u32,
    pub state: BatchState,
    pub deltas: Vec<AggregateDelta>,
    pub stats: BatchStats,
    /// Lowest and highest token observed, rejected events included
    pub first_token: Option<SequenceToken>,
    pub max_token: Option<SequenceToken>,
    /// Events observed, regardless of outcome
    pub event_count: usize,
    pub opened_at: DateTime<Utc>,
    pub sealed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_error: Option<String>,
    opened_instant: Instant,
}

impl Batch {
    fn open(id: BatchId, partition: u32, now: Instant) -> Self {
        Self {
            id,
            partition,
            state: BatchState::OPEN,
            deltas: Vec::new(),
            stats: BatchStats::default(),
            first_token: None,
            max_token: None,
            event_count: 0,
            opened_at: Utc::now(),
            sealed_at: None,
            attempts: 0,
            last_error: None,
            opened_instant: now,
        }
    }

    pub fn transition(&mut self, next: BatchState) -> Result<(), SequencerError> {
        if !self.state.can_transition_to(next) {
            return Err(SequencerError::IllegalTransition {
                batch_id: self.id,
                from: self.state,
                to: next,
            });
        }
        if next == BatchState::SEALED {
            self.sealed_at = Some(Utc::now());
        }
        if next == BatchState::APPLYING {
            self.attempts += 1;
        }
        self.state = next;
        Ok(())
    }

    fn observe_token(&mut self, token: Option<SequenceToken>) {
        self.event_count += 1;
        if let Some(token) = token {
            self.first_token = Some(self.first_token.map_or(token, |t| t.min(token)));
            self.max_token = Some(self.max_token.map_or(token, |t| t.max(token)));
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.opened_instant)
    }
}

pub struct BatchSequencer {
    partition: u32,
    next_batch_id: BatchId,
    window: Duration,
    max_batch_size: usize,
    current: Option<Batch>,
}

impl BatchSequencer {
    /// `next_batch_id` is the id the first batch will carry.
    pub fn new(partition: u32, next_batch_id: BatchId, window: Duration, max_batch_size: usize) -> Self {
        Self {
            partition,
            next_batch_id,
            window,
            max_batch_size: max_batch_size.max(1),
            current: None,
        }
    }

    /// Add an accepted event's deltas.
    pub fn push_event(
        &mut self,
        operation: Operation,
        token: SequenceToken,
        deltas: Vec<AggregateDelta>,
        reconciliation_gap: bool,
        now: Instant,
    ) -> Option<Batch> {
        let batch = self.current_or_open(now);
        batch.observe_token(Some(token));
        batch.stats.count_operation(operation);
        if reconciliation_gap {
            batch.stats.reconciliation_gaps += 1;
        }
        batch.deltas.extend(deltas);
        self.seal_if_full()
    }

    /// Count a rejected event. Its token, if any, still moves the batch.
    pub fn push_rejection(&mut self, code: &str, token: Option<SequenceToken>, now: Instant) -> Option<Batch> {
        let batch = self.current_or_open(now);
        batch.observe_token(token);
        batch.stats.rejected += 1;
        *batch.stats.rejections_by_code.entry(code.to_string()).or_insert(0) += 1;
        self.seal_if_full()
    }

    /// Count an event already covered by the checkpoint.
    pub fn push_replayed(&mut self, token: SequenceToken, now: Instant) -> Option<Batch> {
        let batch = self.current_or_open(now);
        batch.observe_token(Some(token));
        batch.stats.replayed_below_checkpoint += 1;
        self.seal_if_full()
    }

    /// Raise the batch's max token without counting an event.
    pub fn push_watermark(&mut self, token: SequenceToken, now: Instant) {
        let batch = self.current_or_open(now);
        batch.max_token = Some(batch.max_token.map_or(token, |t| t.max(token)));
    }

    /// Seal the open batch if its window has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<Batch> {
        let expired = self
            .current
            .as_ref()
            .map_or(false, |batch| batch.age(now) >= self.window);
        if expired {
            self.seal()
        } else {
            None
        }
    }

    /// Seal the open batch unconditionally, if there is one.
    pub fn seal(&mut self) -> Option<Batch> {
        let mut batch = self.current.take()?;
        // OPEN -> SEALED is always legal
        batch.state = BatchState::SEALED;
        batch.sealed_at = Some(Utc::now());
        debug!(
            partition = self.partition,
            batch_id = batch.id.value(),
            events = batch.event_count,
            deltas = batch.deltas.len(),
            "Batch sealed"
        );
        Some(batch)
    }

    pub fn has_open_batch(&self) -> bool {
        self.current.is_some()
    }

    pub fn open_batch(&self) -> Option<&Batch> {
        self.current.as_ref()
    }

    pub fn next_batch_id(&self) -> BatchId {
        self.next_batch_id
    }

    fn current_or_open(&mut self, now: Instant) -> &mut Batch {
        let partition = self.partition;
        let next_batch_id = &mut self.next_batch_id;
        self.current.get_or_insert_with(|| {
            let id = *next_batch_id;
            *next_batch_id = id.next();
            Batch::open(id, partition, now)
        })
    }

    fn seal_if_full(&mut self) -> Option<Batch> {
        let full = self
            .current
            .as_ref()
            .map_or(false, |batch| batch.event_count >= self.max_batch_size);
        if full {
            self.seal()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use types::aggregate::{AggregateKey, TimeBucket};
    use types::event::TransactionStatus;
    use types::ids::{MerchantId, TransactionId};

    fn delta(offset: u64) -> AggregateDelta {
        AggregateDelta::contribution(
            AggregateKey::new(MerchantId::new("m1"), TimeBucket::from_start_secs(0)),
            SequenceToken::new(1, offset),
            TransactionId::new(format!("t{}", offset)),
            1,
            Decimal::from(10),
            TransactionStatus::SUCCESS,
        )
    }

    fn sequencer(window_secs: u64, max: usize) -> BatchSequencer {
        BatchSequencer::new(0, BatchId::new(1), Duration::from_secs(window_secs), max)
    }

    #[test]
    fn test_state_machine_transitions() {
        use BatchState::*;
        assert!(OPEN.can_transition_to(SEALED));
        assert!(SEALED.can_transition_to(APPLYING));
        assert!(APPLYING.can_transition_to(COMMITTED));
        assert!(APPLYING.can_transition_to(FAILED));
        assert!(FAILED.can_transition_to(APPLYING));
        assert!(FAILED.can_transition_to(DEAD));

        assert!(!OPEN.can_transition_to(APPLYING));
        assert!(!SEALED.can_transition_to(COMMITTED));
        assert!(!COMMITTED.can_transition_to(APPLYING));
        assert!(!DEAD.can_transition_to(APPLYING));
        assert!(!APPLYING.can_transition_to(DEAD));
        assert!(COMMITTED.is_terminal() && DEAD.is_terminal());
    }

    #[test]
    fn test_illegal_transition_is_typed_error() {
        let mut seq = sequencer(30, 10);
        let now = Instant::now();
        seq.push_event(Operation::INSERT, SequenceToken::new(1, 1), vec![delta(1)], false, now);
        let mut batch = seq.seal().unwrap();

        match batch.transition(BatchState::COMMITTED) {
            Err(SequencerError::IllegalTransition { from, to, .. }) => {
                assert_eq!(from, BatchState::SEALED);
                assert_eq!(to, BatchState::COMMITTED);
            }
            other => panic!("Expected illegal transition, got {:?}", other),
        }
        batch.transition(BatchState::APPLYING).unwrap();
        assert_eq!(batch.attempts, 1);
        batch.transition(BatchState::FAILED).unwrap();
        batch.transition(BatchState::APPLYING).unwrap();
        assert_eq!(batch.attempts, 2);
        batch.transition(BatchState::COMMITTED).unwrap();
    }

    #[test]
    fn test_size_trigger_seals() {
        let mut seq = sequencer(30, 3);
        let now = Instant::now();
        assert!(seq.push_event(Operation::INSERT, SequenceToken::new(1, 1), vec![delta(1)], false, now).is_none());
        assert!(seq.push_rejection("missing_status", None, now).is_none());
        let batch = seq
            .push_event(Operation::DELETE, SequenceToken::new(1, 3), vec![delta(3)], false, now)
            .expect("third event reaches max_batch_size");

        assert_eq!(batch.state, BatchState::SEALED);
        assert_eq!(batch.id, BatchId::new(1));
        assert_eq!(batch.event_count, 3);
        assert_eq!(batch.deltas.len(), 2);
        assert_eq!(batch.stats.inserts, 1);
        assert_eq!(batch.stats.deletes, 1);
        assert_eq!(batch.stats.rejected, 1);
        assert!(!seq.has_open_batch());
        assert_eq!(seq.next_batch_id(), BatchId::new(2));
    }

    #[test]
    fn test_window_trigger_seals() {
        let mut seq = sequencer(30, 100);
        let start = Instant::now();
        seq.push_event(Operation::INSERT, SequenceToken::new(1, 1), vec![delta(1)], false, start);

        assert!(seq.poll(start + Duration::from_secs(29)).is_none());
        let batch = seq.poll(start + Duration::from_secs(30)).unwrap();
        assert_eq!(batch.event_count, 1);
    }

    #[test]
    fn test_empty_window_not_sealed() {
        let mut seq = sequencer(1, 100);
        let start = Instant::now();
        assert!(seq.poll(start + Duration::from_secs(60)).is_none());
        assert!(seq.seal().is_none());
        assert_eq!(seq.next_batch_id(), BatchId::new(1));
    }

    #[test]
    fn test_batch_ids_are_monotonic() {
        let mut seq = BatchSequencer::new(2, BatchId::new(41), Duration::from_secs(30), 1);
        let now = Instant::now();
        let a = seq.push_replayed(SequenceToken::new(1, 1), now).unwrap();
        let b = seq.push_replayed(SequenceToken::new(1, 2), now).unwrap();
        assert_eq!(a.id, BatchId::new(41));
        assert_eq!(b.id, BatchId::new(42));
        assert_eq!(b.partition, 2);
    }

    #[test]
    fn test_max_token_includes_rejections_and_replays() {
        let mut seq = sequencer(30, 100);
        let now = Instant::now();
        seq.push_replayed(SequenceToken::new(1, 2), now);
        seq.push_event(Operation::INSERT, SequenceToken::new(1, 5), vec![delta(5)], true, now);
        seq.push_rejection("invalid_operation", Some(SequenceToken::new(1, 9)), now);
        seq.push_rejection("missing_sequence_token", None, now);

        let batch = seq.seal().unwrap();
        assert_eq!(batch.first_token, Some(SequenceToken::new(1, 2)));
        assert_eq!(batch.max_token, Some(SequenceToken::new(1, 9)));
        assert_eq!(batch.stats.replayed_below_checkpoint, 1);
        assert_eq!(batch.stats.reconciliation_gaps, 1);
        assert_eq!(batch.stats.rejections_by_code["invalid_operation"], 1);
        assert_eq!(batch.stats.rejections_by_code["missing_sequence_token"], 1);
        assert_eq!(batch.event_count, 4);
    }

    #[test]
    fn test_watermark_moves_max_token_only() {
        let mut seq = sequencer(30, 100);
        let now = Instant::now();
        seq.push_event(Operation::INSERT, SequenceToken::new(1, 5), vec![delta(5)], false, now);
        seq.push_watermark(SequenceToken::new(1, 3), now);
        assert_eq!(seq.open_batch().unwrap().max_token, Some(SequenceToken::new(1, 5)));
        seq.push_watermark(SequenceToken::new(1, 8), now);

        let batch = seq.seal().unwrap();
        assert_eq!(batch.max_token, Some(SequenceToken::new(1, 8)));
        assert_eq!(batch.first_token, Some(SequenceToken::new(1, 5)));
        assert_eq!(batch.event_count, 1);

        // On its own it still opens a batch
        seq.push_watermark(SequenceToken::new(1, 9), now);
        let idle = seq.seal().unwrap();
        assert_eq!(idle.event_count, 0);
        assert!(idle.deltas.is_empty());
        assert_eq!(idle.max_token, Some(SequenceToken::new(1, 9)));
    }
}
