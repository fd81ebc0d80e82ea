//! Partition worker
//!
//! Owns everything that is single-threaded per key partition: the delta
//! resolver with its recent-state cache, the batch sequencer and the
//! partition checkpoint. Batches are applied effect-then-checkpoint:
//!
//! 1. commit the deltas and the cache image to the aggregate store
//!    (retried with backoff)
//! 2. advance the checkpoint to the batch's max token
//! 3. append the outcome to the processing log
//!
//! A new worker starts from the cache image its store last recorded for
//! the partition.
//!
//! A batch that exhausts its retries goes DEAD and the partition halts with
//! its checkpoint pinned, so a restart re-derives the stuck range. Other
//! partitions are unaffected.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use types::event::{ChangeEvent, SequenceToken};
use types::ids::BatchId;

use crate::checkpoint::CheckpointManager;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::metrics::EngineMetrics;
use crate::processing_log::{record_batch, ProcessingLog, ProcessingLogEntry};
use crate::resolver::{DeltaResolver, ResolutionKind};
use crate::retry::RetryPolicy;
use crate::sequencer::{Batch, BatchSequencer, BatchState};
use crate::store::AggregateStore;
use crate::validation::Rejection;

/// Input routed to a partition by the consumption loop.
#[derive(Debug, Clone)]
pub enum PartitionInput {
    Event(ChangeEvent),
    Rejected(Rejection),
    /// Every input up to this token has been routed. Sent once at graceful
    /// shutdown so the checkpoint can advance past tokens of other
    /// partitions.
    Watermark(SequenceToken),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PartitionStatus {
    Running,
    /// No further batches are accepted; input is dropped.
    Halted { reason: String },
}

/// Final state of a partition worker.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionReport {
    pub partition: u32,
    pub status: PartitionStatus,
    pub checkpoint: Option<SequenceToken>,
    pub next_batch_id: BatchId,
    pub batches_committed: u64,
    pub batches_dead: u64,
    pub reconciliation_gaps: u64,
    pub inputs_dropped: u64,
}

/// Window expiry is checked ten times per window, at most every 10ms.
pub fn tick_period(window: Duration) -> Duration {
    (window / 10).max(Duration::from_millis(10))
}

pub struct PartitionWorker {
    partition: u32,
    resolver: DeltaResolver,
    sequencer: BatchSequencer,
    checkpoints: CheckpointManager,
    store: Arc<dyn AggregateStore>,
    log: Arc<dyn ProcessingLog>,
    retry: RetryPolicy,
    log_write_attempts: u32,
    window: Duration,
    metrics: Arc<EngineMetrics>,
    status: PartitionStatus,
    batches_committed: u64,
    batches_dead: u64,
    inputs_dropped: u64,
}

impl PartitionWorker {
    pub fn new(
        config: &EngineConfig,
        checkpoints: CheckpointManager,
        store: Arc<dyn AggregateStore>,
        log: Arc<dyn ProcessingLog>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let partition = checkpoints.partition();
        let sequencer = BatchSequencer::new(
            partition,
            checkpoints.next_batch_id(),
            config.batch_window(),
            config.max_batch_size,
        );
        let mut resolver = DeltaResolver::new(config.bucket_width(), config.recent_state_capacity);
        if let Some(entries) = store.recent_state(partition) {
            resolver.restore(entries);
            info!(
                partition,
                entries = resolver.cache().len(),
                "Recent state restored"
            );
        }
        Self {
            partition,
            resolver,
            sequencer,
            checkpoints,
            store,
            log,
            retry: config.retry_policy(),
            log_write_attempts: config.log_write_attempts,
            window: config.batch_window(),
            metrics,
            status: PartitionStatus::Running,
            batches_committed: 0,
            batches_dead: 0,
            inputs_dropped: 0,
        }
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn status(&self) -> &PartitionStatus {
        &self.status
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.status, PartitionStatus::Halted { .. })
    }

    /// Route one input into the open batch, applying the batch if it fills.
    pub async fn handle(&mut self, input: PartitionInput, now: Instant) -> Result<(), EngineError> {
        if self.is_halted() {
            if !matches!(input, PartitionInput::Watermark(_)) {
                self.inputs_dropped += 1;
                EngineMetrics::incr(&self.metrics.events_dropped_halted);
            }
            return Ok(());
        }

        let sealed = match input {
            PartitionInput::Event(event) => self.push_event(&event, now),
            PartitionInput::Rejected(rejection) => {
                self.sequencer
                    .push_rejection(&rejection.code, rejection.sequence_token, now)
            }
            PartitionInput::Watermark(token) => {
                if !self.checkpoints.covers(token) {
                    self.sequencer.push_watermark(token, now);
                }
                None
            }
        };
        match sealed {
            Some(batch) => self.process_batch(batch).await,
            None => Ok(()),
        }
    }

    fn push_event(&mut self, event: &ChangeEvent, now: Instant) -> Option<Batch> {
        let token = event.sequence_token;
        if self.checkpoints.covers(token) {
            // Already durable; only refresh the cache.
            self.resolver.observe(event);
            EngineMetrics::incr(&self.metrics.events_replayed);
            debug!(
                partition = self.partition,
                transaction_id = %event.transaction_id,
                sequence_token = %token,
                "Event at or below checkpoint, skipped"
            );
            return self.sequencer.push_replayed(token, now);
        }

        let resolution = self.resolver.resolve(event);
        let gap = resolution.kind == ResolutionKind::ReconciliationGap;
        if gap {
            EngineMetrics::incr(&self.metrics.reconciliation_gaps);
        }
        debug!(
            partition = self.partition,
            transaction_id = %event.transaction_id,
            operation = %event.operation,
            sequence_token = %token,
            kind = ?resolution.kind,
            deltas = resolution.deltas.len(),
            "Event resolved"
        );
        self.sequencer
            .push_event(event.operation, token, resolution.deltas, gap, now)
    }

    /// Seal and apply the open batch if its window has elapsed.
    pub async fn tick(&mut self, now: Instant) -> Result<(), EngineError> {
        if self.is_halted() {
            return Ok(());
        }
        match self.sequencer.poll(now) {
            Some(batch) => self.process_batch(batch).await,
            None => Ok(()),
        }
    }

    /// Seal and apply whatever is open, regardless of its window.
    pub async fn flush(&mut self) -> Result<(), EngineError> {
        if self.is_halted() {
            return Ok(());
        }
        match self.sequencer.seal() {
            Some(batch) => self.process_batch(batch).await,
            None => Ok(()),
        }
    }

    async fn process_batch(&mut self, mut batch: Batch) -> Result<(), EngineError> {
        // The resolver is idle until this batch settles.
        let recent_state = self.resolver.cache().entries();
        loop {
            batch.transition(BatchState::APPLYING)?;
            let started = std::time::Instant::now();

            match self
                .store
                .commit_partition(self.partition, &batch.deltas, &recent_state)
            {
                Ok(outcome) => {
                    let apply_us = started.elapsed().as_micros() as u64;
                    batch.stats.deltas_applied = outcome.applied;
                    batch.stats.deltas_skipped = outcome.skipped;
                    return self.commit(batch, apply_us);
                }
                Err(e) => {
                    batch.last_error = Some(e.to_string());
                    batch.transition(BatchState::FAILED)?;
                    let retries_done = batch.attempts.saturating_sub(1);

                    if e.is_transient() && self.retry.has_retries_remaining(retries_done) {
                        let delay = self.retry.delay_for_retry(retries_done + 1);
                        EngineMetrics::incr(&self.metrics.batch_retries);
                        warn!(
                            partition = self.partition,
                            batch_id = batch.id.value(),
                            attempt = batch.attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Batch apply failed, retrying"
                        );
                        time::sleep(delay).await;
                        continue;
                    }

                    batch.transition(BatchState::DEAD)?;
                    self.batches_dead += 1;
                    EngineMetrics::incr(&self.metrics.batches_dead);
                    error!(
                        partition = self.partition,
                        batch_id = batch.id.value(),
                        attempts = batch.attempts,
                        max_token = ?batch.max_token,
                        error = %e,
                        "Batch DEAD, partition halted"
                    );
                    self.report(&batch);
                    self.halt(format!("batch {} dead: {}", batch.id, e));
                    return Ok(());
                }
            }
        }
    }

    fn commit(&mut self, mut batch: Batch, apply_us: u64) -> Result<(), EngineError> {
        if let Some(token) = batch.max_token {
            if let Err(e) = self.checkpoints.advance(token, batch.id, Utc::now()) {
                EngineMetrics::incr(&self.metrics.checkpoint_failures);
                batch.last_error = Some(e.to_string());
                batch.transition(BatchState::FAILED)?;
                error!(
                    partition = self.partition,
                    batch_id = batch.id.value(),
                    sequence_token = %token,
                    error = %e,
                    "Checkpoint write failed, partition halted"
                );
                self.report(&batch);
                self.halt(format!("checkpoint write failed for batch {}: {}", batch.id, e));
                return Ok(());
            }
        }

        batch.transition(BatchState::COMMITTED)?;
        self.batches_committed += 1;
        self.metrics
            .record_commit(batch.stats.deltas_applied, batch.stats.deltas_skipped, apply_us);
        info!(
            partition = self.partition,
            batch_id = batch.id.value(),
            events = batch.event_count,
            applied = batch.stats.deltas_applied,
            skipped = batch.stats.deltas_skipped,
            rejected = batch.stats.rejected,
            reconciliation_gaps = batch.stats.reconciliation_gaps,
            checkpoint = ?self.checkpoints.current_token(),
            "Batch committed"
        );
        self.report(&batch);
        Ok(())
    }

    fn report(&self, batch: &Batch) {
        let entry = ProcessingLogEntry::from_batch(batch, Utc::now());
        if let Err(e) = record_batch(self.log.as_ref(), &entry, self.log_write_attempts) {
            EngineMetrics::incr(&self.metrics.log_failures);
            error!(
                partition = self.partition,
                batch_id = batch.id.value(),
                status = ?batch.state,
                error = %e,
                "Processing log append failed"
            );
        }
    }

    fn halt(&mut self, reason: String) {
        warn!(partition = self.partition, reason = %reason, "Partition halted");
        self.status = PartitionStatus::Halted { reason };
    }

    async fn dispatch(&mut self, input: PartitionInput) {
        if let Err(e) = self.handle(input, Instant::now()).await {
            self.halt(e.to_string());
        }
    }

    /// Consume `rx` until it closes or `shutdown` fires, then apply the
    /// open batch.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<PartitionInput>,
        mut shutdown: watch::Receiver<bool>,
    ) -> PartitionReport {
        let mut ticker = time::interval(tick_period(self.window));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(partition = self.partition, "Partition worker started");

        loop {
            tokio::select! {
                input = rx.recv() => match input {
                    Some(input) => self.dispatch(input).await,
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Instant::now()).await {
                        self.halt(e.to_string());
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        while let Ok(input) = rx.try_recv() {
                            self.dispatch(input).await;
                        }
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.flush().await {
            self.halt(e.to_string());
        }
        info!(
            partition = self.partition,
            committed = self.batches_committed,
            dead = self.batches_dead,
            halted = self.is_halted(),
            "Partition worker stopped"
        );
        self.into_report()
    }

    pub fn into_report(self) -> PartitionReport {
        PartitionReport {
            partition: self.partition,
            checkpoint: self.checkpoints.current_token(),
            next_batch_id: self.sequencer.next_batch_id(),
            batches_committed: self.batches_committed,
            batches_dead: self.batches_dead,
            reconciliation_gaps: self.resolver.reconciliation_gaps(),
            inputs_dropped: self.inputs_dropped,
            status: self.status,
        }
    }
}
