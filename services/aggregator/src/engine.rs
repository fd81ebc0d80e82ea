//! Aggregation engine
//!
//! One consumption loop validates raw events and routes them by merchant
//! to a fixed set of partition workers, each running as its own task and
//! fed through a bounded channel. Workers share only the aggregate store,
//! the checkpoint store and the processing log.
//!
//! At graceful shutdown every worker receives the highest token routed in
//! the run. A worker that is still running has committed everything it was
//! sent, so its checkpoint moves up to that token even if it saw none of
//! the events. Partitions without traffic therefore stop pinning the resume
//! token at the start of the feed.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::event::{RawChangeEvent, SequenceToken};
use types::ids::MerchantId;

use crate::checkpoint::{CheckpointManager, CheckpointStore};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::metrics::EngineMetrics;
use crate::partition::{PartitionInput, PartitionReport, PartitionStatus, PartitionWorker};
use crate::processing_log::ProcessingLog;
use crate::source::ChangeSource;
use crate::store::AggregateStore;
use crate::validation::{EventValidator, Rejection, ValidatorConfig};

/// Partition owning a merchant.
pub fn partition_for(merchant_id: &MerchantId, partition_count: u32) -> u32 {
    (merchant_id.stable_hash() % u64::from(partition_count.max(1))) as u32
}

/// Outcome of a run, after every worker has stopped.
#[derive(Debug, Clone, Serialize)]
pub struct EngineReport {
    pub partitions: Vec<PartitionReport>,
    pub rejected_by_code: BTreeMap<String, u64>,
    pub metrics: BTreeMap<String, u64>,
}

impl EngineReport {
    pub fn halted_partitions(&self) -> Vec<u32> {
        self.partitions
            .iter()
            .filter(|p| matches!(p.status, PartitionStatus::Halted { .. }))
            .map(|p| p.partition)
            .collect()
    }

    pub fn partition(&self, partition: u32) -> Option<&PartitionReport> {
        self.partitions.iter().find(|p| p.partition == partition)
    }
}

pub struct AggregationEngine {
    config: EngineConfig,
    store: Arc<dyn AggregateStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    log: Arc<dyn ProcessingLog>,
    metrics: Arc<EngineMetrics>,
}

impl AggregationEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn AggregateStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        log: Arc<dyn ProcessingLog>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            checkpoints,
            log,
            metrics: Arc::new(EngineMetrics::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn partition_for(&self, merchant_id: &MerchantId) -> u32 {
        partition_for(merchant_id, self.config.key_partition_count)
    }

    /// Earliest token the source must resume after so that every partition
    /// sees everything past its own checkpoint. `None` when any partition
    /// has no checkpoint yet.
    pub fn resume_token(&self) -> Result<Option<SequenceToken>, EngineError> {
        let mut resume: Option<SequenceToken> = None;
        for partition in 0..self.config.key_partition_count {
            match self.checkpoints.load(partition)? {
                Some(record) => {
                    resume = Some(resume.map_or(record.sequence_token, |t| t.min(record.sequence_token)));
                }
                None => return Ok(None),
            }
        }
        Ok(resume)
    }

    /// Spawn one worker per partition. Must be called within a tokio
    /// runtime.
    pub fn start(&self) -> Result<EngineHandle, EngineError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut senders = Vec::new();
        let mut workers = Vec::new();

        for partition in 0..self.config.key_partition_count {
            let checkpoints = CheckpointManager::load(partition, Arc::clone(&self.checkpoints))?;
            let worker = PartitionWorker::new(
                &self.config,
                checkpoints,
                Arc::clone(&self.store),
                Arc::clone(&self.log),
                Arc::clone(&self.metrics),
            );
            let (tx, rx) = mpsc::channel(self.config.partition_channel_capacity.max(1));
            senders.push(tx);
            workers.push(tokio::spawn(worker.run(rx, shutdown_rx.clone())));
        }

        info!(
            partitions = self.config.key_partition_count,
            batch_window_secs = self.config.batch_window_seconds,
            max_batch_size = self.config.max_batch_size,
            "Aggregation engine started"
        );

        Ok(EngineHandle {
            validator: EventValidator::new(ValidatorConfig::from(&self.config)),
            partition_count: self.config.key_partition_count,
            senders,
            workers,
            shutdown_tx,
            metrics: Arc::clone(&self.metrics),
            watermark: None,
        })
    }

    /// Consume `source` to its end, resuming after the stored checkpoints,
    /// then shut down gracefully.
    pub async fn run(&self, source: &mut dyn ChangeSource) -> Result<EngineReport, EngineError> {
        let resume = self.resume_token()?;
        info!(resume_after = ?resume, "Resuming source");
        source.resume_from(resume)?;

        let mut handle = self.start()?;
        while let Some(item) = source.next_event() {
            match item {
                Ok(raw) => handle.submit(raw).await?,
                Err(e) => {
                    EngineMetrics::incr(&self.metrics.source_errors);
                    warn!(error = %e, "Skipping undecodable source event");
                }
            }
        }
        handle.shutdown().await
    }
}

/// Input side of a running engine.
pub struct EngineHandle {
    validator: EventValidator,
    partition_count: u32,
    senders: Vec<mpsc::Sender<PartitionInput>>,
    workers: Vec<JoinHandle<PartitionReport>>,
    shutdown_tx: watch::Sender<bool>,
    metrics: Arc<EngineMetrics>,
    // Highest token routed so far
    watermark: Option<SequenceToken>,
}

impl EngineHandle {
    pub async fn submit(&mut self, raw: RawChangeEvent) -> Result<(), EngineError> {
        self.submit_at(raw, Utc::now()).await
    }

    /// Validate `raw` against the wall clock reading `now` and route it.
    pub async fn submit_at(&mut self, raw: RawChangeEvent, now: DateTime<Utc>) -> Result<(), EngineError> {
        EngineMetrics::incr(&self.metrics.events_received);
        let (partition, input) = match self.validator.validate(&raw, now) {
            Ok(event) => {
                EngineMetrics::incr(&self.metrics.events_accepted);
                (
                    partition_for(&event.merchant_id, self.partition_count),
                    PartitionInput::Event(event),
                )
            }
            Err(err) => {
                EngineMetrics::incr(&self.metrics.events_rejected);
                let rejection = Rejection::new(&raw, &err);
                let partition = raw
                    .merchant_id
                    .clone()
                    .and_then(MerchantId::try_new)
                    .map_or(0, |m| partition_for(&m, self.partition_count));
                debug!(
                    partition,
                    code = %rejection.code,
                    transaction_id = ?rejection.transaction_id,
                    reason = %rejection.reason,
                    "Event rejected"
                );
                (partition, PartitionInput::Rejected(rejection))
            }
        };
        let token = match &input {
            PartitionInput::Event(event) => Some(event.sequence_token),
            PartitionInput::Rejected(rejection) => rejection.sequence_token,
            PartitionInput::Watermark(token) => Some(*token),
        };

        let sender = self
            .senders
            .get(partition as usize)
            .ok_or(EngineError::PartitionClosed(partition))?;
        sender
            .send(input)
            .await
            .map_err(|_| EngineError::PartitionClosed(partition))?;
        if let Some(token) = token {
            self.watermark = Some(self.watermark.map_or(token, |w| w.max(token)));
        }
        Ok(())
    }

    /// Signal shutdown, let every worker apply its open batch, and collect
    /// their reports.
    pub async fn shutdown(self) -> Result<EngineReport, EngineError> {
        let EngineHandle {
            validator,
            senders,
            workers,
            shutdown_tx,
            metrics,
            watermark,
            ..
        } = self;

        if let Some(token) = watermark {
            debug!(watermark = %token, "Sending shutdown watermark");
            for sender in &senders {
                // A worker that already stopped has nothing left to commit.
                let _ = sender.send(PartitionInput::Watermark(token)).await;
            }
        }
        let _ = shutdown_tx.send(true);
        drop(senders);

        let mut partitions = Vec::with_capacity(workers.len());
        for worker in workers {
            let report = worker
                .await
                .map_err(|e| EngineError::WorkerFailed(e.to_string()))?;
            partitions.push(report);
        }

        let rejected_by_code = validator
            .rejected_by_code()
            .iter()
            .map(|(code, n)| (code.to_string(), *n))
            .collect();
        let report = EngineReport {
            partitions,
            rejected_by_code,
            metrics: metrics.export(),
        };
        info!(
            halted = ?report.halted_partitions(),
            committed = EngineMetrics::get(&metrics.batches_committed),
            "Aggregation engine stopped"
        );
        Ok(report)
    }
}
