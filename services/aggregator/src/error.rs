//! Engine-level error type

use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::config::ConfigError;
use crate::sequencer::SequencerError;
use crate::source::SourceError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("batch state error: {0}")]
    Sequencer(#[from] SequencerError),

    #[error("partition {0} is no longer accepting input")]
    PartitionClosed(u32),

    #[error("partition worker failed: {0}")]
    WorkerFailed(String),
}
