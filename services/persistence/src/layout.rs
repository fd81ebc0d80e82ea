//! On-disk layout of an engine state directory
//!
//! ```text
//! <root>/snapshots/     aggregate snapshots, one p<NNNN>/ per partition
//! <root>/checkpoints/   one checkpoint file per partition
//! <root>/log/           processing log journal
//! ```

use std::path::{Path, PathBuf};

use crate::snapshot::partition_dir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshots(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    pub fn partition_snapshots(&self, partition: u32) -> PathBuf {
        partition_dir(&self.snapshots(), partition)
    }

    pub fn checkpoints(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    pub fn processing_log(&self) -> PathBuf {
        self.root.join("log")
    }
}
