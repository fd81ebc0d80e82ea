//! Checkpoint Files: one durable resume position per key partition
//!
//! # File Format
//! `checkpoint-p{partition:04}.json` holds a JSON envelope
//! `{"record": {...}, "crc32c": N}` where `crc32c` covers the compact JSON
//! encoding of `record`. Writes go to a temp file that is fsynced and then
//! renamed over the old one, so a reader sees either the previous
//! checkpoint or the new one, never a mix.
//!
//! Checkpoints never move backwards: storing a token older than the one on
//! disk is rejected.

use crc32c::crc32c;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use types::event::SequenceToken;
use types::ids::BatchId;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CheckpointFileError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt checkpoint {path}: {detail}")]
    Corrupt { path: String, detail: String },

    #[error("Checkpoint regression on partition {partition}: stored {stored}, attempted {attempted}")]
    Regression {
        partition: u32,
        stored: SequenceToken,
        attempted: SequenceToken,
    },
}

// ── Checkpoint Record ───────────────────────────────────────────────

/// Durable resume position of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub partition: u32,
    /// Highest token whose effects are durable in the aggregate store
    pub sequence_token: SequenceToken,
    /// Last batch committed under this checkpoint
    pub last_batch_id: BatchId,
    /// Unix milliseconds of the write
    pub updated_at: i64,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    record: CheckpointRecord,
    crc32c: u32,
}

// ── File Checkpoint Store ───────────────────────────────────────────

pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CheckpointFileError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, partition: u32) -> PathBuf {
        self.dir.join(format!("checkpoint-p{:04}.json", partition))
    }

    /// Load one partition's checkpoint. A missing file means the partition
    /// has never committed.
    pub fn load(&self, partition: u32) -> Result<Option<CheckpointRecord>, CheckpointFileError> {
        let path = self.path_for(partition);
        if !path.exists() {
            return Ok(None);
        }
        read_checkpoint(&path).map(Some)
    }

    /// Load every checkpoint in the directory, keyed by partition.
    pub fn load_all(&self) -> Result<BTreeMap<u32, CheckpointRecord>, CheckpointFileError> {
        let mut out = BTreeMap::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if parse_partition(&name).is_some() {
                let record = read_checkpoint(&entry.path())?;
                out.insert(record.partition, record);
            }
        }
        Ok(out)
    }

    /// Durably store a checkpoint.
    pub fn store(&self, record: &CheckpointRecord) -> Result<(), CheckpointFileError> {
        if let Some(existing) = self.load(record.partition)? {
            if record.sequence_token < existing.sequence_token {
                return Err(CheckpointFileError::Regression {
                    partition: record.partition,
                    stored: existing.sequence_token,
                    attempted: record.sequence_token,
                });
            }
        }

        let body = serde_json::to_vec(record)
            .map_err(|e| CheckpointFileError::Serialization(e.to_string()))?;
        let envelope = Envelope {
            record: record.clone(),
            crc32c: crc32c(&body),
        };
        let data = serde_json::to_vec_pretty(&envelope)
            .map_err(|e| CheckpointFileError::Serialization(e.to_string()))?;

        let path = self.path_for(record.partition);
        let tmp_path = path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

fn read_checkpoint(path: &Path) -> Result<CheckpointRecord, CheckpointFileError> {
    let corrupt = |detail: String| CheckpointFileError::Corrupt {
        path: path.display().to_string(),
        detail,
    };

    let data = fs::read(path)?;
    let envelope: Envelope = serde_json::from_slice(&data).map_err(|e| corrupt(e.to_string()))?;
    let body = serde_json::to_vec(&envelope.record)
        .map_err(|e| CheckpointFileError::Serialization(e.to_string()))?;
    let actual = crc32c(&body);
    if actual != envelope.crc32c {
        return Err(corrupt(format!(
            "CRC32C mismatch: stored={:#010x}, computed={:#010x}",
            envelope.crc32c, actual
        )));
    }
    Ok(envelope.record)
}

fn parse_partition(filename: &str) -> Option<u32> {
    filename
        .strip_prefix("checkpoint-p")?
        .strip_suffix(".json")?
        .parse::<u32>()
        .ok()
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(partition: u32, version: u64, offset: u64, batch: u64) -> CheckpointRecord {
        CheckpointRecord {
            partition,
            sequence_token: SequenceToken::new(version, offset),
            last_batch_id: BatchId::new(batch),
            updated_at: 1_709_290_000_000,
        }
    }

    #[test]
    fn test_missing_checkpoint_is_none() {
        let tmp = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(tmp.path()).unwrap();
        assert!(store.load(0).unwrap().is_none());
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_store_and_load() {
        let tmp = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(tmp.path()).unwrap();
        store.store(&record(1, 5, 2, 3)).unwrap();
        store.store(&record(3, 7, 0, 1)).unwrap();

        assert_eq!(store.load(1).unwrap(), Some(record(1, 5, 2, 3)));
        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[&3].sequence_token, SequenceToken::new(7, 0));
    }

    #[test]
    fn test_store_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        FileCheckpointStore::open(tmp.path())
            .unwrap()
            .store(&record(0, 9, 9, 4))
            .unwrap();

        let reopened = FileCheckpointStore::open(tmp.path()).unwrap();
        assert_eq!(reopened.load(0).unwrap(), Some(record(0, 9, 9, 4)));
    }

    #[test]
    fn test_regression_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(tmp.path()).unwrap();
        store.store(&record(0, 5, 0, 2)).unwrap();

        match store.store(&record(0, 4, 9, 3)) {
            Err(CheckpointFileError::Regression { stored, attempted, .. }) => {
                assert_eq!(stored, SequenceToken::new(5, 0));
                assert_eq!(attempted, SequenceToken::new(4, 9));
            }
            other => panic!("Expected regression error, got {:?}", other),
        }
        assert_eq!(store.load(0).unwrap(), Some(record(0, 5, 0, 2)));

        // Same token is not a regression
        store.store(&record(0, 5, 0, 3)).unwrap();
    }

    #[test]
    fn test_tampered_checkpoint_detected() {
        let tmp = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(tmp.path()).unwrap();
        store.store(&record(2, 5, 0, 2)).unwrap();

        let path = store.path_for(2);
        let text = fs::read_to_string(&path).unwrap();
        fs::write(&path, text.replace("\"commit_version\": 5", "\"commit_version\": 6")).unwrap();

        match store.load(2) {
            Err(CheckpointFileError::Corrupt { detail, .. }) => assert!(detail.contains("CRC32C")),
            other => panic!("Expected corruption error, got {:?}", other),
        }
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let tmp = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(tmp.path()).unwrap();
        store.store(&record(0, 1, 0, 1)).unwrap();
        store.store(&record(0, 2, 0, 2)).unwrap();

        let names: Vec<String> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["checkpoint-p0000.json".to_string()]);
    }

    #[test]
    fn test_parse_partition() {
        assert_eq!(parse_partition("checkpoint-p0012.json"), Some(12));
        assert_eq!(parse_partition("checkpoint-p0012.json.tmp"), None);
        assert_eq!(parse_partition("snapshot-000000000001.snap"), None);
    }
}
