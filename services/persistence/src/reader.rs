//! Journal Reader: sequential reader with corruption detection
//!
//! Reads every journal file of one prefix in index order, validating the
//! CRC32C of each record. A torn record at the end of a file (the usual
//! result of a crash mid-write) is logged and skipped, and reading
//! continues with the next file.

use crate::journal::{journal_path, parse_index, JournalError, JournalRecord};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Checksum mismatch at byte offset {offset}: record seq={sequence}")]
    ChecksumMismatch { offset: u64, sequence: u64 },

    #[error("Sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },
}

// ── Corruption Log ──────────────────────────────────────────────────

/// Structured corruption report for diagnostics.
#[derive(Debug, Clone)]
pub struct CorruptionRecord {
    /// File in which the corruption was found
    pub file: PathBuf,
    /// Byte offset within that file
    pub byte_offset: u64,
    pub kind: CorruptionKind,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CorruptionKind {
    ChecksumMismatch,
    TruncatedRecord,
}

// ── Journal Reader ──────────────────────────────────────────────────

pub struct JournalReader {
    /// Journal files, sorted by index
    files: Vec<PathBuf>,
    current_file_idx: usize,
    /// Contents of the current file
    data: Vec<u8>,
    pos: usize,
    last_sequence: Option<u64>,
    corruption_log: Vec<CorruptionRecord>,
}

impl JournalReader {
    /// Open a reader over the default `processing-*.log` files in `dir`.
    pub fn open(dir: &Path) -> Result<Self, ReaderError> {
        Self::open_with_prefix(dir, "processing")
    }

    /// Open a reader over `{prefix}-*.log` files in `dir`. A missing
    /// directory reads as an empty journal.
    pub fn open_with_prefix(dir: &Path, prefix: &str) -> Result<Self, ReaderError> {
        let files = discover_files(dir, prefix)?;
        let mut reader = Self {
            files,
            current_file_idx: 0,
            data: Vec::new(),
            pos: 0,
            last_sequence: None,
            corruption_log: Vec::new(),
        };
        reader.load_current_file()?;
        Ok(reader)
    }

    /// Read the next record, validating its checksum.
    ///
    /// Returns `None` once every file is exhausted.
    pub fn next_record(&mut self) -> Result<Option<JournalRecord>, ReaderError> {
        loop {
            if self.pos >= self.data.len() {
                if !self.advance_file()? {
                    return Ok(None);
                }
                continue;
            }

            let offset_before = self.pos as u64;
            match JournalRecord::from_bytes(&self.data[self.pos..]) {
                Ok((record, consumed)) => {
                    self.pos += consumed;

                    if !record.verify_checksum() {
                        self.corruption_log.push(CorruptionRecord {
                            file: self.current_file(),
                            byte_offset: offset_before,
                            kind: CorruptionKind::ChecksumMismatch,
                            detail: format!(
                                "CRC32C mismatch for seq={}, stored={:#010x}",
                                record.sequence, record.checksum
                            ),
                        });
                        return Err(ReaderError::ChecksumMismatch {
                            offset: offset_before,
                            sequence: record.sequence,
                        });
                    }

                    self.last_sequence = Some(record.sequence);
                    return Ok(Some(record));
                }
                Err(e) => {
                    self.corruption_log.push(CorruptionRecord {
                        file: self.current_file(),
                        byte_offset: offset_before,
                        kind: CorruptionKind::TruncatedRecord,
                        detail: format!(
                            "{} trailing bytes cannot be parsed: {}",
                            self.data.len() - self.pos,
                            e
                        ),
                    });
                    self.pos = self.data.len();
                }
            }
        }
    }

    /// Read all records, stopping at the first checksum failure.
    pub fn read_all(&mut self) -> Result<Vec<JournalRecord>, ReaderError> {
        let mut records = Vec::new();
        while let Some(record) = self.next_record()? {
            records.push(record);
        }
        Ok(records)
    }

    /// Read all records and require gapless sequence numbering.
    pub fn read_all_validated(&mut self) -> Result<Vec<JournalRecord>, ReaderError> {
        let mut records = Vec::new();
        let mut expected: Option<u64> = None;
        while let Some(record) = self.next_record()? {
            if let Some(exp) = expected {
                if record.sequence != exp {
                    return Err(ReaderError::SequenceGap {
                        expected: exp,
                        got: record.sequence,
                    });
                }
            }
            expected = Some(record.sequence + 1);
            records.push(record);
        }
        Ok(records)
    }

    /// Read as many intact records as possible, skipping corrupted ones.
    pub fn recover_records(&mut self) -> (Vec<JournalRecord>, Vec<CorruptionRecord>) {
        let mut records = Vec::new();
        loop {
            match self.next_record() {
                Ok(Some(record)) => records.push(record),
                Ok(None) => break,
                // The bad frame was already consumed; keep going.
                Err(ReaderError::ChecksumMismatch { .. }) => continue,
                Err(_) => break,
            }
        }
        (records, self.corruption_log.clone())
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    pub fn corruption_log(&self) -> &[CorruptionRecord] {
        &self.corruption_log
    }

    // ── Internal Helpers ────────────────────────────────────────────

    fn current_file(&self) -> PathBuf {
        self.files
            .get(self.current_file_idx)
            .cloned()
            .unwrap_or_default()
    }

    fn load_current_file(&mut self) -> Result<(), ReaderError> {
        self.data = match self.files.get(self.current_file_idx) {
            Some(path) => fs::read(path)?,
            None => Vec::new(),
        };
        self.pos = 0;
        Ok(())
    }

    fn advance_file(&mut self) -> Result<bool, ReaderError> {
        if self.current_file_idx + 1 >= self.files.len() {
            return Ok(false);
        }
        self.current_file_idx += 1;
        self.load_current_file()?;
        Ok(true)
    }
}

fn discover_files(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>, ReaderError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut indices: Vec<u64> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| parse_index(&e.file_name().to_string_lossy(), prefix))
        .collect();
    indices.sort_unstable();
    Ok(indices.into_iter().map(|idx| journal_path(dir, prefix, idx)).collect())
}

// ── Tests ───────────────────────────────────────────────────────────
