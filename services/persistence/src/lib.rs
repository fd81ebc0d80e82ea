//! Persistence for the CDC aggregation engine
//!
//! Provides the append-only processing log journal, sequential reading with
//! corruption detection, per-partition checkpoint files, aggregate table
//! snapshots and startup recovery.
//!
//! Every file written here is either append-only with per-record CRC32C
//! framing (journal) or replaced atomically via temp file, fsync and rename
//! (checkpoints, snapshots).

pub mod checkpoint;
pub mod journal;
pub mod layout;
pub mod reader;
pub mod recovery;
pub mod snapshot;
