//! Identifier types for transactions, merchants and batches
//!
//! Transaction and merchant identifiers are opaque strings owned by the
//! upstream payment system. Batch identifiers are assigned locally and are
//! monotonic per key partition.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of one logical payment transaction.
///
/// Stable across every UPDATE and DELETE of the same transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Try to create a TransactionId, returning None for blank input
    pub fn try_new(id: impl Into<String>) -> Option<Self> {
        let s = id.into();
        if s.trim().is_empty() {
            None
        } else {
            Some(Self(s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TransactionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Merchant identifier
///
/// First component of every aggregate key, and the routing key used to
/// shard work across partitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MerchantId(String);

impl MerchantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Try to create a MerchantId, returning None for blank input
    pub fn try_new(id: impl Into<String>) -> Option<Self> {
        let s = id.into();
        if s.trim().is_empty() {
            None
        } else {
            Some(Self(s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable 64-bit FNV-1a hash of the identifier.
    ///
    /// Used for partition routing. Unlike `DefaultHasher` the value is the
    /// same in every process, so a merchant always lands on the same
    /// partition (and the same partition checkpoint) across restarts.
    pub fn stable_hash(&self) -> u64 {
        const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_PRIME: u64 = 0x0100_0000_01b3;
        self.0.bytes().fold(FNV_OFFSET, |hash, byte| {
            (hash ^ byte as u64).wrapping_mul(FNV_PRIME)
        })
    }
}

impl fmt::Display for MerchantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MerchantId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Batch identifier, monotonically increasing within one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(u64);

impl BatchId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// The id following this one.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
