//! Aggregate keys, rows and signed deltas
//!
//! An aggregate row accumulates the signed contributions of every change
//! event mapped to its key. Rows are gated by sequence token: a delta is
//! folded in only if its token is newer than the last one applied, which
//! makes re-application of an already applied delta a no-op.

use crate::event::{SequenceToken, TransactionStatus};
use crate::ids::{MerchantId, TransactionId};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of an aggregation time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketWidth(i64);

impl BucketWidth {
    pub const MINUTE: BucketWidth = BucketWidth(60);
    pub const HOUR: BucketWidth = BucketWidth(3600);
    pub const DAY: BucketWidth = BucketWidth(86_400);

    /// Create a width of the given number of seconds. Returns None for
    /// zero or negative widths.
    pub fn from_secs(secs: i64) -> Option<Self> {
        if secs > 0 {
            Some(Self(secs))
        } else {
            None
        }
    }

    pub fn as_secs(&self) -> i64 {
        self.0
    }

    /// Floor a timestamp to the start of its bucket.
    ///
    /// Uses euclidean division so timestamps before the epoch still floor
    /// downwards.
    pub fn align(&self, timestamp: DateTime<Utc>) -> TimeBucket {
        let secs = timestamp.timestamp();
        TimeBucket(secs.div_euclid(self.0) * self.0)
    }
}

impl Default for BucketWidth {
    fn default() -> Self {
        Self::HOUR
    }
}

/// Start of a time bucket, in Unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeBucket(i64);

impl TimeBucket {
    pub const fn from_start_secs(secs: i64) -> Self {
        Self(secs)
    }

    pub fn start_secs(&self) -> i64 {
        self.0
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.0, 0).single()
    }
}

impl fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.start() {
            Some(start) => write!(f, "{}", start.format("%Y-%m-%dT%H:%M:%SZ")),
            None => write!(f, "{}", self.0),
        }
    }
}

/// Identifies one aggregate row: a merchant within one time bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateKey {
    pub merchant_id: MerchantId,
    pub time_bucket: TimeBucket,
}

impl AggregateKey {
    pub fn new(merchant_id: MerchantId, time_bucket: TimeBucket) -> Self {
        Self {
            merchant_id,
            time_bucket,
        }
    }
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.merchant_id, self.time_bucket)
    }
}

/// Signed contribution of one change event to one aggregate row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateDelta {
    pub key: AggregateKey,
    /// Token of the originating change event
    pub sequence_token: SequenceToken,
    /// Originating transaction, for diagnostics only
    pub transaction_id: TransactionId,
    pub count: i64,
    pub amount: Decimal,
    pub success: i64,
    pub failure: i64,
}

impl AggregateDelta {
    /// A delta that changes nothing but still advances the row token.
    pub fn zero(key: AggregateKey, sequence_token: SequenceToken, transaction_id: TransactionId) -> Self {
        Self {
            key,
            sequence_token,
            transaction_id,
            count: 0,
            amount: Decimal::ZERO,
            success: 0,
            failure: 0,
        }
    }

    /// Contribution of one full row with the given multiplier (+1 or -1).
    ///
    /// Count, amount and the status counter all carry the same sign.
    pub fn contribution(
        key: AggregateKey,
        sequence_token: SequenceToken,
        transaction_id: TransactionId,
        multiplier: i64,
        amount: Decimal,
        status: TransactionStatus,
    ) -> Self {
        let (success, failure) = if status.is_success() {
            (multiplier, 0)
        } else {
            (0, multiplier)
        };
        Self {
            key,
            sequence_token,
            transaction_id,
            count: multiplier,
            amount: amount * Decimal::from(multiplier),
            success,
            failure,
        }
    }

    /// Fold another delta for the same key into this one.
    pub fn absorb(&mut self, other: &AggregateDelta) {
        debug_assert_eq!(self.key, other.key);
        self.count += other.count;
        self.amount += other.amount;
        self.success += other.success;
        self.failure += other.failure;
        if other.sequence_token > self.sequence_token {
            self.sequence_token = other.sequence_token;
        }
    }

    /// Whether applying this delta leaves every metric unchanged.
    pub fn is_noop(&self) -> bool {
        self.count == 0 && self.amount.is_zero() && self.success == 0 && self.failure == 0
    }
}

/// Accumulated metrics for one aggregate key.
///
/// Invariant: every field equals the sum of the signed contributions of all
/// deltas applied so far, and `last_updated_sequence_token` is the token of
/// the newest applied delta.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AggregateRow {
    pub transaction_count: i64,
    pub total_amount: Decimal,
    pub success_count: i64,
    pub failure_count: i64,
    pub last_updated_sequence_token: Option<SequenceToken>,
}

impl AggregateRow {
    /// The zero-valued row used when a key has no contributions yet.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Whether a delta with this token is newer than what has been folded in.
    pub fn accepts(&self, token: SequenceToken) -> bool {
        match self.last_updated_sequence_token {
            Some(last) => token > last,
            None => true,
        }
    }

    /// Apply a delta if its token is newer. Returns whether it was applied.
    pub fn apply(&mut self, delta: &AggregateDelta) -> bool {
        if !self.accepts(delta.sequence_token) {
            return false;
        }
        self.transaction_count += delta.count;
        self.total_amount += delta.amount;
        self.success_count += delta.success;
        self.failure_count += delta.failure;
        self.last_updated_sequence_token = Some(delta.sequence_token);
        true
    }

    /// Fraction of successful transactions, None when the row is empty.
    pub fn success_rate(&self) -> Option<Decimal> {
        let decided = self.success_count + self.failure_count;
        if decided <= 0 {
            return None;
        }
        Some(Decimal::from(self.success_count) / Decimal::from(decided))
    }

    /// Mean transaction amount, None when the row is empty.
    pub fn average_amount(&self) -> Option<Decimal> {
        if self.transaction_count <= 0 {
            return None;
        }
        Some(self.total_amount / Decimal::from(self.transaction_count))
    }
}

/// What a transaction currently contributes to one aggregate row.
///
/// Kept by the recent-state cache so an UPDATE can retract the prior
/// contribution, and persisted with the rows it describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorContribution {
    pub key: AggregateKey,
    pub amount: Decimal,
    pub status: TransactionStatus,
    /// Token of the event that produced this contribution
    pub sequence_token: SequenceToken,
}

/// Contents of one partition's recent-state cache, oldest entry first.
pub type RecentEntries = Vec<(TransactionId, PriorContribution)>;
