//! Change event model
//!
//! A change event is one observed mutation of a payment transaction row as
//! exposed by the upstream change feed. UPDATE and DELETE records carry the
//! full row, not a diff, so every accepted event is self-describing.
//!
//! Two shapes exist:
//! - [`RawChangeEvent`]: loosely typed, exactly as decoded from the feed.
//!   Every field is optional so that missing or malformed values survive
//!   decoding and can be rejected with a precise reason.
//! - [`ChangeEvent`]: the normalized, fully typed event produced by the
//!   validation filter.

use crate::ids::{MerchantId, TransactionId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of row mutation carried by a change event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    /// A new transaction row
    INSERT,
    /// A full-row rewrite of an existing transaction
    UPDATE,
    /// Removal of a transaction row
    DELETE,
}

impl Operation {
    /// Parse the operation label used by change feeds.
    ///
    /// Accepts the upper/lower case names and the `update_postimage` label
    /// that table change feeds use for the new image of an update.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "insert" => Some(Operation::INSERT),
            "update" | "update_postimage" => Some(Operation::UPDATE),
            "delete" => Some(Operation::DELETE),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::INSERT => "INSERT",
            Operation::UPDATE => "UPDATE",
            Operation::DELETE => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a payment transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionStatus {
    SUCCESS,
    FAILURE,
}

impl TransactionStatus {
    /// Parse a status label. `success`/`succeeded`/`completed` and
    /// `failure`/`failed`/`declined` are accepted, case-insensitively.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "success" | "succeeded" | "completed" => Some(TransactionStatus::SUCCESS),
            "failure" | "failed" | "declined" => Some(TransactionStatus::FAILURE),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TransactionStatus::SUCCESS)
    }
}

/// Position of a change in the source stream.
///
/// Ordered lexicographically: first by the source commit version, then by
/// the row offset inside that commit. Monotonically increasing per source,
/// which makes it usable both for ordering and for deduplication.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct SequenceToken {
    /// Commit (log) version of the source table
    pub commit_version: u64,
    /// Row position within the commit
    pub offset: u64,
}

impl SequenceToken {
    /// The position before any change.
    pub const ZERO: SequenceToken = SequenceToken {
        commit_version: 0,
        offset: 0,
    };

    pub const fn new(commit_version: u64, offset: u64) -> Self {
        Self {
            commit_version,
            offset,
        }
    }
}

impl fmt::Display for SequenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}:{}", self.commit_version, self.offset)
    }
}

/// A change event exactly as decoded from the feed.
///
/// `transaction_amount` and `event_timestamp` are kept as raw JSON values:
/// amounts may arrive as numbers or decimal strings, timestamps as RFC 3339
/// strings or epoch milliseconds. `commit_timestamp` is the time the source
/// committed the change, when the feed carries it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawChangeEvent {
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default, alias = "_change_type")]
    pub operation: Option<String>,
    #[serde(default)]
    pub sequence_token: Option<SequenceToken>,
    #[serde(default)]
    pub merchant_id: Option<String>,
    #[serde(default)]
    pub merchant_category: Option<String>,
    #[serde(default)]
    pub transaction_amount: Option<serde_json::Value>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub event_timestamp: Option<serde_json::Value>,
    #[serde(default, alias = "_commit_timestamp")]
    pub commit_timestamp: Option<serde_json::Value>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
}

/// A validated, normalized change event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub transaction_id: TransactionId,
    pub operation: Operation,
    pub sequence_token: SequenceToken,
    pub merchant_id: MerchantId,
    pub merchant_category: Option<String>,
    /// Full-row amount. Always positive for INSERT and UPDATE.
    pub transaction_amount: Decimal,
    pub status: TransactionStatus,
    pub event_timestamp: DateTime<Utc>,
    // Descriptive fields, carried through but never aggregated
    pub currency: Option<String>,
    pub payment_method: Option<String>,
    pub customer_id: Option<String>,
}

impl ChangeEvent {
    /// Build an event with only the fields that matter for aggregation.
    pub fn new(
        transaction_id: TransactionId,
        operation: Operation,
        sequence_token: SequenceToken,
        merchant_id: MerchantId,
        transaction_amount: Decimal,
        status: TransactionStatus,
        event_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            transaction_id,
            operation,
            sequence_token,
            merchant_id,
            merchant_category: None,
            transaction_amount,
            status,
            event_timestamp,
            currency: None,
            payment_method: None,
            customer_id: None,
        }
    }
}

impl From<&ChangeEvent> for RawChangeEvent {
    fn from(event: &ChangeEvent) -> Self {
        Self {
            transaction_id: Some(event.transaction_id.as_str().to_string()),
            operation: Some(event.operation.as_str().to_string()),
            sequence_token: Some(event.sequence_token),
            merchant_id: Some(event.merchant_id.as_str().to_string()),
            merchant_category: event.merchant_category.clone(),
            transaction_amount: Some(serde_json::Value::String(
                event.transaction_amount.to_string(),
            )),
            status: Some(
                match event.status {
                    TransactionStatus::SUCCESS => "success",
                    TransactionStatus::FAILURE => "failure",
                }
                .to_string(),
            ),
            event_timestamp: Some(serde_json::Value::String(event.event_timestamp.to_rfc3339())),
            commit_timestamp: None,
            currency: event.currency.clone(),
            payment_method: event.payment_method.clone(),
            customer_id: event.customer_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_operation_parse() {
        assert_eq!(Operation::parse("INSERT"), Some(Operation::INSERT));
        assert_eq!(Operation::parse("update"), Some(Operation::UPDATE));
        assert_eq!(Operation::parse("update_postimage"), Some(Operation::UPDATE));
        assert_eq!(Operation::parse(" Delete "), Some(Operation::DELETE));
        assert_eq!(Operation::parse("upsert"), None);
        assert_eq!(Operation::parse(""), None);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(TransactionStatus::parse("success"), Some(TransactionStatus::SUCCESS));
        assert_eq!(TransactionStatus::parse("DECLINED"), Some(TransactionStatus::FAILURE));
        assert_eq!(TransactionStatus::parse("pending"), None);
    }

    #[test]
    fn test_sequence_token_ordering() {
        let a = SequenceToken::new(1, 9);
        let b = SequenceToken::new(2, 0);
        let c = SequenceToken::new(2, 1);
        assert!(a < b);
        assert!(b < c);
        assert!(SequenceToken::ZERO < a);
        assert_eq!(c.to_string(), "v2:1");
    }

    #[test]
    fn test_raw_event_decodes_partial_rows() {
        let json = r#"{"transaction_id":"t1","_change_type":"insert","transaction_amount":"12.50"}"#;
        let raw: RawChangeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(raw.transaction_id.as_deref(), Some("t1"));
        assert_eq!(raw.operation.as_deref(), Some("insert"));
        assert!(raw.merchant_id.is_none());
        assert!(raw.sequence_token.is_none());
    }

    #[test]
    fn test_raw_from_change_event() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap();
        let event = ChangeEvent::new(
            TransactionId::new("t1"),
            Operation::DELETE,
            SequenceToken::new(3, 4),
            MerchantId::new("m1"),
            Decimal::new(5000, 2),
            TransactionStatus::FAILURE,
            ts,
        );
        let raw = RawChangeEvent::from(&event);
        assert_eq!(raw.operation.as_deref(), Some("DELETE"));
        assert_eq!(raw.status.as_deref(), Some("failure"));
        assert_eq!(raw.sequence_token, Some(SequenceToken::new(3, 4)));
        assert_eq!(
            raw.transaction_amount,
            Some(serde_json::Value::String("50.00".to_string()))
        );
    }
}
