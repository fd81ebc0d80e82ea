//! Validation error taxonomy
//!
//! Every rejection carries a stable snake_case code used as a metric label
//! and in the processing log. Rejections are per event and never fatal.

use thiserror::Error;

/// Reason a raw change event was rejected by the validation filter
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("missing transaction_id")]
    MissingTransactionId,

    #[error("missing operation")]
    MissingOperation,

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("missing sequence_token")]
    MissingSequenceToken,

    #[error("missing merchant_id")]
    MissingMerchantId,

    #[error("missing transaction_amount")]
    MissingAmount,

    #[error("non-numeric transaction_amount: {0}")]
    NonNumericAmount(String),

    #[error("non-positive transaction_amount on {operation}: {amount}")]
    NonPositiveAmount { operation: String, amount: String },

    #[error("missing status")]
    MissingStatus,

    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("missing event_timestamp")]
    MissingTimestamp,

    #[error("invalid event_timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("event_timestamp {timestamp} is more than {max_skew_secs}s in the future")]
    TimestampInFuture { timestamp: String, max_skew_secs: i64 },

    #[error("event_timestamp {timestamp} is more than {max_age_secs}s in the past")]
    TimestampTooOld { timestamp: String, max_age_secs: i64 },
}

impl ValidationError {
    /// Stable reason code
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::MissingTransactionId => "missing_transaction_id",
            ValidationError::MissingOperation => "missing_operation",
            ValidationError::InvalidOperation(_) => "invalid_operation",
            ValidationError::MissingSequenceToken => "missing_sequence_token",
            ValidationError::MissingMerchantId => "missing_merchant_id",
            ValidationError::MissingAmount => "missing_amount",
            ValidationError::NonNumericAmount(_) => "non_numeric_amount",
            ValidationError::NonPositiveAmount { .. } => "non_positive_amount",
            ValidationError::MissingStatus => "missing_status",
            ValidationError::InvalidStatus(_) => "invalid_status",
            ValidationError::MissingTimestamp => "missing_timestamp",
            ValidationError::InvalidTimestamp(_) => "invalid_timestamp",
            ValidationError::TimestampInFuture { .. } => "timestamp_in_future",
            ValidationError::TimestampTooOld { .. } => "timestamp_too_old",
        }
    }
}
