//! Validation filter
//!
//! Turns a loosely typed [`RawChangeEvent`] into a normalized
//! [`ChangeEvent`] or a [`Rejection`] carrying a stable reason code.
//! Rejection is never fatal: the event is counted and dropped, and its
//! sequence token (when present) still moves the partition's checkpoint.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use types::errors::ValidationError;
use types::event::{ChangeEvent, Operation, RawChangeEvent, SequenceToken, TransactionStatus};
use types::ids::{MerchantId, TransactionId};

use crate::config::EngineConfig;

/// Plausibility window for event timestamps.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Maximum distance into the future of the reference clock
    pub max_event_skew: Duration,
    /// Maximum distance into the past of the reference clock
    pub max_event_age: Option<Duration>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_event_skew: Duration::hours(1),
            max_event_age: None,
        }
    }
}

impl From<&EngineConfig> for ValidatorConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_event_skew: Duration::seconds(config.max_event_skew_seconds),
            max_event_age: config.max_event_age_seconds.map(Duration::seconds),
        }
    }
}

/// A rejected event, as forwarded to the owning partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub transaction_id: Option<String>,
    pub merchant_id: Option<String>,
    pub sequence_token: Option<SequenceToken>,
    pub code: String,
    pub reason: String,
}

impl Rejection {
    pub fn new(raw: &RawChangeEvent, error: &ValidationError) -> Self {
        Self {
            transaction_id: raw.transaction_id.clone(),
            merchant_id: raw.merchant_id.clone(),
            sequence_token: raw.sequence_token,
            code: error.code().to_string(),
            reason: error.to_string(),
        }
    }
}

pub struct EventValidator {
    config: ValidatorConfig,
    events_accepted: u64,
    events_rejected: u64,
    rejected_by_code: BTreeMap<&'static str, u64>,
}

impl EventValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        info!(
            max_event_skew_secs = config.max_event_skew.num_seconds(),
            max_event_age_secs = config.max_event_age.map(|d| d.num_seconds()),
            "EventValidator initialized"
        );
        Self {
            config,
            events_accepted: 0,
            events_rejected: 0,
            rejected_by_code: BTreeMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ValidatorConfig::default())
    }

    /// Validate one raw event. Timestamp bounds are measured from the
    /// event's commit timestamp when it has one, otherwise from `now`, so
    /// replaying a feed that carries commit times reaches the same
    /// decisions on every run.
    pub fn validate(
        &mut self,
        raw: &RawChangeEvent,
        now: DateTime<Utc>,
    ) -> Result<ChangeEvent, ValidationError> {
        match self.check(raw, now) {
            Ok(event) => {
                self.events_accepted += 1;
                Ok(event)
            }
            Err(err) => {
                self.events_rejected += 1;
                *self.rejected_by_code.entry(err.code()).or_insert(0) += 1;
                debug!(
                    transaction_id = raw.transaction_id.as_deref().unwrap_or(""),
                    code = err.code(),
                    reason = %err,
                    "Rejected change event"
                );
                Err(err)
            }
        }
    }

    fn check(&self, raw: &RawChangeEvent, now: DateTime<Utc>) -> Result<ChangeEvent, ValidationError> {
        let transaction_id = raw
            .transaction_id
            .clone()
            .and_then(TransactionId::try_new)
            .ok_or(ValidationError::MissingTransactionId)?;

        let operation = match raw.operation.as_deref().map(str::trim) {
            None | Some("") => return Err(ValidationError::MissingOperation),
            Some(label) => Operation::parse(label)
                .ok_or_else(|| ValidationError::InvalidOperation(label.to_string()))?,
        };

        let sequence_token = raw.sequence_token.ok_or(ValidationError::MissingSequenceToken)?;

        let merchant_id = raw
            .merchant_id
            .clone()
            .and_then(MerchantId::try_new)
            .ok_or(ValidationError::MissingMerchantId)?;

        let status = match raw.status.as_deref().map(str::trim) {
            None | Some("") => return Err(ValidationError::MissingStatus),
            Some(label) => TransactionStatus::parse(label)
                .ok_or_else(|| ValidationError::InvalidStatus(label.to_string()))?,
        };

        let amount = parse_amount(raw.transaction_amount.as_ref())?;
        if operation != Operation::DELETE && amount <= Decimal::ZERO {
            return Err(ValidationError::NonPositiveAmount {
                operation: operation.to_string(),
                amount: amount.to_string(),
            });
        }

        let event_timestamp = parse_timestamp(raw.event_timestamp.as_ref())?;
        let now = match raw.commit_timestamp.as_ref() {
            None | Some(Value::Null) => now,
            committed => parse_timestamp(committed)?,
        };
        if event_timestamp > now + self.config.max_event_skew {
            return Err(ValidationError::TimestampInFuture {
                timestamp: event_timestamp.to_rfc3339(),
                max_skew_secs: self.config.max_event_skew.num_seconds(),
            });
        }
        if let Some(max_age) = self.config.max_event_age {
            if event_timestamp < now - max_age {
                return Err(ValidationError::TimestampTooOld {
                    timestamp: event_timestamp.to_rfc3339(),
                    max_age_secs: max_age.num_seconds(),
                });
            }
        }

        Ok(ChangeEvent {
            transaction_id,
            operation,
            sequence_token,
            merchant_id,
            merchant_category: raw.merchant_category.clone(),
            transaction_amount: amount,
            status,
            event_timestamp,
            currency: raw.currency.clone(),
            payment_method: raw.payment_method.clone(),
            customer_id: raw.customer_id.clone(),
        })
    }

    pub fn events_accepted(&self) -> u64 {
        self.events_accepted
    }

    pub fn events_rejected(&self) -> u64 {
        self.events_rejected
    }

    pub fn rejected_by_code(&self) -> &BTreeMap<&'static str, u64> {
        &self.rejected_by_code
    }
}

/// Amounts arrive as JSON numbers or decimal strings. Floats are read
/// through their shortest decimal rendering so `12.1` stays `12.1`.
fn parse_amount(value: Option<&Value>) -> Result<Decimal, ValidationError> {
    let text = match value {
        None | Some(Value::Null) => return Err(ValidationError::MissingAmount),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) if s.trim().is_empty() => return Err(ValidationError::MissingAmount),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => return Err(ValidationError::NonNumericAmount(other.to_string())),
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| ValidationError::NonNumericAmount(text))
}

/// Timestamps arrive as RFC 3339 strings, naive `YYYY-MM-DD HH:MM:SS`
/// strings (taken as UTC) or epoch milliseconds.
fn parse_timestamp(value: Option<&Value>) -> Result<DateTime<Utc>, ValidationError> {
    match value {
        None | Some(Value::Null) => Err(ValidationError::MissingTimestamp),
        Some(Value::String(s)) if s.trim().is_empty() => Err(ValidationError::MissingTimestamp),
        Some(Value::String(s)) => {
            let s = s.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Ok(ts.with_timezone(&Utc));
            }
            ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| Utc.from_utc_datetime(&naive))
                .ok_or_else(|| ValidationError::InvalidTimestamp(s.to_string()))
        }
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .ok_or_else(|| ValidationError::InvalidTimestamp(n.to_string())),
        Some(other) => Err(ValidationError::InvalidTimestamp(other.to_string())),
    }
}
