//! CDC Merchant Aggregation Engine
//!
//! Consumes row-level change events (INSERT / UPDATE / DELETE) of payment
//! transactions and maintains per-merchant, per-time-bucket aggregates
//! incrementally, with at-least-once input and exactly-once effect.
//!
//! # Architecture
//!
//! ```text
//!   ChangeSource
//!        │
//!   ┌────▼─────┐
//!   │Validate  │  ← rejects malformed events with a reason code
//!   └────┬─────┘
//!        │ route by merchant hash
//!   ┌────┴──────────┬───────────────┐
//! ┌─▼──────────┐ ┌──▼─────────┐ ┌───▼────────┐
//! │Partition 0 │ │Partition 1 │ │Partition N │  resolver → sequencer
//! └─┬──────────┘ └──┬─────────┘ └───┬────────┘
//!   │               │               │
//! ┌─▼───────────────▼───────────────▼─┐
//! │ AggregateStore (token-gated rows) │
//! └─┬─────────────────────────────────┘
//!   │ then
//! ┌─▼──────────┐   ┌───────────────┐
//! │Checkpoints │   │Processing log │
//! └────────────┘   └───────────────┘
//! ```

pub mod checkpoint;
pub mod config;
pub mod durable_store;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod partition;
pub mod processing_log;
pub mod recent_state;
pub mod resolver;
pub mod retry;
pub mod sequencer;
pub mod source;
pub mod store;
pub mod validation;

pub use config::EngineConfig;
pub use engine::{AggregationEngine, EngineHandle, EngineReport};
pub use error::EngineError;
