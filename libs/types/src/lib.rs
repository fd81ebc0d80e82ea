//! Types library for the CDC aggregation engine
//!
//! Shared type definitions used by the persistence layer and the
//! aggregation service.
//!
//! # Modules
//! - `ids`: Identifiers (TransactionId, MerchantId, BatchId)
//! - `event`: Change event model (raw and normalized), sequence tokens
//! - `aggregate`: Aggregate keys, time buckets, rows and signed deltas
//! - `errors`: Validation error taxonomy

pub mod aggregate;
pub mod errors;
pub mod event;
pub mod ids;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::aggregate::*;
    pub use crate::errors::*;
    pub use crate::event::*;
    pub use crate::ids::*;
}
