//! Data models for the SQL bridge.
//!
//! This module re-exports all model types used throughout the crate.

pub mod query;
pub mod result;
pub mod transaction;
pub mod value;

// Re-export commonly used types
pub use query::{DEFAULT_FETCH_SIZE, Statement, StatementOptions};
pub use result::{ResultSet, Row, StatementKind, StatementOutput};
pub use transaction::{IsolationLevel, TransactionMetadata, TransactionOutcome, TxHandle};
pub use value::{Params, SqlValue};
