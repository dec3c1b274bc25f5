//! Error types for the SQL bridge.
//!
//! This module defines all error types using `thiserror`. Validation errors
//! (`InvalidInput`, `UnsupportedValue`, `Config`) are returned before any work
//! is dispatched; everything else arrives through the same `DbResult` the
//! successful value would have used.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Connection pool exhausted: no connection available within {waited_ms}ms (max size {max_size})")]
    PoolExhausted { max_size: u32, waited_ms: u64 },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Driver error: {message}")]
    Driver {
        message: String,
        /// Vendor or SQLSTATE code when the driver reports one
        sql_state: Option<String>,
    },

    #[error("Statement cancelled after exceeding its {timeout_ms}ms query timeout")]
    QueryTimeout { timeout_ms: u64 },

    #[error("Unknown transaction: {reason} (transaction: {handle})")]
    UnknownTransaction { handle: String, reason: String },

    #[error("Unsupported value of type {type_name} in {context}")]
    UnsupportedValue { type_name: String, context: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a pool exhausted error.
    pub fn pool_exhausted(max_size: u32, waited_ms: u64) -> Self {
        Self::PoolExhausted {
            max_size,
            waited_ms,
        }
    }

    /// Create a driver error with optional SQL state.
    pub fn driver(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Driver {
            message: message.into(),
            sql_state,
        }
    }

    /// Create a query timeout error.
    pub fn query_timeout(timeout_ms: u64) -> Self {
        Self::QueryTimeout { timeout_ms }
    }

    /// Create an unknown transaction error.
    pub fn unknown_transaction(handle: impl ToString, reason: impl Into<String>) -> Self {
        Self::UnknownTransaction {
            handle: handle.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an unsupported value error.
    pub fn unsupported_value(type_name: impl Into<String>, context: impl Into<String>) -> Self {
        Self::UnsupportedValue {
            type_name: type_name.into(),
            context: context.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable short name of the error category, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::PoolClosed => "pool_closed",
            Self::Driver { .. } => "driver",
            Self::QueryTimeout { .. } => "query_timeout",
            Self::UnknownTransaction { .. } => "unknown_transaction",
            Self::UnsupportedValue { .. } => "unsupported_value",
            Self::InvalidInput { .. } => "invalid_input",
            Self::Internal { .. } => "internal",
        }
    }

    /// Check if this error is retryable.
    ///
    /// Only a lease timeout qualifies: it fails before the driver is touched.
    /// Driver errors are never retryable here since statements may have side effects.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }

    /// True for errors reported by validation, before any dispatch.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput { .. } | Self::UnsupportedValue { .. } | Self::Config { .. }
        )
    }
}

/// Convert rusqlite errors to DbError.
impl From<rusqlite::Error> for DbError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(code, message) => {
                let message = message.unwrap_or_else(|| code.to_string());
                DbError::driver(message, Some(code.extended_code.to_string()))
            }
            rusqlite::Error::ToSqlConversionFailure(e) => {
                DbError::unsupported_value(e.to_string(), "parameter binding")
            }
            rusqlite::Error::FromSqlConversionFailure(idx, ty, e) => DbError::unsupported_value(
                ty.to_string(),
                format!("column {}: {}", idx, e),
            ),
            rusqlite::Error::InvalidParameterCount(given, expected) => DbError::driver(
                format!(
                    "Wrong number of parameters: {} given, statement expects {}",
                    given, expected
                ),
                None,
            ),
            other => DbError::driver(other.to_string(), None),
        }
    }
}

/// Configuration objects that fail to deserialize are configuration errors.
impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::config(err.to_string())
    }
}

/// Result type alias for bridge operations.
pub type DbResult<T> = Result<T, DbError>;
