//! Transaction handles, isolation levels and transaction metadata.

use crate::error::{DbError, DbResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Prefix of the serialized handle form.
const HANDLE_PREFIX: &str = "tx_";

/// Opaque token identifying one active transaction.
///
/// The string form (`tx_<32 hex>`) is a serialization of the same token, so a
/// handle that crossed a process or API boundary as text parses back into an
/// equal value. Whether it still names a live transaction is decided by the
/// registry on every use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxHandle(Uuid);

impl TxHandle {
    /// Generate a fresh, unique handle.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TxHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", HANDLE_PREFIX, self.0.simple())
    }
}

impl FromStr for TxHandle {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.trim().strip_prefix(HANDLE_PREFIX).ok_or_else(|| {
            DbError::unknown_transaction(s, "Malformed transaction id: expected a 'tx_' prefix")
        })?;
        if hex.len() != 32 {
            return Err(DbError::unknown_transaction(
                s,
                "Malformed transaction id: expected 32 hex characters",
            ));
        }
        Uuid::try_parse(hex)
            .map(Self)
            .map_err(|_| DbError::unknown_transaction(s, "Malformed transaction id"))
    }
}

impl Serialize for TxHandle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TxHandle {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Transaction isolation level, named as in JDBC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "IsolationRepr")]
pub enum IsolationLevel {
    /// Transactions are not supported; leave the session as the driver opened it
    None,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::ReadUncommitted => "READ_UNCOMMITTED",
            Self::ReadCommitted => "READ_COMMITTED",
            Self::RepeatableRead => "REPEATABLE_READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }

    /// Level for a `java.sql.Connection.TRANSACTION_*` constant.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::ReadUncommitted),
            2 => Some(Self::ReadCommitted),
            4 => Some(Self::RepeatableRead),
            8 => Some(Self::Serializable),
            _ => None,
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolationLevel {
    type Err = DbError;

    /// Accepts `READ_COMMITTED`, `read-committed`, `TRANSACTION_READ_COMMITTED`
    /// and the other spellings of the same names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        let name = normalized
            .strip_prefix("TRANSACTION_")
            .unwrap_or(&normalized);
        match name {
            "NONE" => Ok(Self::None),
            "READ_UNCOMMITTED" => Ok(Self::ReadUncommitted),
            "READ_COMMITTED" => Ok(Self::ReadCommitted),
            "REPEATABLE_READ" => Ok(Self::RepeatableRead),
            "SERIALIZABLE" => Ok(Self::Serializable),
            _ => Err(DbError::config(format!("Unknown isolation level: {}", s))),
        }
    }
}

impl Serialize for IsolationLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IsolationRepr {
    Name(String),
    Code(u8),
}

impl TryFrom<IsolationRepr> for IsolationLevel {
    type Error = DbError;

    fn try_from(repr: IsolationRepr) -> DbResult<Self> {
        match repr {
            IsolationRepr::Name(name) => name.parse(),
            IsolationRepr::Code(code) => Self::from_code(code)
                .ok_or_else(|| DbError::config(format!("Unknown isolation level code: {}", code))),
        }
    }
}

/// How a transaction ended. A transaction in the registry is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionOutcome {
    Committed,
    RolledBack,
    /// Rolled back by the registry after sitting idle too long
    TimedOut,
}

impl TransactionOutcome {
    /// Only a commit ends the transaction through `COMMIT`.
    pub fn commits(&self) -> bool {
        matches!(self, Self::Committed)
    }
}

impl fmt::Display for TransactionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Committed => write!(f, "committed"),
            Self::RolledBack => write!(f, "rolled back"),
            Self::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Snapshot of an active transaction, for listing without touching it.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionMetadata {
    pub handle: TxHandle,
    /// Pool-assigned id of the pinned connection
    pub connection_id: u64,
    pub isolation: IsolationLevel,
    pub started_at: DateTime<Utc>,
    /// Seconds since the last statement (or since begin)
    pub idle_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_format() {
        let handle = TxHandle::new();
        let text = handle.to_string();
        assert!(text.starts_with("tx_"));
        assert_eq!(text.len(), 3 + 32);
        assert_eq!(text.parse::<TxHandle>().unwrap(), handle);
    }

    #[test]
    fn test_handle_parse_rejects_garbage() {
        for bad in ["", "tx_", "abc", "tx_zz", "tx_0123456789abcdef0123456789abcdeg"] {
            let err = bad.parse::<TxHandle>().unwrap_err();
            assert_eq!(err.kind(), "unknown_transaction", "input {bad:?}");
        }
    }

    #[test]
    fn test_handle_serde() {
        let handle = TxHandle::new();
        let json = serde_json::to_value(handle).unwrap();
        assert_eq!(json, serde_json::json!(handle.to_string()));
        let back: TxHandle = serde_json::from_value(json).unwrap();
        assert_eq!(back, handle);
    }

    #[test]
    fn test_isolation_parse_spellings() {
        assert_eq!(
            "READ_COMMITTED".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert_eq!(
            "transaction_serializable".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::Serializable
        );
        assert_eq!(
            "repeatable-read".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::RepeatableRead
        );
        assert!("SNAPSHOT".parse::<IsolationLevel>().is_err());
    }

    #[test]
    fn test_isolation_deserialize_name_or_code() {
        let level: IsolationLevel = serde_json::from_str("\"READ_UNCOMMITTED\"").unwrap();
        assert_eq!(level, IsolationLevel::ReadUncommitted);
        let level: IsolationLevel = serde_json::from_str("4").unwrap();
        assert_eq!(level, IsolationLevel::RepeatableRead);
        assert!(serde_json::from_str::<IsolationLevel>("3").is_err());
        assert_eq!(
            serde_json::to_string(&IsolationLevel::Serializable).unwrap(),
            "\"SERIALIZABLE\""
        );
    }

    #[test]
    fn test_transaction_outcome() {
        assert!(TransactionOutcome::Committed.commits());
        assert!(!TransactionOutcome::RolledBack.commits());
        assert!(!TransactionOutcome::TimedOut.commits());
        assert_eq!(TransactionOutcome::TimedOut.to_string(), "timed out");
    }
}
