//! Type mappings between SQLite storage classes and [`SqlValue`].
//!
//! # Architecture
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies the declared column type into a logical category
//! 2. `decode_value` turns the stored value into a `SqlValue`, guided by the category
//!
//! SQLite stores dates and booleans as text or integers, so the declared type is
//! the only hint that a column holds one of them.

use crate::models::SqlValue;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rusqlite::types::ValueRef;

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for declared column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Boolean,
    Text,
    Binary,
    Date,
    Time,
    DateTime,
    Timestamp,
    /// Expression columns and columns declared without a type
    Unknown,
}

/// Classify a declared SQLite column type.
pub fn categorize_type(declared: Option<&str>) -> TypeCategory {
    let Some(declared) = declared else {
        return TypeCategory::Unknown;
    };
    let lower = declared.to_lowercase();

    if lower.is_empty() {
        return TypeCategory::Unknown;
    }

    // Temporal names first: "datetime" contains both "date" and "time"
    if lower.contains("timestamp") {
        return TypeCategory::Timestamp;
    }
    if lower.contains("datetime") {
        return TypeCategory::DateTime;
    }
    if lower == "date" {
        return TypeCategory::Date;
    }
    if lower == "time" {
        return TypeCategory::Time;
    }

    if lower.contains("bool") {
        return TypeCategory::Boolean;
    }

    // SQLite affinity rules, in the order SQLite applies them
    if lower.contains("int") {
        return TypeCategory::Integer;
    }
    if lower.contains("char") || lower.contains("clob") || lower.contains("text") {
        return TypeCategory::Text;
    }
    if lower.contains("blob") {
        return TypeCategory::Binary;
    }
    if lower.contains("real") || lower.contains("floa") || lower.contains("doub") {
        return TypeCategory::Float;
    }

    // NUMERIC affinity: keep whatever storage class the value has
    TypeCategory::Unknown
}

// =============================================================================
// Decoding
// =============================================================================

/// Convert a stored value to the generic model.
pub fn decode_value(value: ValueRef<'_>, category: TypeCategory) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(v) => match category {
            TypeCategory::Boolean => SqlValue::Bool(v != 0),
            TypeCategory::Float => SqlValue::Float(v as f64),
            _ => SqlValue::Int(v),
        },
        ValueRef::Real(v) => SqlValue::Float(v),
        ValueRef::Text(bytes) => decode_text(&String::from_utf8_lossy(bytes), category),
        ValueRef::Blob(bytes) => SqlValue::Bytes(bytes.to_vec()),
    }
}

fn decode_text(text: &str, category: TypeCategory) -> SqlValue {
    let typed = match category {
        TypeCategory::Date => NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .map(SqlValue::Date),
        TypeCategory::Time => parse_time(text).map(SqlValue::Time),
        TypeCategory::DateTime => parse_naive_datetime(text).map(SqlValue::DateTime),
        TypeCategory::Timestamp => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|v| SqlValue::Timestamp(v.with_timezone(&Utc)))
            .or_else(|| parse_naive_datetime(text).map(SqlValue::DateTime)),
        TypeCategory::Boolean => match text.to_ascii_lowercase().as_str() {
            "true" => Some(SqlValue::Bool(true)),
            "false" => Some(SqlValue::Bool(false)),
            _ => None,
        },
        _ => None,
    };
    typed.unwrap_or_else(|| SqlValue::Text(text.to_string()))
}

fn parse_time(text: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(text, "%H:%M"))
        .ok()
}

fn parse_naive_datetime(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M"))
        .ok()
}

// =============================================================================
// Encoding
// =============================================================================

/// Text form SQLite's date functions understand.
pub fn format_datetime(value: &NaiveDateTime) -> String {
    value.format("%Y-%m-%d %H:%M:%S%.f").to_string()
}

pub fn format_date(value: &NaiveDate) -> String {
    value.format("%Y-%m-%d").to_string()
}

pub fn format_time(value: &NaiveTime) -> String {
    value.format("%H:%M:%S%.f").to_string()
}

pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339()
}
