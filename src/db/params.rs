//! Parameter binding for the SQLite driver.
//!
//! Every [`SqlValue`] variant has a SQLite representation, so binding itself
//! never fails; values outside the scalar set are rejected earlier, when
//! [`Params`](crate::models::Params) are built.

use crate::db::types::{format_date, format_datetime, format_time, format_timestamp};
use crate::models::SqlValue;
use rusqlite::ToSql;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            SqlValue::Bool(v) => ToSqlOutput::Owned(Value::Integer(i64::from(*v))),
            SqlValue::Int(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            SqlValue::Float(v) => ToSqlOutput::Owned(Value::Real(*v)),
            SqlValue::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            SqlValue::Bytes(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
            SqlValue::Date(v) => ToSqlOutput::Owned(Value::Text(format_date(v))),
            SqlValue::Time(v) => ToSqlOutput::Owned(Value::Text(format_time(v))),
            SqlValue::DateTime(v) => ToSqlOutput::Owned(Value::Text(format_datetime(v))),
            SqlValue::Timestamp(v) => ToSqlOutput::Owned(Value::Text(format_timestamp(v))),
        })
    }
}
