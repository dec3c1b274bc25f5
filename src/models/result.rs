//! Statement results.
//!
//! A driver call produces a [`StatementOutput`]; the facade narrows it to the
//! shape each operation promises (rows, affected count, generated keys, or nothing).

use crate::models::value::SqlValue;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// What the caller expects a statement to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementKind {
    /// DDL or any statement whose result is discarded
    Execute,
    /// Returns rows
    Query,
    /// Returns an affected-row count (UPDATE, DELETE)
    Update,
    /// Returns generated keys
    Insert,
}

impl std::fmt::Display for StatementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Execute => write!(f, "execute"),
            Self::Query => write!(f, "query"),
            Self::Update => write!(f, "update"),
            Self::Insert => write!(f, "insert"),
        }
    }
}

/// Raw result of one driver call.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementOutput {
    Empty,
    Rows(ResultSet),
    Updated(u64),
    Inserted { updated: u64, keys: Vec<SqlValue> },
}

impl StatementOutput {
    /// Name of the variant, for diagnostics.
    pub fn shape(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Rows(_) => "rows",
            Self::Updated(_) => "update count",
            Self::Inserted { .. } => "generated keys",
        }
    }
}

/// An ordered sequence of same-shaped rows.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<SqlValue>>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    /// Borrow the row at `index`.
    pub fn row(&self, index: usize) -> Option<Row<'_>> {
        self.rows.get(index).map(|values| Row {
            columns: &self.columns,
            values,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Row<'_>> {
        self.rows.iter().map(|values| Row {
            columns: &self.columns,
            values,
        })
    }

    /// First row's values, if any.
    pub fn into_first(self) -> Option<Vec<SqlValue>> {
        self.rows.into_iter().next()
    }

    /// Rows as JSON objects, keys in column order.
    pub fn to_json_rows(&self) -> Vec<JsonValue> {
        self.iter().map(|row| JsonValue::Object(row.to_json_map())).collect()
    }

    /// Consume the set into one column-name to value mapping per row.
    pub fn into_rows_as_maps(self) -> Vec<Vec<(String, SqlValue)>> {
        let columns = self.columns;
        self.rows
            .into_iter()
            .map(|values| columns.iter().cloned().zip(values).collect())
            .collect()
    }
}

/// A borrowed view of one row.
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    columns: &'a [String],
    values: &'a [SqlValue],
}

impl<'a> Row<'a> {
    /// Value of the named column (exact match first, then ASCII case-insensitive).
    pub fn get(&self, column: &str) -> Option<&'a SqlValue> {
        let idx = self
            .columns
            .iter()
            .position(|c| c == column)
            .or_else(|| self.columns.iter().position(|c| c.eq_ignore_ascii_case(column)))?;
        self.values.get(idx)
    }

    pub fn get_index(&self, index: usize) -> Option<&'a SqlValue> {
        self.values.get(index)
    }

    pub fn values(&self) -> &'a [SqlValue] {
        self.values
    }

    pub fn to_json_map(&self) -> serde_json::Map<String, JsonValue> {
        self.columns
            .iter()
            .zip(self.values)
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ResultSet {
        ResultSet::new(
            vec!["id".to_string(), "Name".to_string()],
            vec![
                vec![SqlValue::Int(1), SqlValue::Text("a".to_string())],
                vec![SqlValue::Int(2), SqlValue::Null],
            ],
        )
    }

    #[test]
    fn test_row_lookup_by_name() {
        let rs = sample();
        let row = rs.row(0).unwrap();
        assert_eq!(row.get("id"), Some(&SqlValue::Int(1)));
        assert_eq!(row.get("name"), Some(&SqlValue::Text("a".to_string())));
        assert!(row.get("missing").is_none());
        assert!(rs.row(5).is_none());
    }

    #[test]
    fn test_to_json_rows() {
        let rows = sample().to_json_rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], 1);
        assert!(rows[1]["Name"].is_null());
    }

    #[test]
    fn test_into_first() {
        assert_eq!(sample().into_first().unwrap()[0], SqlValue::Int(1));
        assert!(ResultSet::default().into_first().is_none());
    }
}
