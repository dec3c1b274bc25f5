//! Statement requests.
//!
//! A [`Statement`] is built and validated on the caller's side, before any
//! connection is leased or any worker is involved.

use crate::error::{DbError, DbResult};
use crate::models::value::Params;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rows per batch handed from a worker to a row stream.
pub const DEFAULT_FETCH_SIZE: usize = 128;

/// Per-statement execution limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementOptions {
    /// Interrupt the statement after this long; 0 or absent means no limit.
    /// For row streams the limit covers the work up to the first row.
    #[serde(alias = "query_timeout_ms")]
    pub query_timeout_ms: Option<u64>,
    /// Read at most this many rows; 0 or absent means all of them
    #[serde(alias = "max_rows")]
    pub max_rows: Option<u64>,
    /// Rows per batch when streaming (default: 128)
    #[serde(alias = "fetch_size")]
    pub fetch_size: Option<usize>,
}

impl StatementOptions {
    pub fn with_query_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.query_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_max_rows(mut self, max_rows: u64) -> Self {
        self.max_rows = Some(max_rows);
        self
    }

    pub fn with_fetch_size(mut self, fetch_size: usize) -> Self {
        self.fetch_size = Some(fetch_size);
        self
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn max_rows(&self) -> Option<u64> {
        self.max_rows.filter(|max| *max > 0)
    }

    pub fn fetch_size_or_default(&self) -> usize {
        self.fetch_size
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_FETCH_SIZE)
    }
}

/// SQL text plus ordered positional parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub options: StatementOptions,
}

impl Statement {
    /// Build a statement, rejecting blank SQL.
    pub fn new(sql: impl Into<String>, params: impl Into<Params>) -> DbResult<Self> {
        let sql = sql.into();
        if sql.trim().is_empty() {
            return Err(DbError::invalid_input("SQL statement cannot be empty"));
        }
        Ok(Self {
            sql,
            params: params.into(),
            options: StatementOptions::default(),
        })
    }

    pub fn with_options(mut self, options: StatementOptions) -> Self {
        self.options = options;
        self
    }

    /// Build one statement per parameter set, all sharing the same SQL.
    pub fn batch(sql: impl Into<String>, param_sets: Vec<Params>) -> DbResult<Vec<Self>> {
        let sql = sql.into();
        if param_sets.is_empty() {
            return Err(DbError::invalid_input(
                "Batch requires at least one parameter set",
            ));
        }
        param_sets
            .into_iter()
            .map(|params| Self::new(sql.clone(), params))
            .collect()
    }

    /// SQL shortened for log output.
    pub fn sql_preview(&self) -> &str {
        const MAX_PREVIEW: usize = 200;
        match self.sql.char_indices().nth(MAX_PREVIEW) {
            Some((idx, _)) => &self.sql[..idx],
            None => &self.sql,
        }
    }
}
