//! Statement execution on a leased connection.
//!
//! These functions run on a worker with a connection already in hand. Each
//! one issues exactly the driver calls for one facade operation and narrows
//! the raw [`StatementOutput`] to the shape that operation promises.

use crate::db::pool::PooledConnection;
use crate::error::{DbError, DbResult};
use crate::models::{ResultSet, SqlValue, Statement, StatementKind, StatementOutput};
use crate::stream::StreamSink;
use std::time::Instant;
use tracing::debug;

fn run(conn: &mut PooledConnection, stmt: &Statement, kind: StatementKind) -> DbResult<StatementOutput> {
    let start = Instant::now();
    let result = conn.execute(&stmt.sql, stmt.params.as_slice(), kind, &stmt.options);
    let elapsed_ms = start.elapsed().as_millis() as u64;

    match &result {
        Ok(output) => debug!(
            connection_id = conn.id(),
            kind = %kind,
            sql = %stmt.sql_preview(),
            params = stmt.params.len(),
            result = output.shape(),
            elapsed_ms = elapsed_ms,
            "Statement executed"
        ),
        Err(e) => debug!(
            connection_id = conn.id(),
            kind = %kind,
            sql = %stmt.sql_preview(),
            params = stmt.params.len(),
            error = %e,
            elapsed_ms = elapsed_ms,
            "Statement failed"
        ),
    }
    result
}

fn unexpected(kind: StatementKind, output: &StatementOutput) -> DbError {
    DbError::driver(
        format!("Driver returned {} for a {} statement", output.shape(), kind),
        None,
    )
}

/// Run a statement whose result is discarded.
pub fn execute(conn: &mut PooledConnection, stmt: &Statement) -> DbResult<()> {
    run(conn, stmt, StatementKind::Execute).map(|_| ())
}

/// Run a query and collect its rows, at most `maxRows` of them.
pub fn query(conn: &mut PooledConnection, stmt: &Statement) -> DbResult<ResultSet> {
    let mut rows = match run(conn, stmt, StatementKind::Query)? {
        StatementOutput::Rows(rows) => rows,
        StatementOutput::Empty => ResultSet::default(),
        other => return Err(unexpected(StatementKind::Query, &other)),
    };
    if let Some(max) = stmt.options.max_rows() {
        rows.rows.truncate(usize::try_from(max).unwrap_or(usize::MAX));
    }
    Ok(rows)
}

/// Run a query and feed its rows into a row stream.
///
/// Errors reach the stream's consumer, not the caller.
pub fn stream(conn: &mut PooledConnection, stmt: &Statement, mut sink: StreamSink) -> DbResult<()> {
    let start = Instant::now();
    let result = conn.stream(&stmt.sql, stmt.params.as_slice(), &stmt.options, &mut sink);
    debug!(
        connection_id = conn.id(),
        sql = %stmt.sql_preview(),
        params = stmt.params.len(),
        rows = sink.rows_sent(),
        ok = result.is_ok(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Statement streamed"
    );
    sink.finish(result);
    Ok(())
}

/// Run a query and keep only its first row.
pub fn query_single(conn: &mut PooledConnection, stmt: &Statement) -> DbResult<Option<Vec<SqlValue>>> {
    query(conn, stmt).map(ResultSet::into_first)
}

/// Run an insert and return the generated keys (possibly none).
pub fn insert(conn: &mut PooledConnection, stmt: &Statement) -> DbResult<Vec<SqlValue>> {
    match run(conn, stmt, StatementKind::Insert)? {
        StatementOutput::Inserted { keys, .. } => Ok(keys),
        StatementOutput::Updated(_) | StatementOutput::Empty => Ok(Vec::new()),
        other => Err(unexpected(StatementKind::Insert, &other)),
    }
}

/// Run an update or delete and return the affected-row count.
pub fn update(conn: &mut PooledConnection, stmt: &Statement) -> DbResult<u64> {
    match run(conn, stmt, StatementKind::Update)? {
        StatementOutput::Updated(count) => Ok(count),
        StatementOutput::Inserted { updated, .. } => Ok(updated),
        StatementOutput::Empty => Ok(0),
        other => Err(unexpected(StatementKind::Update, &other)),
    }
}

/// Run every statement of a batch in order; the first failure aborts it.
pub fn batch(conn: &mut PooledConnection, stmts: &[Statement]) -> DbResult<Vec<u64>> {
    stmts.iter().map(|stmt| update(conn, stmt)).collect()
}
