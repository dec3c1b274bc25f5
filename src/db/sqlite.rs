//! Bundled blocking driver backed by SQLite (rusqlite).
//!
//! URLs: `jdbc:sqlite:<path>`, `sqlite:<path>`, `sqlite://<path>`; the paths
//! `:memory:` and `memory:` open a private in-memory database per connection.

use crate::db::driver::{DataSource, Driver, DriverConnection, RowSink};
use crate::db::types::{categorize_type, decode_value};
use crate::error::{DbError, DbResult};
use crate::models::{
    IsolationLevel, ResultSet, SqlValue, StatementKind, StatementOptions, StatementOutput,
};
use rusqlite::hooks::Action;
use rusqlite::{Connection, OpenFlags, params_from_iter};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// How long a statement waits on a locked database file before failing.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// VM steps between deadline checks.
const PROGRESS_STEPS: i32 = 1_000;

/// Extended result code reported for an interrupted statement.
const SQLITE_INTERRUPT: &str = "9";

const DRIVER_IDS: &[&str] = &["sqlite", "org.sqlite.JDBC"];

#[derive(Debug, Clone)]
pub struct SqliteDriver {
    busy_timeout: Duration,
}

impl SqliteDriver {
    pub fn new() -> Self {
        Self {
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    pub fn with_busy_timeout(busy_timeout: Duration) -> Self {
        Self { busy_timeout }
    }

    pub fn accepts_driver_id(id: &str) -> bool {
        DRIVER_IDS.iter().any(|known| known.eq_ignore_ascii_case(id))
    }

    pub fn accepts_scheme(scheme: &str) -> bool {
        scheme.eq_ignore_ascii_case("sqlite")
    }

    fn database_path(source: &DataSource) -> DbResult<Option<&str>> {
        let path = source.target.strip_prefix("//").unwrap_or(&source.target);
        let path = path.split('?').next().unwrap_or(path);
        match path {
            "" => Err(DbError::config(format!(
                "SQLite URL '{}' does not name a database file",
                source.url
            ))),
            ":memory:" | "memory:" => Ok(None),
            path => Ok(Some(path)),
        }
    }
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for SqliteDriver {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn open(&self, source: &DataSource) -> DbResult<Box<dyn DriverConnection>> {
        let conn = match Self::database_path(source)? {
            Some(path) => Connection::open_with_flags(path, OpenFlags::default())?,
            None => Connection::open_in_memory()?,
        };
        conn.busy_timeout(self.busy_timeout)?;
        debug!(url = %source.url, "Opened SQLite connection");
        Ok(Box::new(SqliteConnection { conn }))
    }
}

/// One SQLite session.
pub struct SqliteConnection {
    conn: Connection,
}

/// Collects rows for a non-streaming query, up to `max_rows`.
struct Collect {
    columns: Vec<String>,
    rows: Vec<Vec<SqlValue>>,
    max_rows: Option<u64>,
}

impl RowSink for Collect {
    fn columns(&mut self, names: &[String]) -> bool {
        self.columns = names.to_vec();
        self.max_rows != Some(0)
    }

    fn row(&mut self, values: Vec<SqlValue>) -> bool {
        self.rows.push(values);
        self.max_rows
            .is_none_or(|max| (self.rows.len() as u64) < max)
    }
}

impl SqliteConnection {
    /// Run `f` with the statement interrupted once `timeout` has passed.
    fn with_deadline<T>(
        &self,
        timeout: Option<Duration>,
        f: impl FnOnce() -> DbResult<T>,
    ) -> DbResult<T> {
        let Some(timeout) = timeout else {
            return f();
        };
        let deadline = Instant::now() + timeout;
        self.conn
            .progress_handler(PROGRESS_STEPS, Some(move || Instant::now() >= deadline));
        let result = f();
        self.clear_deadline();

        result.map_err(|e| match e {
            DbError::Driver {
                sql_state: Some(ref code),
                ..
            } if code == SQLITE_INTERRUPT && Instant::now() >= deadline => {
                DbError::query_timeout(timeout.as_millis() as u64)
            }
            other => other,
        })
    }

    fn clear_deadline(&self) {
        self.conn.progress_handler(0, None::<fn() -> bool>);
    }

    /// Read a query's rows into `sink`.
    ///
    /// With `first_row_deadline` the interrupt is lifted once the first row
    /// (or the end of the result) has been reached.
    fn read_rows(
        &self,
        sql: &str,
        params: &[SqlValue],
        sink: &mut dyn RowSink,
        first_row_deadline: bool,
    ) -> DbResult<()> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let categories: Vec<_> = stmt
            .columns()
            .iter()
            .map(|col| categorize_type(col.decl_type()))
            .collect();
        if !sink.columns(&columns) {
            return Ok(());
        }

        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut first = true;
        loop {
            let next = rows.next()?;
            if first && first_row_deadline {
                self.clear_deadline();
            }
            first = false;
            let Some(row) = next else {
                break;
            };
            let values = categories
                .iter()
                .enumerate()
                .map(|(idx, category)| Ok(decode_value(row.get_ref(idx)?, *category)))
                .collect::<DbResult<Vec<_>>>()?;
            if !sink.row(values) {
                break;
            }
        }
        Ok(())
    }

    fn query(&self, sql: &str, params: &[SqlValue], options: &StatementOptions) -> DbResult<ResultSet> {
        let mut collect = Collect {
            columns: Vec::new(),
            rows: Vec::new(),
            max_rows: options.max_rows(),
        };
        self.read_rows(sql, params, &mut collect, false)?;
        Ok(ResultSet::new(collect.columns, collect.rows))
    }

    /// Run a statement whose result is discarded.
    fn run(&self, sql: &str, params: &[SqlValue]) -> DbResult<()> {
        if params.is_empty() {
            // Scripts with several statements only work through execute_batch
            self.conn.execute_batch(sql)?;
            return Ok(());
        }
        let mut stmt = self.conn.prepare(sql)?;
        if stmt.column_count() > 0 {
            let mut rows = stmt.query(params_from_iter(params.iter()))?;
            while rows.next()?.is_some() {}
            return Ok(());
        }
        stmt.execute(params_from_iter(params.iter()))?;
        Ok(())
    }

    fn update(&self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        let mut stmt = self.conn.prepare(sql)?;
        Ok(stmt.execute(params_from_iter(params.iter()))? as u64)
    }

    /// Insert and report the rowid of every row the statement inserted.
    ///
    /// Rowids come from the update hook, in insertion order. Rows that
    /// triggers write to other tables are left out: the keys belong to the
    /// first table the statement inserted into. WITHOUT ROWID tables never
    /// reach the hook and yield no keys.
    fn insert(&self, sql: &str, params: &[SqlValue]) -> DbResult<(u64, Vec<SqlValue>)> {
        let inserted: Arc<Mutex<Vec<(String, i64)>>> = Arc::default();
        let recorder = Arc::clone(&inserted);
        self.conn.update_hook(Some(
            move |action: Action, _db: &str, table: &str, rowid: i64| {
                if matches!(action, Action::SQLITE_INSERT) {
                    recorder
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push((table.to_string(), rowid));
                }
            },
        ));
        let result = self.update(sql, params);
        self.conn.update_hook(None::<fn(Action, &str, &str, i64)>);
        let updated = result?;

        let inserted = std::mem::take(&mut *inserted.lock().unwrap_or_else(PoisonError::into_inner));
        let keys = match inserted.first() {
            Some((target, _)) => inserted
                .iter()
                .filter(|(table, _)| table == target)
                .map(|(_, rowid)| SqlValue::Int(*rowid))
                .collect(),
            None => Vec::new(),
        };
        Ok((updated, keys))
    }
}

impl DriverConnection for SqliteConnection {
    fn execute(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        kind: StatementKind,
        options: &StatementOptions,
    ) -> DbResult<StatementOutput> {
        self.with_deadline(options.query_timeout(), || match kind {
            StatementKind::Query => self.query(sql, params, options).map(StatementOutput::Rows),
            StatementKind::Execute => self.run(sql, params).map(|_| StatementOutput::Empty),
            StatementKind::Update => self.update(sql, params).map(StatementOutput::Updated),
            StatementKind::Insert => self
                .insert(sql, params)
                .map(|(updated, keys)| StatementOutput::Inserted { updated, keys }),
        })
    }

    fn stream(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        options: &StatementOptions,
        sink: &mut dyn RowSink,
    ) -> DbResult<()> {
        self.with_deadline(options.query_timeout(), || {
            self.read_rows(sql, params, sink, true)
        })
    }

    fn set_isolation(&mut self, level: IsolationLevel) -> DbResult<()> {
        // SQLite transactions are serializable; only dirty reads can be switched on
        let read_uncommitted = matches!(level, IsolationLevel::ReadUncommitted);
        self.conn
            .pragma_update(None, "read_uncommitted", read_uncommitted)?;
        Ok(())
    }

    fn begin(&mut self) -> DbResult<()> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    fn commit(&mut self) -> DbResult<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> DbResult<()> {
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn is_valid(&mut self) -> bool {
        self.conn.is_autocommit()
            && self
                .conn
                .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .is_ok()
    }

    fn close(self: Box<Self>) -> DbResult<()> {
        self.conn.close().map_err(|(_, e)| DbError::from(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;

    fn open_memory() -> Box<dyn DriverConnection> {
        let source = DataSource::from_config(&PoolConfig::new("jdbc:sqlite::memory:")).unwrap();
        SqliteDriver::new().open(&source).unwrap()
    }

    fn run(conn: &mut Box<dyn DriverConnection>, sql: &str, kind: StatementKind) -> DbResult<StatementOutput> {
        conn.execute(sql, &[], kind, &StatementOptions::default())
    }

    fn keys(output: StatementOutput) -> Vec<SqlValue> {
        match output {
            StatementOutput::Inserted { keys, .. } => keys,
            other => panic!("unexpected output: {}", other.shape()),
        }
    }

    fn ints(values: &[i64]) -> Vec<SqlValue> {
        values.iter().copied().map(SqlValue::Int).collect()
    }

    #[test]
    fn test_insert_returns_rowids() {
        let mut conn = open_memory();
        run(&mut conn, "CREATE TABLE t (id INTEGER PRIMARY KEY, v INTEGER)", StatementKind::Execute)
            .unwrap();

        let out = conn
            .execute(
                "INSERT INTO t(v) VALUES (?)",
                &[SqlValue::Int(42)],
                StatementKind::Insert,
                &StatementOptions::default(),
            )
            .unwrap();
        assert_eq!(keys(out), ints(&[1]));

        let out = run(&mut conn, "INSERT INTO t(v) VALUES (1), (2), (3)", StatementKind::Insert).unwrap();
        assert_eq!(keys(out), ints(&[2, 3, 4]));
    }

    #[test]
    fn test_insert_keys_follow_explicit_ids() {
        let mut conn = open_memory();
        run(&mut conn, "CREATE TABLE t (id INTEGER PRIMARY KEY, v INTEGER)", StatementKind::Execute)
            .unwrap();

        let out = run(&mut conn, "INSERT INTO t(id, v) VALUES (10, 1), (5, 2)", StatementKind::Insert)
            .unwrap();
        assert_eq!(keys(out), ints(&[10, 5]));

        let sql = format!("INSERT INTO t(id, v) VALUES ({}, 3), ({}, 4)", i64::MAX, i64::MIN);
        let out = run(&mut conn, &sql, StatementKind::Insert).unwrap();
        assert_eq!(keys(out), ints(&[i64::MAX, i64::MIN]));

        let out = run(&mut conn, "INSERT INTO t(id, v) SELECT id + 100, v FROM t WHERE id IN (5, 10) ORDER BY id DESC", StatementKind::Insert)
            .unwrap();
        assert_eq!(keys(out), ints(&[110, 105]));
    }

    #[test]
    fn test_insert_keys_ignore_trigger_rows() {
        let mut conn = open_memory();
        run(
            &mut conn,
            "CREATE TABLE t (id INTEGER PRIMARY KEY, v INTEGER);
             CREATE TABLE audit (id INTEGER PRIMARY KEY, note TEXT);
             CREATE TRIGGER t_audit AFTER INSERT ON t
             BEGIN INSERT INTO audit(id, note) VALUES (NEW.id + 1000, 'added'); END;",
            StatementKind::Execute,
        )
        .unwrap();

        let out = run(&mut conn, "INSERT INTO t(id, v) VALUES (7, 1), (3, 2)", StatementKind::Insert)
            .unwrap();
        assert_eq!(keys(out), ints(&[7, 3]));
    }

    #[test]
    fn test_failed_insert_leaves_no_hook_behind() {
        let mut conn = open_memory();
        run(&mut conn, "CREATE TABLE t (id INTEGER PRIMARY KEY)", StatementKind::Execute).unwrap();
        run(&mut conn, "INSERT INTO t VALUES (1)", StatementKind::Insert).unwrap();

        let err = run(&mut conn, "INSERT INTO t VALUES (2), (1)", StatementKind::Insert).unwrap_err();
        assert_eq!(err.kind(), "driver");
        let out = run(&mut conn, "INSERT INTO t VALUES (4)", StatementKind::Insert).unwrap();
        assert_eq!(keys(out), ints(&[4]));
    }

    #[test]
    fn test_insert_without_rowid_returns_no_keys() {
        let mut conn = open_memory();
        run(&mut conn, "CREATE TABLE t (id INTEGER PRIMARY KEY)", StatementKind::Execute).unwrap();
        run(&mut conn, "INSERT INTO t VALUES (7)", StatementKind::Insert).unwrap();
        run(
            &mut conn,
            "CREATE TABLE kv (k TEXT PRIMARY KEY, v TEXT) WITHOUT ROWID",
            StatementKind::Execute,
        )
        .unwrap();

        let out = conn
            .execute(
                "INSERT INTO kv VALUES (?, ?)",
                &[SqlValue::from("a"), SqlValue::from("b")],
                StatementKind::Insert,
                &StatementOptions::default(),
            )
            .unwrap();
        assert!(keys(out).is_empty());

        let out = run(&mut conn, "INSERT INTO t SELECT 8 WHERE 0", StatementKind::Insert).unwrap();
        assert!(keys(out).is_empty());
    }

    #[test]
    fn test_query_decodes_declared_types() {
        let mut conn = open_memory();
        run(
            &mut conn,
            "CREATE TABLE e (flag BOOLEAN, born DATE, data BLOB, name TEXT)",
            StatementKind::Execute,
        )
        .unwrap();
        run(
            &mut conn,
            "INSERT INTO e VALUES (1, '2000-01-31', x'0102', 'x')",
            StatementKind::Execute,
        )
        .unwrap();

        let StatementOutput::Rows(rs) = run(&mut conn, "SELECT * FROM e", StatementKind::Query).unwrap()
        else {
            panic!("expected rows");
        };
        let row = rs.row(0).unwrap();
        assert_eq!(row.get("flag"), Some(&SqlValue::Bool(true)));
        assert!(matches!(row.get("born"), Some(SqlValue::Date(_))));
        assert_eq!(row.get("data"), Some(&SqlValue::Bytes(vec![1, 2])));
        assert_eq!(row.get("name"), Some(&SqlValue::from("x")));
    }

    #[test]
    fn test_max_rows_limits_query() {
        let mut conn = open_memory();
        let sql = "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 50) SELECT x FROM n";
        let options = StatementOptions::default().with_max_rows(3);
        let StatementOutput::Rows(rs) = conn.execute(sql, &[], StatementKind::Query, &options).unwrap()
        else {
            panic!("expected rows");
        };
        assert_eq!(rs.rows, vec![ints(&[1]), ints(&[2]), ints(&[3])]);
    }

    #[test]
    fn test_query_timeout_interrupts() {
        let mut conn = open_memory();
        let endless = "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) SELECT count(*) FROM n";
        let options = StatementOptions::default().with_query_timeout_ms(100);

        let started = Instant::now();
        let err = conn
            .execute(endless, &[], StatementKind::Query, &options)
            .unwrap_err();
        assert!(matches!(err, DbError::QueryTimeout { timeout_ms: 100 }));
        assert!(started.elapsed() < Duration::from_secs(5));

        // The handler is gone: later statements run unbounded
        assert!(run(&mut conn, "SELECT 1", StatementKind::Query).is_ok());
        assert!(conn.is_valid());
    }

    struct Recording {
        columns: Vec<String>,
        rows: Vec<Vec<SqlValue>>,
        stop_after: usize,
    }

    impl RowSink for Recording {
        fn columns(&mut self, names: &[String]) -> bool {
            self.columns = names.to_vec();
            true
        }

        fn row(&mut self, values: Vec<SqlValue>) -> bool {
            self.rows.push(values);
            self.rows.len() < self.stop_after
        }
    }

    #[test]
    fn test_stream_stops_when_sink_declines() {
        let mut conn = open_memory();
        let sql = "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) SELECT x AS n FROM n";
        let mut sink = Recording {
            columns: Vec::new(),
            rows: Vec::new(),
            stop_after: 4,
        };
        conn.stream(sql, &[], &StatementOptions::default(), &mut sink)
            .unwrap();
        assert_eq!(sink.columns, vec!["n".to_string()]);
        assert_eq!(sink.rows.len(), 4);
        assert!(conn.is_valid());
    }

    #[test]
    fn test_transaction_lifecycle_and_validity() {
        let mut conn = open_memory();
        assert!(conn.is_valid());
        conn.begin().unwrap();
        assert!(!conn.is_valid());
        conn.rollback().unwrap();
        assert!(conn.is_valid());
        conn.set_isolation(IsolationLevel::ReadUncommitted).unwrap();
        conn.close().unwrap();
    }

    #[test]
    fn test_parameter_count_mismatch_is_driver_error() {
        let mut conn = open_memory();
        let err = conn
            .execute(
                "SELECT ?, ?",
                &[SqlValue::Int(1)],
                StatementKind::Query,
                &StatementOptions::default(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), "driver");
    }

    #[test]
    fn test_url_without_path_rejected() {
        let mut source =
            DataSource::from_config(&PoolConfig::new("jdbc:sqlite:app.db")).unwrap();
        source.target = String::new();
        let err = SqliteDriver::new().open(&source).err().unwrap();
        assert_eq!(err.kind(), "config");
    }
}
