//! Scripted in-memory driver shared by the integration tests.
//!
//! Statements are interpreted, not parsed:
//! - `SLEEP <ms>` blocks the worker for that long
//! - `FAIL` returns a driver error and leaves the connection usable
//! - `BREAK` returns a driver error and breaks the connection for good
//! - `CONNECTION_ID` returns one row holding the connection id
//! - `ROWS <n>` returns rows `0..n` in a column named `n`
//!
//! Anything else is appended to the shared log as `<id>:<sql>`.

#![allow(dead_code)]

use async_sql_bridge::db::{DataSource, Driver, DriverConnection};
use async_sql_bridge::error::{DbError, DbResult};
use async_sql_bridge::models::{
    IsolationLevel, ResultSet, SqlValue, StatementKind, StatementOptions, StatementOutput,
};
use async_sql_bridge::{JdbcClient, PoolConfig};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct Stats {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    /// Most connections open at any one time
    pub peak_open: AtomicUsize,
    pub begun: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    /// Statements currently running, across all connections
    pub running: AtomicUsize,
    pub peak_running: AtomicUsize,
    /// Make `open` fail
    pub refuse_open: AtomicBool,
    next_id: AtomicU64,
    next_key: AtomicI64,
    log: Mutex<Vec<String>>,
    isolations: Mutex<Vec<IsolationLevel>>,
}

impl Stats {
    pub fn open_connections(&self) -> usize {
        self.opened.load(Ordering::SeqCst) - self.closed.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn isolations(&self) -> Vec<IsolationLevel> {
        self.isolations.lock().unwrap().clone()
    }
}

pub struct ScriptedDriver {
    pub stats: Arc<Stats>,
}

impl ScriptedDriver {
    pub fn new() -> (Arc<Self>, Arc<Stats>) {
        let stats = Arc::new(Stats::default());
        (
            Arc::new(Self {
                stats: Arc::clone(&stats),
            }),
            stats,
        )
    }
}

impl Driver for ScriptedDriver {
    fn name(&self) -> &str {
        "scripted"
    }

    fn open(&self, _source: &DataSource) -> DbResult<Box<dyn DriverConnection>> {
        if self.stats.refuse_open.load(Ordering::SeqCst) {
            return Err(DbError::driver("connection refused", Some("08001".to_string())));
        }
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        let open = self.stats.open_connections();
        self.stats.peak_open.fetch_max(open, Ordering::SeqCst);
        let id = self.stats.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(ScriptedConnection {
            id,
            stats: Arc::clone(&self.stats),
            broken: false,
        }))
    }
}

struct ScriptedConnection {
    id: u64,
    stats: Arc<Stats>,
    broken: bool,
}

impl ScriptedConnection {
    fn run(&mut self, sql: &str, kind: StatementKind) -> DbResult<StatementOutput> {
        if self.broken {
            return Err(DbError::driver("connection is broken", Some("08006".to_string())));
        }
        if let Some(ms) = sql.strip_prefix("SLEEP ") {
            let ms: u64 = ms.trim().parse().unwrap_or(0);
            std::thread::sleep(Duration::from_millis(ms));
            return Ok(StatementOutput::Empty);
        }
        if let Some(n) = sql.strip_prefix("ROWS ") {
            let n: i64 = n.trim().parse().unwrap_or(0);
            return Ok(StatementOutput::Rows(ResultSet::new(
                vec!["n".to_string()],
                (0..n).map(|i| vec![SqlValue::Int(i)]).collect(),
            )));
        }
        match sql {
            "FAIL" => return Err(DbError::driver("statement failed", Some("42000".to_string()))),
            "BREAK" => {
                self.broken = true;
                return Err(DbError::driver("connection reset", Some("08006".to_string())));
            }
            "CONNECTION_ID" => {
                return Ok(StatementOutput::Rows(ResultSet::new(
                    vec!["id".to_string()],
                    vec![vec![SqlValue::Int(self.id as i64)]],
                )));
            }
            _ => {}
        }

        self.stats.log.lock().unwrap().push(format!("{}:{}", self.id, sql));
        Ok(match kind {
            StatementKind::Execute => StatementOutput::Empty,
            StatementKind::Query => StatementOutput::Rows(ResultSet::new(
                vec!["sql".to_string()],
                vec![vec![SqlValue::Text(sql.to_string())]],
            )),
            StatementKind::Update => StatementOutput::Updated(1),
            StatementKind::Insert => StatementOutput::Inserted {
                updated: 1,
                keys: vec![SqlValue::Int(
                    self.stats.next_key.fetch_add(1, Ordering::SeqCst) + 1,
                )],
            },
        })
    }
}

impl DriverConnection for ScriptedConnection {
    fn execute(
        &mut self,
        sql: &str,
        _params: &[SqlValue],
        kind: StatementKind,
        _options: &StatementOptions,
    ) -> DbResult<StatementOutput> {
        let now = self.stats.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak_running.fetch_max(now, Ordering::SeqCst);

        let result = self.run(sql, kind);

        self.stats.running.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn set_isolation(&mut self, level: IsolationLevel) -> DbResult<()> {
        self.stats.isolations.lock().unwrap().push(level);
        Ok(())
    }

    fn begin(&mut self) -> DbResult<()> {
        self.stats.begun.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn commit(&mut self) -> DbResult<()> {
        self.stats.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&mut self) -> DbResult<()> {
        self.stats.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_valid(&mut self) -> bool {
        !self.broken
    }

    fn close(self: Box<Self>) -> DbResult<()> {
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn config(max_pool_size: u32) -> PoolConfig {
    PoolConfig::new("jdbc:scripted:test")
        .with_max_pool_size(max_pool_size)
        .with_lease_timeout_ms(2_000)
}

pub fn client(config: PoolConfig) -> (JdbcClient, Arc<Stats>) {
    let (driver, stats) = ScriptedDriver::new();
    let client = JdbcClient::create_exclusive_with_driver(config, driver).unwrap();
    (client, stats)
}

/// Connection id reported by a `CONNECTION_ID` query result.
pub fn connection_id(row: Option<Vec<SqlValue>>) -> i64 {
    row.and_then(|values| values.first().and_then(SqlValue::as_i64))
        .expect("CONNECTION_ID returns one integer")
}
