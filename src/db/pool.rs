//! Bounded connection pool.
//!
//! The pool owns at most `max_size` physical connections. Each one is either
//! idle (parked in the pool) or leased (owned by exactly one
//! [`PooledConnection`]). Pool state lives behind a single mutex that is only
//! held for bookkeeping; opening, validating and closing connections happen
//! outside it.
//!
//! `lease` blocks. It must only be called from a worker (see
//! [`Dispatcher`](crate::db::dispatch::Dispatcher)), never from an async task.

use crate::db::driver::{DataSource, Driver, DriverConnection, RowSink};
use crate::error::{DbError, DbResult};
use crate::models::{IsolationLevel, SqlValue, StatementKind, StatementOptions, StatementOutput};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};

/// Pool-assigned connection identity, stable for the connection's lifetime.
pub type ConnectionId = u64;

/// Sizing and leasing behavior of a pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_size: u32,
    pub lease_timeout: Duration,
    pub test_on_lease: bool,
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub max_size: u32,
    /// Open connections, idle and leased
    pub size: u32,
    pub idle: u32,
    pub leased: u32,
    pub closed: bool,
}

struct IdleConnection {
    id: ConnectionId,
    conn: Box<dyn DriverConnection>,
    isolation: Option<IsolationLevel>,
}

struct PoolState {
    idle: VecDeque<IdleConnection>,
    /// Idle + leased + being opened
    size: u32,
    closed: bool,
    next_id: ConnectionId,
}

pub struct ConnectionPool {
    driver: Arc<dyn Driver>,
    source: DataSource,
    settings: PoolSettings,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl ConnectionPool {
    /// Create an empty pool. No connection is opened here.
    pub fn new(driver: Arc<dyn Driver>, source: DataSource, settings: PoolSettings) -> Arc<Self> {
        info!(
            driver = driver.name(),
            url = %source.url,
            max_size = settings.max_size,
            lease_timeout_ms = settings.lease_timeout.as_millis() as u64,
            "Connection pool created"
        );
        Arc::new(Self {
            driver,
            source,
            settings,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                size: 0,
                closed: false,
                next_id: 1,
            }),
            available: Condvar::new(),
        })
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn driver_name(&self) -> &str {
        self.driver.name()
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lease a connection, waiting up to the configured lease timeout.
    pub fn lease(self: &Arc<Self>) -> DbResult<PooledConnection> {
        self.lease_timeout(self.settings.lease_timeout)
    }

    /// Lease a connection, waiting at most `timeout`.
    ///
    /// Prefers an idle connection, then grows the pool below its cap, then
    /// waits for a release. Fails with `PoolExhausted` once `timeout` has
    /// passed and with `PoolClosed` if the pool is closed meanwhile.
    pub fn lease_timeout(self: &Arc<Self>, timeout: Duration) -> DbResult<PooledConnection> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut state = self.lock();

        loop {
            if state.closed {
                return Err(DbError::PoolClosed);
            }

            if let Some(idle) = state.idle.pop_front() {
                drop(state);
                match self.check_idle(idle) {
                    Some(conn) => return Ok(conn),
                    None => {
                        state = self.lock();
                        continue;
                    }
                }
            }

            if state.size < self.settings.max_size {
                state.size += 1;
                let id = state.next_id;
                state.next_id += 1;
                drop(state);
                return self.open_reserved(id);
            }

            let now = Instant::now();
            if now >= deadline {
                let waited_ms = started.elapsed().as_millis() as u64;
                debug!(
                    max_size = self.settings.max_size,
                    waited_ms = waited_ms,
                    "Lease timed out"
                );
                return Err(DbError::pool_exhausted(self.settings.max_size, waited_ms));
            }
            state = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Validate an idle connection before lending it. Discards it when broken.
    fn check_idle(self: &Arc<Self>, mut idle: IdleConnection) -> Option<PooledConnection> {
        if self.settings.test_on_lease && !idle.conn.is_valid() {
            warn!(
                connection_id = idle.id,
                "Discarding broken idle connection"
            );
            self.discard(idle.id, idle.conn);
            return None;
        }
        debug!(connection_id = idle.id, "Connection leased");
        Some(PooledConnection::new(
            idle.id,
            idle.conn,
            idle.isolation,
            Arc::clone(self),
        ))
    }

    /// Open a connection for a slot already counted in `size`.
    fn open_reserved(self: &Arc<Self>, id: ConnectionId) -> DbResult<PooledConnection> {
        let conn = match self.driver.open(&self.source) {
            Ok(conn) => conn,
            Err(e) => {
                self.lock().size -= 1;
                self.available.notify_one();
                warn!(error = %e, "Failed to open connection");
                return Err(e);
            }
        };

        if self.lock().closed {
            self.discard(id, conn);
            return Err(DbError::PoolClosed);
        }

        debug!(connection_id = id, "Opened new connection");
        Ok(PooledConnection::new(id, conn, None, Arc::clone(self)))
    }

    /// Close a connection and give its slot back.
    fn discard(&self, id: ConnectionId, conn: Box<dyn DriverConnection>) {
        {
            let mut state = self.lock();
            state.size -= 1;
        }
        self.available.notify_one();
        if let Err(e) = conn.close() {
            debug!(connection_id = id, error = %e, "Error closing connection");
        }
    }

    /// Take back a leased connection.
    fn release(&self, id: ConnectionId, conn: Box<dyn DriverConnection>, isolation: Option<IsolationLevel>) {
        let mut state = self.lock();
        if state.closed {
            drop(state);
            self.discard(id, conn);
            debug!(connection_id = id, "Connection closed on release (pool closed)");
            return;
        }
        state.idle.push_back(IdleConnection {
            id,
            conn,
            isolation,
        });
        drop(state);
        self.available.notify_one();
        debug!(connection_id = id, "Connection released");
    }

    /// Open connections until `count` exist. Returns how many were opened.
    pub fn prefill(&self, count: u32) -> DbResult<u32> {
        let target = count.min(self.settings.max_size);
        let mut opened = 0;
        loop {
            let id = {
                let mut state = self.lock();
                if state.closed || state.size >= target {
                    break;
                }
                state.size += 1;
                let id = state.next_id;
                state.next_id += 1;
                id
            };
            match self.driver.open(&self.source) {
                Ok(conn) => {
                    self.release(id, conn, None);
                    opened += 1;
                }
                Err(e) => {
                    self.lock().size -= 1;
                    self.available.notify_one();
                    return Err(e);
                }
            }
        }
        Ok(opened)
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.lock();
        let idle = state.idle.len() as u32;
        PoolStatus {
            max_size: self.settings.max_size,
            size: state.size,
            idle,
            leased: state.size - idle,
            closed: state.closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Close the pool.
    ///
    /// Idle connections are closed now; leased ones are closed when their
    /// holder releases them. Waiting and future leases fail with `PoolClosed`.
    pub fn close(&self) {
        let drained: Vec<IdleConnection> = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.size -= state.idle.len() as u32;
            state.idle.drain(..).collect()
        };
        self.available.notify_all();

        let count = drained.len();
        for idle in drained {
            if let Err(e) = idle.conn.close() {
                debug!(connection_id = idle.id, error = %e, "Error closing connection");
            }
        }
        info!(
            url = %self.source.url,
            closed_idle = count,
            "Connection pool closed"
        );
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("driver", &self.driver.name())
            .field("source", &self.source)
            .field("status", &self.status())
            .finish()
    }
}

/// A leased connection. Dropping it returns the connection to its pool.
///
/// Release rolls back a transaction still open on the connection, and
/// discards the connection instead of parking it when a driver call failed
/// and the session no longer validates.
pub struct PooledConnection {
    id: ConnectionId,
    conn: Option<Box<dyn DriverConnection>>,
    pool: Arc<ConnectionPool>,
    isolation: Option<IsolationLevel>,
    in_transaction: bool,
    /// Set after a failed driver call; forces validation on release
    suspect: bool,
    /// Client-side slot reservation, given back after the connection is
    slot: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    fn new(
        id: ConnectionId,
        conn: Box<dyn DriverConnection>,
        isolation: Option<IsolationLevel>,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        Self {
            id,
            conn: Some(conn),
            pool,
            isolation,
            in_transaction: false,
            suspect: false,
            slot: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Pool this connection returns to.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Keep `permit` until the connection is back in the pool.
    pub fn hold_slot(&mut self, permit: OwnedSemaphorePermit) {
        self.slot = Some(permit);
    }

    /// Isolation last applied to this connection, if any.
    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.isolation
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn driver(&mut self) -> DbResult<&mut Box<dyn DriverConnection>> {
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::internal("Connection already returned to the pool"))
    }

    /// Record a failed driver call so release re-validates the session.
    fn track<T>(&mut self, result: DbResult<T>) -> DbResult<T> {
        if matches!(result, Err(DbError::Driver { .. })) {
            self.suspect = true;
        }
        result
    }

    /// Run one statement on the underlying driver connection.
    pub fn execute(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        kind: StatementKind,
        options: &StatementOptions,
    ) -> DbResult<StatementOutput> {
        let result = self.driver()?.execute(sql, params, kind, options);
        self.track(result)
    }

    /// Run a query, handing rows to `sink` as the driver reads them.
    pub fn stream(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        options: &StatementOptions,
        sink: &mut dyn RowSink,
    ) -> DbResult<()> {
        let result = self.driver()?.stream(sql, params, options, sink);
        self.track(result)
    }

    /// Apply `isolation` and leave auto-commit mode.
    pub fn begin(&mut self, isolation: IsolationLevel) -> DbResult<()> {
        if self.in_transaction {
            return Err(DbError::invalid_input(
                "A transaction is already active on this connection",
            ));
        }
        if isolation != IsolationLevel::None && self.isolation != Some(isolation) {
            let result = self.driver()?.set_isolation(isolation);
            self.track(result)?;
            self.isolation = Some(isolation);
        }
        let result = self.driver()?.begin();
        self.track(result)?;
        self.in_transaction = true;
        Ok(())
    }

    pub fn commit(&mut self) -> DbResult<()> {
        if !self.in_transaction {
            return Err(DbError::invalid_input("No active transaction to commit"));
        }
        let result = self.driver()?.commit();
        self.track(result)?;
        self.in_transaction = false;
        Ok(())
    }

    pub fn rollback(&mut self) -> DbResult<()> {
        if !self.in_transaction {
            return Err(DbError::invalid_input("No active transaction to roll back"));
        }
        let result = self.driver()?.rollback();
        self.in_transaction = false;
        self.track(result)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };

        if self.in_transaction {
            warn!(
                connection_id = self.id,
                "Rolling back transaction left open on release"
            );
            if let Err(e) = conn.rollback() {
                warn!(connection_id = self.id, error = %e, "Rollback on release failed");
                self.suspect = true;
            }
        }

        if self.suspect && !conn.is_valid() {
            warn!(
                connection_id = self.id,
                "Discarding broken connection"
            );
            self.pool.discard(self.id, conn);
            return;
        }

        self.pool.release(self.id, conn, self.isolation);
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("isolation", &self.isolation)
            .field("in_transaction", &self.in_transaction)
            .field("suspect", &self.suspect)
            .field("holds_slot", &self.slot.is_some())
            .finish()
    }
}
