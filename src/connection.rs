//! A pooled connection held by the caller.
//!
//! [`SqlConnection`] is the lower-level surface: one leased connection whose
//! statements and transaction boundaries are driven directly by the caller.
//! Calls are queued in call order and run one at a time on workers. The
//! connection returns to the pool on [`SqlConnection::close`], or when the
//! last clone is dropped; an open transaction is rolled back either way.
//! Closing the pool it came from gives it back as well.

use crate::db::dispatch::BoundConnection;
use crate::db::executor;
use crate::db::pool::{ConnectionId, PooledConnection};
use crate::error::DbResult;
use crate::models::{IsolationLevel, Params, ResultSet, SqlValue, Statement, StatementOptions};
use crate::stream::{Opening, RowStream};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;

#[derive(Debug, Clone)]
pub struct SqlConnection {
    bound: BoundConnection,
    default_isolation: IsolationLevel,
    options: StatementOptions,
}

impl SqlConnection {
    pub(crate) fn new(bound: BoundConnection, default_isolation: IsolationLevel) -> Self {
        Self {
            bound,
            default_isolation,
            options: StatementOptions::default(),
        }
    }

    /// Use `options` for statements issued through this handle.
    pub fn with_options(mut self, options: StatementOptions) -> Self {
        self.options = options;
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.bound.connection_id()
    }

    fn submit<S, T>(
        &self,
        input: DbResult<S>,
        op: fn(&mut PooledConnection, &S) -> DbResult<T>,
    ) -> BoxFuture<'static, DbResult<T>>
    where
        S: Send + 'static,
        T: Send + 'static,
    {
        let queued = input.map(|input| self.bound.submit(move |conn| op(conn, &input)));
        async move { queued?.await }.boxed()
    }

    fn statement(&self, sql: impl Into<String>, params: impl Into<Params>) -> DbResult<Statement> {
        Statement::new(sql, params).map(|stmt| stmt.with_options(self.options))
    }

    pub fn execute(&self, sql: impl Into<String>) -> BoxFuture<'static, DbResult<()>> {
        self.submit(self.statement(sql, ()), executor::execute)
    }

    pub fn query(
        &self,
        sql: impl Into<String>,
        params: impl Into<Params>,
    ) -> BoxFuture<'static, DbResult<ResultSet>> {
        self.submit(self.statement(sql, params), executor::query)
    }

    pub fn query_single(
        &self,
        sql: impl Into<String>,
        params: impl Into<Params>,
    ) -> BoxFuture<'static, DbResult<Option<Vec<SqlValue>>>> {
        self.submit(self.statement(sql, params), executor::query_single)
    }

    /// Insert and return the generated keys.
    pub fn insert(
        &self,
        sql: impl Into<String>,
        params: impl Into<Params>,
    ) -> BoxFuture<'static, DbResult<Vec<SqlValue>>> {
        self.submit(self.statement(sql, params), executor::insert)
    }

    pub fn update(
        &self,
        sql: impl Into<String>,
        params: impl Into<Params>,
    ) -> BoxFuture<'static, DbResult<u64>> {
        self.submit(self.statement(sql, params), executor::update)
    }

    pub fn delete(
        &self,
        sql: impl Into<String>,
        params: impl Into<Params>,
    ) -> BoxFuture<'static, DbResult<u64>> {
        self.submit(self.statement(sql, params), executor::update)
    }

    pub fn batch(
        &self,
        sql: impl Into<String>,
        param_sets: Vec<Params>,
    ) -> BoxFuture<'static, DbResult<Vec<u64>>> {
        let options = self.options;
        let stmts = Statement::batch(sql, param_sets).map(|stmts| {
            stmts
                .into_iter()
                .map(|stmt| stmt.with_options(options))
                .collect::<Vec<_>>()
        });
        self.submit(stmts, |conn, stmts: &Vec<Statement>| executor::batch(conn, stmts))
    }

    /// Read a query's rows as they arrive.
    ///
    /// Calls made after this one wait until the stream ends or is dropped.
    pub fn query_stream(
        &self,
        sql: impl Into<String>,
        params: impl Into<Params>,
    ) -> BoxFuture<'static, DbResult<RowStream>> {
        let queued = self.statement(sql, params).map(|stmt| {
            let opening = Opening::new(&stmt.options);
            let sink = opening.sink();
            let job = self
                .bound
                .submit(move |conn| executor::stream(conn, &stmt, sink));
            (opening, job)
        });
        async move {
            let (opening, job) = queued?;
            opening.open(job).await
        }
        .boxed()
    }

    /// Leave auto-commit mode. `isolation` defaults to the configured level.
    pub fn begin(&self, isolation: Option<IsolationLevel>) -> BoxFuture<'static, DbResult<()>> {
        let isolation = isolation.unwrap_or(self.default_isolation);
        self.bound.submit(move |conn| conn.begin(isolation)).boxed()
    }

    pub fn commit(&self) -> BoxFuture<'static, DbResult<()>> {
        self.bound.submit(PooledConnection::commit).boxed()
    }

    pub fn rollback(&self) -> BoxFuture<'static, DbResult<()>> {
        self.bound.submit(PooledConnection::rollback).boxed()
    }

    /// Give the connection back to the pool once every queued call has run.
    ///
    /// Other clones fail afterwards.
    pub async fn close(self) -> DbResult<()> {
        self.bound.finish(|_| Ok(())).await
    }
}
