//! Statements that change data or schema.

use super::JdbcClient;
use crate::db::executor;
use crate::db::pool::PooledConnection;
use crate::error::DbResult;
use crate::models::{Params, SqlValue, Statement, TxHandle};
use futures_util::future::BoxFuture;

fn batch(conn: &mut PooledConnection, stmts: &Vec<Statement>) -> DbResult<Vec<u64>> {
    executor::batch(conn, stmts)
}

impl JdbcClient {
    /// Execute a statement (typically DDL) and discard its result.
    pub fn execute(&self, sql: impl Into<String>) -> BoxFuture<'static, DbResult<()>> {
        self.pooled(self.statement(sql, ()), executor::execute)
    }

    /// Execute a statement inside the transaction `handle`.
    pub fn execute_tx(
        &self,
        handle: TxHandle,
        sql: impl Into<String>,
    ) -> BoxFuture<'static, DbResult<()>> {
        self.transactional(handle, self.statement(sql, ()), executor::execute)
    }

    /// Insert and return the generated keys; empty when the statement
    /// produces none.
    pub fn insert(
        &self,
        sql: impl Into<String>,
        params: impl Into<Params>,
    ) -> BoxFuture<'static, DbResult<Vec<SqlValue>>> {
        self.pooled(self.statement(sql, params), executor::insert)
    }

    pub fn insert_tx(
        &self,
        handle: TxHandle,
        sql: impl Into<String>,
        params: impl Into<Params>,
    ) -> BoxFuture<'static, DbResult<Vec<SqlValue>>> {
        self.transactional(handle, self.statement(sql, params), executor::insert)
    }

    /// Run an UPDATE and return the number of affected rows.
    pub fn update(
        &self,
        sql: impl Into<String>,
        params: impl Into<Params>,
    ) -> BoxFuture<'static, DbResult<u64>> {
        self.pooled(self.statement(sql, params), executor::update)
    }

    pub fn update_tx(
        &self,
        handle: TxHandle,
        sql: impl Into<String>,
        params: impl Into<Params>,
    ) -> BoxFuture<'static, DbResult<u64>> {
        self.transactional(handle, self.statement(sql, params), executor::update)
    }

    /// Run a DELETE and return the number of affected rows.
    pub fn delete(
        &self,
        sql: impl Into<String>,
        params: impl Into<Params>,
    ) -> BoxFuture<'static, DbResult<u64>> {
        self.pooled(self.statement(sql, params), executor::update)
    }

    pub fn delete_tx(
        &self,
        handle: TxHandle,
        sql: impl Into<String>,
        params: impl Into<Params>,
    ) -> BoxFuture<'static, DbResult<u64>> {
        self.transactional(handle, self.statement(sql, params), executor::update)
    }

    /// Run one statement once per parameter set, in order, on one connection.
    ///
    /// Returns the affected-row count of each run. The first failure aborts
    /// the batch; runs already done are not undone outside a transaction.
    pub fn batch(
        &self,
        sql: impl Into<String>,
        param_sets: Vec<Params>,
    ) -> BoxFuture<'static, DbResult<Vec<u64>>> {
        self.pooled(self.statements(sql, param_sets), batch)
    }

    pub fn batch_tx(
        &self,
        handle: TxHandle,
        sql: impl Into<String>,
        param_sets: Vec<Params>,
    ) -> BoxFuture<'static, DbResult<Vec<u64>>> {
        self.transactional(handle, self.statements(sql, param_sets), batch)
    }
}
