//! Read operations.

use super::JdbcClient;
use crate::db::executor;
use crate::error::DbResult;
use crate::models::{Params, ResultSet, SqlValue, TxHandle};
use crate::stream::{Opening, RowStream};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;

impl JdbcClient {
    /// Run a query on a pooled connection and return its rows.
    pub fn query(
        &self,
        sql: impl Into<String>,
        params: impl Into<Params>,
    ) -> BoxFuture<'static, DbResult<ResultSet>> {
        self.pooled(self.statement(sql, params), executor::query)
    }

    /// Run a query and return its first row, if any.
    pub fn query_single(
        &self,
        sql: impl Into<String>,
        params: impl Into<Params>,
    ) -> BoxFuture<'static, DbResult<Option<Vec<SqlValue>>>> {
        self.pooled(self.statement(sql, params), executor::query_single)
    }

    /// Run a query inside the transaction `handle`.
    pub fn query_tx(
        &self,
        handle: TxHandle,
        sql: impl Into<String>,
        params: impl Into<Params>,
    ) -> BoxFuture<'static, DbResult<ResultSet>> {
        self.transactional(handle, self.statement(sql, params), executor::query)
    }

    /// Run a query inside the transaction `handle` and return its first row.
    pub fn query_single_tx(
        &self,
        handle: TxHandle,
        sql: impl Into<String>,
        params: impl Into<Params>,
    ) -> BoxFuture<'static, DbResult<Option<Vec<SqlValue>>>> {
        self.transactional(handle, self.statement(sql, params), executor::query_single)
    }

    /// Run a query on a pooled connection and read its rows as they arrive.
    ///
    /// Resolves once the column names are known. Rows come in batches of
    /// `fetchSize`, `maxRows` caps them, and `queryTimeoutMs` bounds the wait
    /// for the first row. The connection stays leased until the stream ends
    /// or is dropped.
    pub fn query_stream(
        &self,
        sql: impl Into<String>,
        params: impl Into<Params>,
    ) -> BoxFuture<'static, DbResult<RowStream>> {
        let client = self.clone();
        let stmt = self.statement(sql, params);
        async move {
            let stmt = stmt?;
            let opening = Opening::new(&stmt.options);
            let sink = opening.sink();
            opening
                .open(async move {
                    client
                        .with_connection(move |conn| executor::stream(conn, &stmt, sink))
                        .await
                })
                .await
        }
        .boxed()
    }

    /// Stream a query inside the transaction `handle`.
    ///
    /// Later calls on the handle wait until this stream ends or is dropped.
    pub fn query_stream_tx(
        &self,
        handle: TxHandle,
        sql: impl Into<String>,
        params: impl Into<Params>,
    ) -> BoxFuture<'static, DbResult<RowStream>> {
        let queued = self.statement(sql, params).and_then(|stmt| {
            self.ensure_open()?;
            let opening = Opening::new(&stmt.options);
            let sink = opening.sink();
            let job = self
                .inner
                .transactions
                .statement(handle, move |conn| executor::stream(conn, &stmt, sink));
            Ok((opening, job))
        });
        async move {
            let (opening, job) = queued?;
            opening.open(job).await
        }
        .boxed()
    }
}
