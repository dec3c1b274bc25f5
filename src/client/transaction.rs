//! Transactions and dedicated connections.

use super::{JdbcClient, start_eviction};
use crate::connection::SqlConnection;
use crate::db::dispatch::{Binding, BoundConnection};
use crate::db::pool::ConnectionId;
use crate::error::{DbError, DbResult};
use crate::models::{IsolationLevel, TransactionMetadata, TxHandle};
use std::sync::Arc;
use tracing::debug;

impl JdbcClient {
    /// Start a transaction on a connection of its own.
    ///
    /// `isolation` defaults to the configured level. The returned handle
    /// routes every `*_tx` call to the same connection until
    /// [`JdbcClient::commit`] or [`JdbcClient::rollback`].
    pub async fn begin(&self, isolation: Option<IsolationLevel>) -> DbResult<TxHandle> {
        self.ensure_open()?;
        start_eviction(&self.inner);

        let holder = &self.inner.holder;
        let isolation = isolation.unwrap_or_else(|| holder.config().isolation_or_default());
        holder.ensure_initialized().await;

        let slot = holder.reserve().await?;
        let pool = Arc::clone(holder.pool());
        let conn = holder
            .dispatcher()
            .run(move || {
                let mut conn = pool.lease()?;
                conn.hold_slot(slot);
                conn.begin(isolation)?;
                Ok(conn)
            })
            .await?;

        let handle = TxHandle::new();
        let bound = BoundConnection::spawn(
            conn,
            holder.dispatcher().clone(),
            holder.closing(),
            Binding::Transaction(handle),
        );
        self.inner.transactions.register(handle, bound, isolation);

        if self.is_closed() {
            // close() may have drained the registry before the entry landed
            let _ = self.inner.transactions.rollback(handle).await;
            return Err(DbError::PoolClosed);
        }
        Ok(handle)
    }

    /// Commit the transaction and give its connection back to the pool.
    ///
    /// The handle is retired before the commit runs: whatever the outcome,
    /// later calls with it fail with `UnknownTransaction`.
    pub async fn commit(&self, handle: TxHandle) -> DbResult<()> {
        self.ensure_open()?;
        self.inner.transactions.commit(handle).await
    }

    /// Roll back the transaction and give its connection back to the pool.
    pub async fn rollback(&self, handle: TxHandle) -> DbResult<()> {
        self.ensure_open()?;
        self.inner.transactions.rollback(handle).await
    }

    /// Active transactions of this client.
    pub fn transactions(&self) -> Vec<TransactionMetadata> {
        self.inner.transactions.list_all()
    }

    /// Identity of the connection pinned to `handle`.
    pub fn transaction_connection_id(&self, handle: TxHandle) -> DbResult<ConnectionId> {
        self.inner.transactions.connection_id(handle)
    }

    /// Lease a connection for exclusive use by the caller.
    ///
    /// The connection stays out of the pool until [`SqlConnection::close`],
    /// until the last handle to it is dropped, or until the pool is closed.
    /// Statements run with this client's statement options.
    pub async fn connection(&self) -> DbResult<SqlConnection> {
        self.ensure_open()?;
        let holder = &self.inner.holder;
        holder.ensure_initialized().await;

        let slot = holder.reserve().await?;
        let pool = Arc::clone(holder.pool());
        let conn = holder
            .dispatcher()
            .run(move || {
                let mut conn = pool.lease()?;
                conn.hold_slot(slot);
                Ok(conn)
            })
            .await?;
        let id = conn.id();
        debug!(connection_id = id, "Leased dedicated connection");

        let bound = BoundConnection::spawn(
            conn,
            holder.dispatcher().clone(),
            holder.closing(),
            Binding::Connection(id),
        );
        Ok(SqlConnection::new(bound, holder.config().isolation_or_default())
            .with_options(self.options))
    }
}
