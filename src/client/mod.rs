//! The asynchronous SQL facade.
//!
//! [`JdbcClient`] is the public operation surface. Non-transactional calls
//! lease a connection, run one statement and release it, all inside a single
//! worker job, so the connection goes back to the pool on every exit path.
//! Transactional calls are routed through the client's
//! [`TransactionRegistry`] to the connection pinned to the handle.
//!
//! Before a lease, a caller reserves one of the data source's connection
//! slots. Waiting for a slot happens on the async side and holds no worker,
//! so statements on connections that are already leased (commits included)
//! never queue behind callers waiting for a connection.
//!
//! Argument validation (blank SQL, malformed parameters, empty batches) runs
//! when a method is called, not when its future is polled. A rejected call
//! touches neither the pool nor the workers and returns a future that is
//! already resolved with the error. Like every future, it reports nothing
//! until awaited.

mod query;
mod transaction;
mod write;

use crate::config::PoolConfig;
use crate::db::driver::{Driver, resolve_driver};
use crate::db::pool::{PoolStatus, PooledConnection};
use crate::db::pool_registry::{DataSourceHolder, PoolRegistry};
use crate::db::transaction_registry::TransactionRegistry;
use crate::db::DataSource;
use crate::error::{DbError, DbResult};
use crate::models::{Params, Statement, StatementOptions, TxHandle};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::task::JoinHandle;
use tracing::info;

/// How a client holds its data source.
enum Sharing {
    Exclusive,
    Shared {
        name: String,
        registry: Arc<PoolRegistry>,
    },
}

struct ClientInner {
    holder: Arc<DataSourceHolder>,
    sharing: Sharing,
    transactions: Arc<TransactionRegistry>,
    eviction: OnceLock<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    close_lock: tokio::sync::Mutex<()>,
}

/// Asynchronous client over a pooled, blocking SQL driver.
///
/// Cloning is cheap; clones share the pool reference and the transactions.
/// Each clone carries its own [`StatementOptions`].
#[derive(Clone)]
pub struct JdbcClient {
    inner: Arc<ClientInner>,
    options: StatementOptions,
}

impl JdbcClient {
    /// Create a client with a pool of its own, closed by [`JdbcClient::close`].
    ///
    /// Fails with `Config` when connectivity options are missing or invalid,
    /// or no bundled driver serves the URL. No connection is opened here.
    pub fn create_exclusive(config: PoolConfig) -> DbResult<Self> {
        let driver = Self::driver_for(&config)?;
        Self::create_exclusive_with_driver(config, driver)
    }

    /// Like [`JdbcClient::create_exclusive`], with a caller-supplied driver.
    pub fn create_exclusive_with_driver(config: PoolConfig, driver: Arc<dyn Driver>) -> DbResult<Self> {
        let holder = DataSourceHolder::new(None, config, driver)?;
        info!(
            driver = holder.pool().driver_name(),
            "Created exclusive client"
        );
        Ok(Self::from_parts(holder, Sharing::Exclusive))
    }

    /// Create a client on the data source registered as `name` in `registry`.
    ///
    /// `name` falls back to the configured `datasourceName`, then to
    /// `DEFAULT_DS`. When the name is already registered its pool is joined and
    /// `config` is ignored; otherwise a pool is created from `config`.
    pub fn create_shared(
        config: PoolConfig,
        name: Option<&str>,
        registry: &Arc<PoolRegistry>,
    ) -> DbResult<Self> {
        let name = config.datasource_name_or(name).to_string();
        let holder = registry.acquire(&name, || {
            let driver = Self::driver_for(&config)?;
            DataSourceHolder::new(Some(name.clone()), config.clone(), driver)
        })?;
        Ok(Self::shared(holder, name, registry))
    }

    /// Like [`JdbcClient::create_shared`], with a caller-supplied driver used
    /// if the data source has to be created.
    pub fn create_shared_with_driver(
        config: PoolConfig,
        name: Option<&str>,
        registry: &Arc<PoolRegistry>,
        driver: Arc<dyn Driver>,
    ) -> DbResult<Self> {
        let name = config.datasource_name_or(name).to_string();
        let holder = registry.acquire(&name, || {
            DataSourceHolder::new(Some(name.clone()), config.clone(), driver)
        })?;
        Ok(Self::shared(holder, name, registry))
    }

    fn shared(holder: Arc<DataSourceHolder>, name: String, registry: &Arc<PoolRegistry>) -> Self {
        info!(
            datasource = %name,
            ref_count = registry.ref_count(&name),
            "Created shared client"
        );
        Self::from_parts(
            holder,
            Sharing::Shared {
                name,
                registry: Arc::clone(registry),
            },
        )
    }

    fn driver_for(config: &PoolConfig) -> DbResult<Arc<dyn Driver>> {
        config.validate()?;
        resolve_driver(&DataSource::from_config(config)?)
    }

    fn from_parts(holder: Arc<DataSourceHolder>, sharing: Sharing) -> Self {
        let transactions = TransactionRegistry::new(holder.config().transaction_timeout());
        let options = holder.config().statement_options();
        Self {
            options,
            inner: Arc::new(ClientInner {
                holder,
                sharing,
                transactions,
                eviction: OnceLock::new(),
                closed: AtomicBool::new(false),
                close_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Use `options` for statements issued through this handle.
    ///
    /// Starts from `queryTimeoutMs`, `maxRows` and `fetchSize` of the pool
    /// configuration. Other clones keep theirs.
    pub fn with_options(mut self, options: StatementOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &StatementOptions {
        &self.options
    }

    /// Validate one statement and attach this client's options.
    fn statement(&self, sql: impl Into<String>, params: impl Into<Params>) -> DbResult<Statement> {
        Statement::new(sql, params).map(|stmt| stmt.with_options(self.options))
    }

    fn statements(&self, sql: impl Into<String>, param_sets: Vec<Params>) -> DbResult<Vec<Statement>> {
        let stmts = Statement::batch(sql, param_sets)?;
        Ok(stmts
            .into_iter()
            .map(|stmt| stmt.with_options(self.options))
            .collect())
    }

    /// Name of the shared data source, `None` for exclusive clients.
    pub fn datasource_name(&self) -> Option<&str> {
        match &self.inner.sharing {
            Sharing::Exclusive => None,
            Sharing::Shared { name, .. } => Some(name),
        }
    }

    /// Pool occupancy. Shared clients see the pool they share.
    pub fn pool_status(&self) -> PoolStatus {
        self.inner.holder.pool().status()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> DbResult<()> {
        if self.is_closed() {
            return Err(DbError::PoolClosed);
        }
        Ok(())
    }

    /// Reserve a slot, then lease, run `f` and release inside one worker job.
    async fn with_connection<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&mut PooledConnection) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_open()?;
        let holder = &self.inner.holder;
        holder.ensure_initialized().await;
        let slot = holder.reserve().await?;
        let pool = Arc::clone(holder.pool());
        holder
            .dispatcher()
            .run(move || {
                let mut conn = pool.lease()?;
                conn.hold_slot(slot);
                f(&mut conn)
            })
            .await
    }

    /// Run `op` on a freshly leased connection.
    ///
    /// `input` is the already validated request; a validation error is
    /// returned without touching the pool.
    fn pooled<S, T>(
        &self,
        input: DbResult<S>,
        op: fn(&mut PooledConnection, &S) -> DbResult<T>,
    ) -> BoxFuture<'static, DbResult<T>>
    where
        S: Send + 'static,
        T: Send + 'static,
    {
        let client = self.clone();
        async move {
            let input = input?;
            client.with_connection(move |conn| op(conn, &input)).await
        }
        .boxed()
    }

    /// Queue `op` on the connection pinned to `handle`.
    ///
    /// The job is queued before the returned future is first polled, so
    /// calls on one handle run in call order.
    fn transactional<S, T>(
        &self,
        handle: TxHandle,
        input: DbResult<S>,
        op: fn(&mut PooledConnection, &S) -> DbResult<T>,
    ) -> BoxFuture<'static, DbResult<T>>
    where
        S: Send + 'static,
        T: Send + 'static,
    {
        let queued = input.and_then(|input| {
            self.ensure_open()?;
            Ok(self
                .inner
                .transactions
                .statement(handle, move |conn| op(conn, &input)))
        });
        async move { queued?.await }.boxed()
    }

    /// Close the client.
    ///
    /// Rolls back this client's active transactions, then gives up its pool
    /// reference: an exclusive pool is closed, a shared one only when this was
    /// its last client. Closing the pool also gives back connections leased
    /// through [`JdbcClient::connection`]; their open transactions are rolled
    /// back and later calls on them fail with `PoolClosed`. Later calls on the
    /// client fail with `PoolClosed` too. Closing twice is a no-op.
    pub async fn close(&self) -> DbResult<()> {
        let _guard = self.inner.close_lock.lock().await;
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(Some(task)) = self.inner.eviction.get() {
            task.abort();
        }
        let rolled_back = self.inner.transactions.rollback_all().await;

        match &self.inner.sharing {
            Sharing::Exclusive => {
                self.inner.holder.close().await;
                info!(rolled_back = rolled_back, "Exclusive client closed");
            }
            Sharing::Shared { name, registry } => {
                let last = registry.release(name, &self.inner.holder);
                let remaining = registry.ref_count(name);
                if let Some(holder) = last {
                    holder.close().await;
                }
                info!(
                    datasource = %name,
                    remaining = remaining,
                    rolled_back = rolled_back,
                    "Shared client closed"
                );
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for JdbcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JdbcClient")
            .field("datasource", &self.datasource_name())
            .field("pool", &self.pool_status())
            .field("options", &self.options)
            .field("transactions", &self.inner.transactions.count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Start the idle-transaction sweep once, on first use.
fn start_eviction(inner: &ClientInner) {
    inner
        .eviction
        .get_or_init(|| inner.transactions.start_eviction_task());
}
