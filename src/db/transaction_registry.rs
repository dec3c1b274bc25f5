//! Transaction registry for transactions that span several calls.
//!
//! Each active transaction owns one leased connection, pinned behind a
//! [`BoundConnection`] so its statements run strictly in submission order.
//! The registry maps handles to those connections. Its lock guards only the
//! map and is never held while a statement runs.
//!
//! Commit and rollback deregister the handle before anything is dispatched,
//! so a second commit or rollback, or a statement issued afterwards, fails
//! with `UnknownTransaction`.

use crate::db::dispatch::BoundConnection;
use crate::db::pool::{ConnectionId, PooledConnection};
use crate::error::{DbError, DbResult};
use crate::models::{IsolationLevel, TransactionMetadata, TransactionOutcome, TxHandle};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Shortest and longest pause between eviction sweeps.
const MIN_CLEANUP_INTERVAL: Duration = Duration::from_millis(10);
const MAX_CLEANUP_INTERVAL: Duration = Duration::from_secs(5);

struct ActiveTransaction {
    connection: BoundConnection,
    isolation: IsolationLevel,
    started_at: DateTime<Utc>,
    last_used: Mutex<Instant>,
}

impl ActiveTransaction {
    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

pub struct TransactionRegistry {
    transactions: Mutex<HashMap<TxHandle, Arc<ActiveTransaction>>>,
    /// Roll back transactions idle for longer than this
    idle_timeout: Option<Duration>,
}

impl TransactionRegistry {
    /// Create a new transaction registry.
    pub fn new(idle_timeout: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            transactions: Mutex::new(HashMap::new()),
            idle_timeout,
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TxHandle, Arc<ActiveTransaction>>> {
        self.transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Start the background sweep that evicts idle transactions.
    ///
    /// Returns `None` when no idle timeout is configured. The task holds only
    /// a weak reference and stops once the registry is dropped.
    pub fn start_eviction_task(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let timeout = self.idle_timeout?;
        let interval = (timeout / 2).clamp(MIN_CLEANUP_INTERVAL, MAX_CLEANUP_INTERVAL);
        let registry: Weak<Self> = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.cleanup_expired().await;
            }
        }))
    }

    /// Register a transaction whose connection is already bound and begun.
    pub fn register(&self, handle: TxHandle, connection: BoundConnection, isolation: IsolationLevel) {
        let connection_id = connection.connection_id();
        let entry = Arc::new(ActiveTransaction {
            connection,
            isolation,
            started_at: Utc::now(),
            last_used: Mutex::new(Instant::now()),
        });
        self.lock().insert(handle, entry);

        info!(
            transaction = %handle,
            connection_id = connection_id,
            isolation = %isolation,
            "Transaction started"
        );
    }

    fn get(&self, handle: TxHandle) -> DbResult<Arc<ActiveTransaction>> {
        self.lock()
            .get(&handle)
            .cloned()
            .ok_or_else(|| DbError::unknown_transaction(handle, "Transaction not found"))
    }

    /// Connection pinned to `handle`.
    pub fn connection_id(&self, handle: TxHandle) -> DbResult<ConnectionId> {
        self.get(handle).map(|entry| entry.connection.connection_id())
    }

    /// Queue a statement on the transaction's connection.
    ///
    /// The lookup and the enqueue happen before this returns. The outcome of
    /// the statement never changes the transaction's state.
    pub fn statement<T, F>(&self, handle: TxHandle, f: F) -> impl Future<Output = DbResult<T>> + Send + use<T, F>
    where
        F: FnOnce(&mut PooledConnection) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let queued = self.get(handle).map(|entry| {
            entry.touch();
            let tracked = Arc::clone(&entry);
            entry.connection.submit(move |conn| {
                let result = f(conn);
                tracked.touch();
                result
            })
        });

        async move { queued?.await }
    }

    /// Commit and release the transaction's connection.
    pub async fn commit(&self, handle: TxHandle) -> DbResult<()> {
        self.finish(handle, TransactionOutcome::Committed).await
    }

    /// Roll back and release the transaction's connection.
    pub async fn rollback(&self, handle: TxHandle) -> DbResult<()> {
        self.finish(handle, TransactionOutcome::RolledBack).await
    }

    async fn finish(&self, handle: TxHandle, outcome: TransactionOutcome) -> DbResult<()> {
        let entry = self
            .lock()
            .remove(&handle)
            .ok_or_else(|| DbError::unknown_transaction(handle, "Transaction not found"))?;
        Self::end(handle, entry, outcome).await
    }

    async fn end(handle: TxHandle, entry: Arc<ActiveTransaction>, outcome: TransactionOutcome) -> DbResult<()> {
        let connection_id = entry.connection.connection_id();
        let result = if outcome.commits() {
            entry.connection.finish(PooledConnection::commit).await
        } else {
            entry.connection.finish(PooledConnection::rollback).await
        };

        match &result {
            Ok(()) => info!(
                transaction = %handle,
                connection_id = connection_id,
                outcome = %outcome,
                "Transaction finished"
            ),
            Err(e) => warn!(
                transaction = %handle,
                connection_id = connection_id,
                outcome = %outcome,
                error = %e,
                "Transaction finished with error"
            ),
        }
        result
    }

    /// List all active transactions with their metadata.
    pub fn list_all(&self) -> Vec<TransactionMetadata> {
        self.lock()
            .iter()
            .map(|(handle, entry)| TransactionMetadata {
                handle: *handle,
                connection_id: entry.connection.connection_id(),
                isolation: entry.isolation,
                started_at: entry.started_at,
                idle_secs: entry.idle_for().as_secs(),
            })
            .collect()
    }

    /// Roll back transactions idle past the timeout. Returns how many.
    pub async fn cleanup_expired(&self) -> usize {
        let Some(timeout) = self.idle_timeout else {
            return 0;
        };
        let expired: Vec<(TxHandle, Arc<ActiveTransaction>)> = {
            let mut txs = self.lock();
            let handles: Vec<TxHandle> = txs
                .iter()
                .filter(|(_, entry)| entry.idle_for() > timeout)
                .map(|(handle, _)| *handle)
                .collect();
            handles
                .into_iter()
                .filter_map(|handle| txs.remove(&handle).map(|entry| (handle, entry)))
                .collect()
        };

        let count = expired.len();
        for (handle, entry) in expired {
            warn!(
                transaction = %handle,
                connection_id = entry.connection.connection_id(),
                idle_ms = entry.idle_for().as_millis() as u64,
                "Rolling back idle transaction"
            );
            // Best effort: the handle is gone either way
            let _ = Self::end(handle, entry, TransactionOutcome::TimedOut).await;
        }
        count
    }

    /// Roll back every active transaction. Returns how many.
    pub async fn rollback_all(&self) -> usize {
        let drained: Vec<(TxHandle, Arc<ActiveTransaction>)> = self.lock().drain().collect();
        let count = drained.len();
        for (handle, entry) in drained {
            let _ = Self::end(handle, entry, TransactionOutcome::RolledBack).await;
        }
        if count > 0 {
            debug!(count = count, "Rolled back remaining transactions");
        }
        count
    }

    /// Get the number of active transactions.
    pub fn count(&self) -> usize {
        self.lock().len()
    }
}

impl std::fmt::Debug for TransactionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionRegistry")
            .field("active", &self.count())
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}
