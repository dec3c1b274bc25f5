//! Named data sources shared between clients.
//!
//! A [`DataSourceHolder`] bundles everything one data source needs: its
//! connection pool, its worker dispatcher, the slots callers reserve before
//! taking a worker, and the settings it was created with. Exclusive clients own a holder outright; shared clients find theirs
//! in a [`PoolRegistry`] by name, with a reference count per name.
//!
//! The registry is an ordinary value passed to constructors. Processes that
//! want one global registry create it once and hand out clones of the `Arc`.

use crate::config::PoolConfig;
use crate::db::dispatch::Dispatcher;
use crate::db::driver::{DataSource, Driver};
use crate::db::pool::{ConnectionPool, PoolSettings};
use crate::error::{DbError, DbResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore, watch};
use tracing::{debug, info, warn};

/// Pool, workers and settings of one data source.
pub struct DataSourceHolder {
    name: Option<String>,
    config: PoolConfig,
    pool: Arc<ConnectionPool>,
    dispatcher: Dispatcher,
    /// One permit per pooled connection a caller may hold
    slots: Arc<Semaphore>,
    /// Flipped once on close; bound connections give their session back
    closing: watch::Sender<bool>,
    initialized: OnceCell<()>,
}

impl DataSourceHolder {
    /// Build a holder. Validates `config`; opens no connection.
    pub fn new(
        name: Option<String>,
        config: PoolConfig,
        driver: Arc<dyn Driver>,
    ) -> DbResult<Arc<Self>> {
        config.validate()?;
        let source = DataSource::from_config(&config)?;
        let settings = PoolSettings {
            max_size: config.max_pool_size_or_default(),
            lease_timeout: config.lease_timeout_or_default(),
            test_on_lease: config.test_on_lease_or_default(),
        };
        let slots = Arc::new(Semaphore::new(settings.max_size as usize));
        let pool = ConnectionPool::new(driver, source, settings);
        let dispatcher = Dispatcher::new(config.worker_pool_size_or_default());
        let (closing, _) = watch::channel(false);

        Ok(Arc::new(Self {
            name,
            config,
            pool,
            dispatcher,
            slots,
            closing,
            initialized: OnceCell::new(),
        }))
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Reserve room for one leased connection, waiting up to `leaseTimeout`.
    ///
    /// Callers wait here, on the async side, and take a worker only once a
    /// connection is sure to be free. Jobs on already leased connections
    /// never queue behind them. The permit travels with the lease via
    /// [`PooledConnection::hold_slot`](crate::db::PooledConnection::hold_slot).
    pub async fn reserve(&self) -> DbResult<OwnedSemaphorePermit> {
        let started = Instant::now();
        let timeout = self.config.lease_timeout_or_default();
        match tokio::time::timeout(timeout, Arc::clone(&self.slots).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(DbError::PoolClosed),
            Err(_) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                debug!(
                    datasource = self.name.as_deref().unwrap_or("<exclusive>"),
                    waited_ms = waited_ms,
                    "No connection slot within lease timeout"
                );
                Err(DbError::pool_exhausted(self.pool.settings().max_size, waited_ms))
            }
        }
    }

    /// Slots not reserved right now.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Receiver that turns `true` once [`DataSourceHolder::close`] runs.
    pub fn closing(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }

    /// Open `initialPoolSize` connections the first time any caller gets here.
    ///
    /// Concurrent callers wait for the one fill in progress. A failed fill is
    /// logged, not retried; leases surface the underlying problem.
    pub async fn ensure_initialized(&self) {
        self.initialized
            .get_or_init(|| async {
                let initial = self.config.initial_pool_size_or_default();
                if initial == 0 {
                    return;
                }
                let pool = Arc::clone(&self.pool);
                match self.dispatcher.run(move || pool.prefill(initial)).await {
                    Ok(opened) => info!(
                        datasource = self.name.as_deref().unwrap_or("<exclusive>"),
                        opened = opened,
                        "Initial connections opened"
                    ),
                    Err(e) => warn!(
                        datasource = self.name.as_deref().unwrap_or("<exclusive>"),
                        error = %e,
                        "Failed to open initial connections"
                    ),
                }
            })
            .await;
    }

    /// Close the pool. Idle connections are closed on a blocking thread.
    ///
    /// Slot waiters fail with `PoolClosed`. Bound connections are told to
    /// give their session back; this waits for them up to `leaseTimeout`.
    pub async fn close(&self) {
        self.slots.close();
        let pool = Arc::clone(&self.pool);
        if let Err(e) = tokio::task::spawn_blocking(move || pool.close()).await {
            warn!(error = %e, "Closing connection pool failed");
        }

        self.closing.send_replace(true);
        let timeout = self.config.lease_timeout_or_default();
        if tokio::time::timeout(timeout, self.closing.closed()).await.is_err() {
            warn!(
                datasource = self.name.as_deref().unwrap_or("<exclusive>"),
                bound = self.closing.receiver_count(),
                "Bound connections still busy after close"
            );
        }
    }
}

impl std::fmt::Debug for DataSourceHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSourceHolder")
            .field("name", &self.name)
            .field("pool", &self.pool)
            .field("workers", &self.dispatcher.size())
            .field("free_slots", &self.slots.available_permits())
            .finish()
    }
}

struct RegistryEntry {
    holder: Arc<DataSourceHolder>,
    ref_count: usize,
}

/// Reference-counted data sources, keyed by name.
#[derive(Default)]
pub struct PoolRegistry {
    entries: Mutex<HashMap<String, RegistryEntry>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RegistryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join the data source registered under `name`, or register one built by
    /// `create`.
    ///
    /// Lookup and registration happen under one lock, so concurrent first
    /// callers agree on a single holder. `create` must not block.
    pub fn acquire<F>(&self, name: &str, create: F) -> DbResult<Arc<DataSourceHolder>>
    where
        F: FnOnce() -> DbResult<Arc<DataSourceHolder>>,
    {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(name) {
            entry.ref_count += 1;
            debug!(
                datasource = name,
                ref_count = entry.ref_count,
                "Joined shared data source"
            );
            return Ok(Arc::clone(&entry.holder));
        }

        let holder = create()?;
        entries.insert(
            name.to_string(),
            RegistryEntry {
                holder: Arc::clone(&holder),
                ref_count: 1,
            },
        );
        info!(datasource = name, "Registered shared data source");
        Ok(holder)
    }

    /// Drop one reference to `name`.
    ///
    /// Returns the holder when this was the last reference; the caller closes
    /// it outside the registry lock.
    pub fn release(&self, name: &str, holder: &Arc<DataSourceHolder>) -> Option<Arc<DataSourceHolder>> {
        let mut entries = self.lock();
        let entry = entries.get_mut(name)?;
        if !Arc::ptr_eq(&entry.holder, holder) {
            return None;
        }
        entry.ref_count -= 1;
        debug!(
            datasource = name,
            ref_count = entry.ref_count,
            "Released shared data source"
        );
        if entry.ref_count > 0 {
            return None;
        }
        entries.remove(name).map(|entry| entry.holder)
    }

    /// Current reference count of `name` (0 when not registered).
    pub fn ref_count(&self, name: &str) -> usize {
        self.lock().get(name).map_or(0, |entry| entry.ref_count)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Number of registered data sources.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.lock();
        let mut map = f.debug_map();
        for (name, entry) in entries.iter() {
            map.entry(name, &entry.ref_count);
        }
        map.finish()
    }
}
