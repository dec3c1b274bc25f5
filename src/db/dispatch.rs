//! Worker dispatch.
//!
//! Blocking driver work never runs on an async task. [`Dispatcher::run`] hands
//! a closure to tokio's blocking thread pool, bounded by a semaphore sized
//! independently from the connection pool, and resolves exactly once with the
//! closure's result.
//!
//! [`BoundConnection`] pins one leased connection to an ordered queue: jobs
//! run one at a time, on workers, in the order they were submitted. When the
//! pool closes, the connection is given back and queued jobs fail with
//! `PoolClosed`.

use crate::db::pool::{ConnectionId, ConnectionPool, PooledConnection};
use crate::error::{DbError, DbResult};
use crate::models::TxHandle;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use tracing::{debug, warn};

/// Bounded set of blocking workers.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    permits: Arc<Semaphore>,
    size: usize,
}

impl Dispatcher {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers not running anything right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run a blocking closure on a worker.
    ///
    /// A panic inside `f` is reported as an `Internal` error. If the returned
    /// future is dropped after the closure started, the closure still runs to
    /// completion and its result is discarded.
    pub async fn run<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce() -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| DbError::internal("Worker pool has shut down"))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await
        .map_err(|e| DbError::internal(format!("Worker task failed: {}", e)))?
    }
}

/// Who a bound connection belongs to; decides the error reported once the
/// connection has been given back.
#[derive(Debug, Clone, Copy)]
pub enum Binding {
    Transaction(TxHandle),
    Connection(ConnectionId),
}

impl Binding {
    fn released(&self) -> DbError {
        match self {
            Self::Transaction(handle) => {
                DbError::unknown_transaction(handle, "Transaction is no longer active")
            }
            Self::Connection(id) => {
                DbError::invalid_input(format!("Connection {} has been closed", id))
            }
        }
    }
}

type Job = Box<dyn FnOnce(&mut Option<PooledConnection>) + Send>;

/// A leased connection with its own ordered task queue.
///
/// The queue is driven by a small async task that owns the connection and
/// moves it onto a worker for each job. When every handle is dropped, or
/// `closing` turns `true` between jobs, the connection goes back to the pool
/// (rolling back an open transaction).
#[derive(Clone)]
pub struct BoundConnection {
    jobs: mpsc::UnboundedSender<Job>,
    pool: Arc<ConnectionPool>,
    connection_id: ConnectionId,
    binding: Binding,
}

impl BoundConnection {
    /// Take ownership of `conn` and start its queue. Requires a tokio runtime.
    pub fn spawn(
        conn: PooledConnection,
        dispatcher: Dispatcher,
        closing: watch::Receiver<bool>,
        binding: Binding,
    ) -> Self {
        let connection_id = conn.id();
        let pool = Arc::clone(conn.pool());
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();

        tokio::spawn(async move {
            let mut slot = Some(conn);
            let mut closing = Some(closing);
            loop {
                let job = tokio::select! {
                    job = queue.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                    () = pool_closed(&mut closing) => {
                        closing = None;
                        if let Some(conn) = slot.take() {
                            debug!(connection_id, "Pool closed, giving bound connection back");
                            release(&dispatcher, connection_id, conn).await;
                        }
                        continue;
                    }
                };

                let mut taken = slot.take();
                match dispatcher
                    .run(move || {
                        job(&mut taken);
                        Ok(taken)
                    })
                    .await
                {
                    Ok(back) => slot = back,
                    Err(e) => {
                        // The connection was dropped (and released) with the job
                        warn!(connection_id, error = %e, "Bound connection job failed");
                    }
                }
                if slot.is_none() {
                    closing = None;
                }
            }

            if let Some(conn) = slot {
                debug!(connection_id, "Releasing bound connection");
                release(&dispatcher, connection_id, conn).await;
            }
        });

        Self {
            jobs,
            pool,
            connection_id,
            binding,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Queue `f` against the connection.
    ///
    /// The job is queued before this returns, so the queue order is the call
    /// order; the returned future only waits for the outcome.
    pub fn submit<T, F>(&self, f: F) -> impl Future<Output = DbResult<T>> + Send + use<T, F>
    where
        F: FnOnce(&mut PooledConnection) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue(f, false)
    }

    /// Queue `f`, then give the connection back to the pool.
    ///
    /// The release happens on the worker right after `f`, whatever its
    /// outcome; jobs queued later fail as released.
    pub fn finish<T, F>(&self, f: F) -> impl Future<Output = DbResult<T>> + Send + use<T, F>
    where
        F: FnOnce(&mut PooledConnection) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue(f, true)
    }

    fn enqueue<T, F>(&self, f: F, release: bool) -> impl Future<Output = DbResult<T>> + Send + use<T, F>
    where
        F: FnOnce(&mut PooledConnection) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let binding = self.binding;
        let pool = Arc::clone(&self.pool);
        let (done, outcome) = oneshot::channel();
        let job: Job = Box::new(move |slot: &mut Option<PooledConnection>| {
            let closed = pool.is_closed();
            if closed {
                drop(slot.take());
            }
            let result = match slot.as_mut() {
                Some(conn) => f(conn),
                None if closed => Err(DbError::PoolClosed),
                None => Err(binding.released()),
            };
            if release {
                drop(slot.take());
            }
            let _ = done.send(result);
        });
        let queued = self.jobs.send(job).map_err(|_| {
            if self.pool.is_closed() {
                DbError::PoolClosed
            } else {
                binding.released()
            }
        });

        async move {
            queued?;
            outcome
                .await
                .map_err(|_| DbError::internal("Worker dropped the request"))?
        }
    }
}

/// Resolves once the pool behind a bound connection starts closing.
///
/// Never resolves without a receiver, or once the sender is gone.
async fn pool_closed(closing: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = closing.as_mut() {
        let closed = rx.wait_for(|closed| *closed).await.is_ok();
        if closed {
            return;
        }
    }
    std::future::pending().await
}

/// Drop a connection on a worker, so its rollback and release may block.
async fn release(dispatcher: &Dispatcher, connection_id: ConnectionId, conn: PooledConnection) {
    if let Err(e) = dispatcher
        .run(move || {
            drop(conn);
            Ok(())
        })
        .await
    {
        warn!(connection_id, error = %e, "Releasing bound connection failed");
    }
}

impl std::fmt::Debug for BoundConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundConnection")
            .field("connection_id", &self.connection_id)
            .field("binding", &self.binding)
            .finish()
    }
}
