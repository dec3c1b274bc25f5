//! Row streaming.
//!
//! A streamed query runs on one worker and pushes its rows through a bounded
//! channel in batches of `fetchSize`. The worker blocks while the channel is
//! full, so a slow consumer holds at most a few batches in memory. The
//! connection stays busy until the last row has been read or the
//! [`RowStream`] is dropped.

use crate::db::driver::RowSink;
use crate::error::{DbError, DbResult};
use crate::models::{ResultSet, SqlValue, StatementOptions};
use futures_util::{Stream, TryStreamExt};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::sync::mpsc;

/// Batches in flight between the worker and the consumer.
const CHANNEL_BATCHES: usize = 2;

pub(crate) enum Chunk {
    Columns(Vec<String>),
    Rows(Vec<Vec<SqlValue>>),
    Failed(DbError),
    Done,
}

/// Worker side of a row stream.
///
/// Must only be fed from a blocking worker.
pub struct StreamSink {
    tx: mpsc::Sender<Chunk>,
    batch: Vec<Vec<SqlValue>>,
    fetch_size: usize,
    remaining: Option<u64>,
    sent: u64,
    open: bool,
}

impl StreamSink {
    fn send(&mut self, chunk: Chunk) -> bool {
        if self.open && self.tx.blocking_send(chunk).is_err() {
            self.open = false;
        }
        self.open
    }

    fn flush(&mut self) -> bool {
        if self.batch.is_empty() {
            return self.open;
        }
        let rows = mem::replace(&mut self.batch, Vec::with_capacity(self.fetch_size));
        self.send(Chunk::Rows(rows))
    }

    /// Rows accepted so far.
    pub fn rows_sent(&self) -> u64 {
        self.sent
    }

    /// Deliver buffered rows, then the end marker or the error.
    pub fn finish(mut self, result: DbResult<()>) {
        let delivered = self.flush();
        if delivered {
            match result {
                Ok(()) => self.send(Chunk::Done),
                Err(e) => self.send(Chunk::Failed(e)),
            };
        }
    }
}

impl RowSink for StreamSink {
    fn columns(&mut self, names: &[String]) -> bool {
        self.send(Chunk::Columns(names.to_vec()))
    }

    fn row(&mut self, values: Vec<SqlValue>) -> bool {
        if self.remaining == Some(0) {
            return false;
        }
        self.batch.push(values);
        self.sent += 1;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }
        if self.batch.len() >= self.fetch_size && !self.flush() {
            return false;
        }
        self.remaining != Some(0)
    }
}

/// Consumer side, before the columns have arrived.
pub(crate) struct Opening {
    tx: mpsc::Sender<Chunk>,
    rx: mpsc::Receiver<Chunk>,
    fetch_size: usize,
    max_rows: Option<u64>,
}

impl Opening {
    pub(crate) fn new(options: &StatementOptions) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_BATCHES);
        Self {
            tx,
            rx,
            fetch_size: options.fetch_size_or_default(),
            max_rows: options.max_rows(),
        }
    }

    pub(crate) fn sink(&self) -> StreamSink {
        StreamSink {
            tx: self.tx.clone(),
            batch: Vec::with_capacity(self.fetch_size),
            fetch_size: self.fetch_size,
            remaining: self.max_rows,
            sent: 0,
            open: true,
        }
    }

    /// Drive `job` to completion in the background and wait for the columns.
    ///
    /// An error from `job` itself (no connection, closed pool) is reported
    /// here when it comes before the columns.
    pub(crate) async fn open<F>(self, job: F) -> DbResult<RowStream>
    where
        F: Future<Output = DbResult<()>> + Send + 'static,
    {
        let Opening { tx, mut rx, .. } = self;
        tokio::spawn(async move {
            if let Err(e) = job.await {
                let _ = tx.send(Chunk::Failed(e)).await;
            }
        });

        match rx.recv().await {
            Some(Chunk::Columns(columns)) => Ok(RowStream {
                columns,
                chunks: rx,
                buffered: VecDeque::new(),
                done: false,
            }),
            Some(Chunk::Failed(e)) => Err(e),
            Some(_) | None => Err(DbError::internal("Row stream ended before its columns")),
        }
    }
}

/// Rows of a query, read while the statement is still running.
///
/// Yields one `Vec<SqlValue>` per row in column order. A driver error after
/// the first row ends the stream with that error.
pub struct RowStream {
    columns: Vec<String>,
    chunks: mpsc::Receiver<Chunk>,
    buffered: VecDeque<Vec<SqlValue>>,
    done: bool,
}

impl RowStream {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Index of a column, matched exactly first and then ignoring case.
    pub fn column(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| column == name)
            .or_else(|| {
                self.columns
                    .iter()
                    .position(|column| column.eq_ignore_ascii_case(name))
            })
    }

    /// Read the remaining rows into a [`ResultSet`].
    pub async fn into_result_set(self) -> DbResult<ResultSet> {
        let columns = self.columns.clone();
        let rows = self.try_collect::<Vec<_>>().await?;
        Ok(ResultSet::new(columns, rows))
    }
}

impl Stream for RowStream {
    type Item = DbResult<Vec<SqlValue>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if let Some(row) = this.buffered.pop_front() {
                return Poll::Ready(Some(Ok(row)));
            }
            if this.done {
                return Poll::Ready(None);
            }
            match ready!(this.chunks.poll_recv(cx)) {
                Some(Chunk::Rows(rows)) => this.buffered.extend(rows),
                Some(Chunk::Columns(_)) => {}
                Some(Chunk::Done) => {
                    this.done = true;
                    this.chunks.close();
                }
                Some(Chunk::Failed(e)) => {
                    this.done = true;
                    this.chunks.close();
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    this.done = true;
                    return Poll::Ready(Some(Err(DbError::internal(
                        "Row stream ended before its last row",
                    ))));
                }
            }
        }
    }
}

impl fmt::Debug for RowStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowStream")
            .field("columns", &self.columns)
            .field("buffered", &self.buffered.len())
            .field("done", &self.done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn produce(
        opening: &Opening,
        rows: i64,
        fail_at: Option<i64>,
    ) -> impl Future<Output = DbResult<()>> + Send + use<> {
        let mut sink = opening.sink();
        async move {
            tokio::task::spawn_blocking(move || {
                let mut result = Ok(());
                if sink.columns(&["n".to_string()]) {
                    for n in 0..rows {
                        if fail_at == Some(n) {
                            result = Err(DbError::driver("disk I/O error", None));
                            break;
                        }
                        if !sink.row(vec![SqlValue::Int(n)]) {
                            break;
                        }
                    }
                }
                let sent = sink.rows_sent();
                sink.finish(result);
                sent
            })
            .await
            .map(|_| ())
            .map_err(|e| DbError::internal(e.to_string()))
        }
    }

    #[tokio::test]
    async fn test_rows_arrive_in_order() {
        let options = StatementOptions::default().with_fetch_size(3);
        let opening = Opening::new(&options);
        let job = produce(&opening, 10, None);
        let stream = opening.open(job).await.unwrap();
        assert_eq!(stream.columns(), &["n"]);
        assert_eq!(stream.column("N"), Some(0));

        let rows = stream.into_result_set().await.unwrap();
        let values: Vec<_> = rows.rows.into_iter().map(|row| row[0].clone()).collect();
        assert_eq!(values, (0..10).map(SqlValue::Int).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_max_rows_stops_producer() {
        let options = StatementOptions::default()
            .with_fetch_size(2)
            .with_max_rows(5);
        let opening = Opening::new(&options);
        let job = produce(&opening, 1_000, None);
        let stream = opening.open(job).await.unwrap();
        let rows: Vec<_> = stream.collect().await;
        assert_eq!(rows.len(), 5);
    }

    #[tokio::test]
    async fn test_error_after_rows_ends_stream() {
        let options = StatementOptions::default().with_fetch_size(4);
        let opening = Opening::new(&options);
        let job = produce(&opening, 10, Some(6));
        let mut stream = opening.open(job).await.unwrap();

        let mut ok = 0;
        let mut failure = None;
        while let Some(row) = stream.next().await {
            match row {
                Ok(_) => ok += 1,
                Err(e) => failure = Some(e),
            }
        }
        assert_eq!(ok, 6);
        assert_eq!(failure.unwrap().kind(), "driver");
    }

    #[tokio::test]
    async fn test_job_error_before_columns() {
        let opening = Opening::new(&StatementOptions::default());
        let err = opening
            .open(async { Err(DbError::PoolClosed) })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::PoolClosed));
    }

    #[tokio::test]
    async fn test_dropped_stream_stops_producer() {
        let options = StatementOptions::default().with_fetch_size(1);
        let opening = Opening::new(&options);
        let mut sink = opening.sink();
        let producer = tokio::task::spawn_blocking(move || {
            sink.columns(&["n".to_string()]);
            let mut n = 0;
            while sink.row(vec![SqlValue::Int(n)]) {
                n += 1;
            }
            n
        });
        let mut stream = opening.open(async { Ok(()) }).await.unwrap();
        assert!(stream.next().await.is_some());
        drop(stream);

        let produced = producer.await.unwrap();
        assert!(produced < 10);
    }
}
