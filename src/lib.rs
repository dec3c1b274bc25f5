//! Async SQL Bridge Library
//!
//! This library exposes a blocking SQL driver through an asynchronous API.
//! Blocking calls run on a bounded worker pool, connections come from a
//! pool that can be shared between clients by name, and transactions that
//! span several calls are pinned to one connection behind an opaque handle.
//!
//! ```no_run
//! use async_sql_bridge::{JdbcClient, PoolConfig, params};
//!
//! # async fn demo() -> async_sql_bridge::DbResult<()> {
//! let client = JdbcClient::create_exclusive(PoolConfig::new("jdbc:sqlite:app.db"))?;
//! client.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v INTEGER)").await?;
//!
//! let tx = client.begin(None).await?;
//! let keys = client.insert_tx(tx, "INSERT INTO t (v) VALUES (?)", params![42]).await?;
//! client.commit(tx).await?;
//!
//! let rows = client.query("SELECT v FROM t WHERE id = ?", params![keys[0].clone()]).await?;
//! assert_eq!(rows.len(), 1);
//! client.close().await
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod models;
pub mod stream;

pub use client::JdbcClient;
pub use config::{Config, PoolConfig};
pub use connection::SqlConnection;
pub use db::{Driver, DriverConnection, PoolRegistry, PoolStatus, SqliteDriver};
pub use error::{DbError, DbResult};
pub use models::{
    IsolationLevel, Params, ResultSet, Row, SqlValue, Statement, StatementOptions,
    TransactionMetadata, TxHandle,
};
pub use stream::RowStream;
