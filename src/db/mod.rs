//! Database access layer.
//!
//! This module provides:
//! - The blocking driver interface and the bundled SQLite driver
//! - Connection pooling and named pool sharing
//! - Worker dispatch for blocking calls
//! - Statement execution and type mappings
//! - Transaction registry for transactions spanning several calls

pub mod dispatch;
pub mod driver;
pub mod executor;
#[macro_use]
pub mod macros;
pub mod params;
pub mod pool;
pub mod pool_registry;
pub mod sqlite;
pub mod transaction_registry;
pub mod types;

pub use dispatch::{Binding, BoundConnection, Dispatcher};
pub use driver::{DataSource, Driver, DriverConnection, RowSink};
pub use pool::{ConnectionId, ConnectionPool, PoolSettings, PoolStatus, PooledConnection};
pub use pool_registry::{DataSourceHolder, PoolRegistry};
pub use sqlite::SqliteDriver;
pub use transaction_registry::TransactionRegistry;
