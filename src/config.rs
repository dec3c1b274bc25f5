//! Configuration handling for the SQL bridge.
//!
//! [`PoolConfig`] is the options object a client is created from. It is read
//! from JSON (camelCase keys, with the older snake_case spellings accepted as
//! aliases) and validated before any pool exists. [`Config`] is the command
//! line of the `sql-bridge` binary.

use crate::db::driver::DataSource;
use crate::error::{DbError, DbResult};
use crate::models::{IsolationLevel, StatementOptions};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::time::Duration;

// Pool configuration defaults
pub const DEFAULT_MAX_POOL_SIZE: u32 = 15;
pub const DEFAULT_INITIAL_POOL_SIZE: u32 = 0;
pub const DEFAULT_LEASE_TIMEOUT_MS: u64 = 30_000;

/// Name under which shared clients without an explicit name are registered.
pub const DEFAULT_DATASOURCE_NAME: &str = "DEFAULT_DS";

/// Connection pool and data-source options.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Connection URL, e.g. `jdbc:sqlite:app.db`
    #[serde(alias = "url")]
    pub jdbc_url: Option<String>,
    #[serde(alias = "user")]
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Driver identifier; inferred from the URL when absent
    #[serde(alias = "driver_class", alias = "driver")]
    pub driver_class_name: Option<String>,
    /// Upper bound on physical connections (default: 15)
    #[serde(alias = "max_pool_size")]
    pub max_pool_size: Option<u32>,
    /// Connections opened on first use (default: 0)
    #[serde(alias = "initial_pool_size")]
    pub initial_pool_size: Option<u32>,
    /// How long a lease waits for a free connection (default: 30000)
    #[serde(alias = "lease_timeout_ms")]
    pub lease_timeout_ms: Option<u64>,
    /// Isolation applied by `begin` when the caller does not pick one
    pub isolation: Option<IsolationLevel>,
    /// Blocking worker count (default: twice the pool size)
    #[serde(alias = "worker_pool_size")]
    pub worker_pool_size: Option<usize>,
    /// Roll back transactions idle for longer than this (default: never)
    #[serde(alias = "transaction_timeout_ms")]
    pub transaction_timeout_ms: Option<u64>,
    /// Check idle connections before lending them (default: true)
    #[serde(alias = "test_on_lease")]
    pub test_on_lease: Option<bool>,
    /// Default name for shared clients
    #[serde(alias = "datasource_name")]
    pub datasource_name: Option<String>,
    /// Cancel statements running longer than this (default: never)
    #[serde(alias = "query_timeout_ms")]
    pub query_timeout_ms: Option<u64>,
    /// Cap on rows a query returns (default: unlimited)
    #[serde(alias = "max_rows")]
    pub max_rows: Option<u64>,
    /// Rows per batch handed to a row stream (default: 128)
    #[serde(alias = "fetch_size")]
    pub fetch_size: Option<usize>,
}

impl PoolConfig {
    /// Configuration with only a URL set.
    pub fn new(jdbc_url: impl Into<String>) -> Self {
        Self {
            jdbc_url: Some(jdbc_url.into()),
            ..Self::default()
        }
    }

    /// Parse and validate a JSON options object.
    ///
    /// Unknown keys are ignored; a key with a value of the wrong type fails.
    pub fn from_json(value: &JsonValue) -> DbResult<Self> {
        if !value.is_object() {
            return Err(DbError::config("Pool configuration must be a JSON object"));
        }
        let config: PoolConfig = serde_json::from_value(value.clone())?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver_class_name = Some(driver.into());
        self
    }

    pub fn with_max_pool_size(mut self, size: u32) -> Self {
        self.max_pool_size = Some(size);
        self
    }

    pub fn with_initial_pool_size(mut self, size: u32) -> Self {
        self.initial_pool_size = Some(size);
        self
    }

    pub fn with_lease_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.lease_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = Some(size);
        self
    }

    pub fn with_transaction_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.transaction_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_test_on_lease(mut self, enabled: bool) -> Self {
        self.test_on_lease = Some(enabled);
        self
    }

    pub fn with_datasource_name(mut self, name: impl Into<String>) -> Self {
        self.datasource_name = Some(name.into());
        self
    }

    pub fn with_query_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.query_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_max_rows(mut self, max_rows: u64) -> Self {
        self.max_rows = Some(max_rows);
        self
    }

    pub fn with_fetch_size(mut self, fetch_size: usize) -> Self {
        self.fetch_size = Some(fetch_size);
        self
    }

    /// Per-statement options clients start from.
    pub fn statement_options(&self) -> StatementOptions {
        StatementOptions {
            query_timeout_ms: self.query_timeout_ms,
            max_rows: self.max_rows,
            fetch_size: self.fetch_size,
        }
    }

    /// Get max_pool_size with default value.
    pub fn max_pool_size_or_default(&self) -> u32 {
        self.max_pool_size.unwrap_or(DEFAULT_MAX_POOL_SIZE)
    }

    /// Get initial_pool_size with default value.
    pub fn initial_pool_size_or_default(&self) -> u32 {
        self.initial_pool_size.unwrap_or(DEFAULT_INITIAL_POOL_SIZE)
    }

    /// Get lease timeout with default value.
    pub fn lease_timeout_or_default(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms.unwrap_or(DEFAULT_LEASE_TIMEOUT_MS))
    }

    /// Get worker_pool_size with default value based on the pool size.
    pub fn worker_pool_size_or_default(&self) -> usize {
        self.worker_pool_size
            .unwrap_or(self.max_pool_size_or_default() as usize * 2)
    }

    /// Get test_on_lease with default value.
    pub fn test_on_lease_or_default(&self) -> bool {
        self.test_on_lease.unwrap_or(true)
    }

    /// Idle transaction timeout, if eviction is enabled.
    pub fn transaction_timeout(&self) -> Option<Duration> {
        self.transaction_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Isolation used when `begin` is called without one.
    pub fn isolation_or_default(&self) -> IsolationLevel {
        self.isolation.unwrap_or(IsolationLevel::ReadCommitted)
    }

    /// Shared pool name, falling back to the configured or the default name.
    pub fn datasource_name_or<'a>(&'a self, name: Option<&'a str>) -> &'a str {
        name.or(self.datasource_name.as_deref())
            .unwrap_or(DEFAULT_DATASOURCE_NAME)
    }

    /// Validate pool options and connectivity parameters.
    pub fn validate(&self) -> DbResult<()> {
        DataSource::from_config(self)?;

        let max = self.max_pool_size_or_default();
        if max == 0 {
            return Err(DbError::config("maxPoolSize must be greater than 0"));
        }
        let initial = self.initial_pool_size_or_default();
        if initial > max {
            return Err(DbError::config(format!(
                "initialPoolSize ({}) cannot exceed maxPoolSize ({})",
                initial, max
            )));
        }
        if self.worker_pool_size_or_default() == 0 {
            return Err(DbError::config("workerPoolSize must be greater than 0"));
        }
        if self.fetch_size == Some(0) {
            return Err(DbError::config("fetchSize must be greater than 0"));
        }
        Ok(())
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("jdbc_url", &self.jdbc_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .field("driver_class_name", &self.driver_class_name)
            .field("max_pool_size", &self.max_pool_size)
            .field("initial_pool_size", &self.initial_pool_size)
            .field("lease_timeout_ms", &self.lease_timeout_ms)
            .field("isolation", &self.isolation)
            .field("worker_pool_size", &self.worker_pool_size)
            .field("transaction_timeout_ms", &self.transaction_timeout_ms)
            .field("test_on_lease", &self.test_on_lease)
            .field("datasource_name", &self.datasource_name)
            .field("query_timeout_ms", &self.query_timeout_ms)
            .field("max_rows", &self.max_rows)
            .field("fetch_size", &self.fetch_size)
            .finish()
    }
}

/// Command line of the `sql-bridge` binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "sql-bridge",
    about = "Run SQL statements through a pooled, asynchronous bridge to a blocking driver",
    version,
    author
)]
pub struct Config {
    /// Connection URL, e.g. jdbc:sqlite:app.db
    #[arg(long, value_name = "URL", env = "SQL_BRIDGE_URL")]
    pub url: String,

    #[arg(long, env = "SQL_BRIDGE_USERNAME")]
    pub username: Option<String>,

    #[arg(long, env = "SQL_BRIDGE_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Maximum pooled connections
    #[arg(long, default_value_t = DEFAULT_MAX_POOL_SIZE, env = "SQL_BRIDGE_MAX_POOL_SIZE")]
    pub max_pool_size: u32,

    /// How long to wait for a free connection, in milliseconds
    #[arg(long, default_value_t = DEFAULT_LEASE_TIMEOUT_MS, env = "SQL_BRIDGE_LEASE_TIMEOUT_MS")]
    pub lease_timeout_ms: u64,

    /// Cancel statements running longer than this, in milliseconds
    #[arg(long, env = "SQL_BRIDGE_QUERY_TIMEOUT_MS")]
    pub query_timeout_ms: Option<u64>,

    /// Print at most this many rows per query
    #[arg(long, env = "SQL_BRIDGE_MAX_ROWS")]
    pub max_rows: Option<u64>,

    /// Statement to execute (repeatable, run in order before any query)
    #[arg(long = "execute", value_name = "SQL")]
    pub execute: Vec<String>,

    /// Query whose rows are printed as JSON lines (repeatable)
    #[arg(long = "query", value_name = "SQL")]
    pub query: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "SQL_BRIDGE_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "SQL_BRIDGE_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Parse configuration from command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Pool options described by the command line.
    pub fn pool_config(&self) -> PoolConfig {
        let mut config = PoolConfig::new(&self.url)
            .with_max_pool_size(self.max_pool_size)
            .with_lease_timeout_ms(self.lease_timeout_ms);
        config.username = self.username.clone();
        config.password = self.password.clone();
        config.query_timeout_ms = self.query_timeout_ms;
        config.max_rows = self.max_rows;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::new("jdbc:sqlite:app.db");
        assert_eq!(config.max_pool_size_or_default(), 15);
        assert_eq!(config.initial_pool_size_or_default(), 0);
        assert_eq!(config.lease_timeout_or_default(), Duration::from_secs(30));
        assert_eq!(config.worker_pool_size_or_default(), 30);
        assert!(config.test_on_lease_or_default());
        assert!(config.transaction_timeout().is_none());
        assert_eq!(config.datasource_name_or(None), DEFAULT_DATASOURCE_NAME);
        assert_eq!(config.datasource_name_or(Some("orders")), "orders");
    }

    #[test]
    fn test_from_json_camel_case() {
        let config = PoolConfig::from_json(&json!({
            "jdbcUrl": "jdbc:sqlite:app.db",
            "username": "sa",
            "password": "pw",
            "driverClassName": "org.sqlite.JDBC",
            "maxPoolSize": 4,
            "initialPoolSize": 2,
            "leaseTimeoutMs": 250,
            "isolation": "SERIALIZABLE",
            "somethingElse": [1, 2, 3]
        }))
        .unwrap();
        assert_eq!(config.max_pool_size_or_default(), 4);
        assert_eq!(config.initial_pool_size_or_default(), 2);
        assert_eq!(config.lease_timeout_or_default(), Duration::from_millis(250));
        assert_eq!(config.isolation_or_default(), IsolationLevel::Serializable);
        assert_eq!(config.worker_pool_size_or_default(), 8);
    }

    #[test]
    fn test_from_json_snake_case_aliases() {
        let config = PoolConfig::from_json(&json!({
            "url": "sqlite:app.db",
            "user": "sa",
            "driver_class": "sqlite",
            "max_pool_size": 3,
            "initial_pool_size": 1,
        }))
        .unwrap();
        assert_eq!(config.jdbc_url.as_deref(), Some("sqlite:app.db"));
        assert_eq!(config.username.as_deref(), Some("sa"));
        assert_eq!(config.driver_class_name.as_deref(), Some("sqlite"));
        assert_eq!(config.max_pool_size_or_default(), 3);
    }

    #[test]
    fn test_config_errors() {
        let cases = [
            json!({}),
            json!({"jdbcUrl": ""}),
            json!({"jdbcUrl": "no scheme here"}),
            json!({"jdbcUrl": "jdbc:sqlite:a.db", "maxPoolSize": "ten"}),
            json!({"jdbcUrl": "jdbc:sqlite:a.db", "maxPoolSize": 0}),
            json!({"jdbcUrl": "jdbc:sqlite:a.db", "maxPoolSize": 2, "initialPoolSize": 3}),
            json!({"jdbcUrl": "jdbc:sqlite:a.db", "workerPoolSize": 0}),
            json!({"jdbcUrl": "jdbc:sqlite:a.db", "isolation": "SNAPSHOT"}),
            json!({"jdbcUrl": "jdbc:sqlite:a.db", "fetchSize": 0}),
            json!("jdbc:sqlite:a.db"),
        ];
        for case in cases {
            let err = PoolConfig::from_json(&case).unwrap_err();
            assert_eq!(err.kind(), "config", "case {case}");
        }
    }

    #[test]
    fn test_statement_options_from_json() {
        let config = PoolConfig::from_json(&json!({
            "jdbcUrl": "jdbc:sqlite:app.db",
            "queryTimeoutMs": 1500,
            "max_rows": 10,
        }))
        .unwrap();
        let options = config.statement_options();
        assert_eq!(options.query_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(options.max_rows(), Some(10));
        assert_eq!(options.fetch_size_or_default(), crate::models::DEFAULT_FETCH_SIZE);

        let unlimited = PoolConfig::new("jdbc:sqlite:app.db").statement_options();
        assert_eq!(unlimited, StatementOptions::default());
    }

    #[test]
    fn test_debug_masks_password() {
        let config = PoolConfig::new("jdbc:sqlite:app.db").with_credentials("sa", "hunter2");
        let text = format!("{config:?}");
        assert!(!text.contains("hunter2"));
    }

    #[test]
    fn test_cli_pool_config() {
        let cli = Config::parse_from([
            "sql-bridge",
            "--url",
            "jdbc:sqlite:cli.db",
            "--max-pool-size",
            "2",
            "--execute",
            "CREATE TABLE t (id INTEGER)",
            "--query",
            "SELECT * FROM t",
            "--max-rows",
            "5",
        ]);
        let config = cli.pool_config();
        assert_eq!(config.max_pool_size_or_default(), 2);
        assert_eq!(config.statement_options().max_rows(), Some(5));
        assert!(config.query_timeout_ms.is_none());
        assert_eq!(cli.execute.len(), 1);
        assert_eq!(cli.query.len(), 1);
        assert!(config.validate().is_ok());
    }
}
