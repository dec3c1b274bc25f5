//! Blocking driver interface.
//!
//! A [`Driver`] opens physical sessions; a [`DriverConnection`] runs exactly one
//! blocking call at a time. Nothing in this module is async: every method is
//! expected to be called from a worker that is allowed to block.

use crate::config::PoolConfig;
use crate::db::sqlite::SqliteDriver;
use crate::error::{DbError, DbResult};
use crate::models::{
    IsolationLevel, ResultSet, SqlValue, StatementKind, StatementOptions, StatementOutput,
};
use std::fmt;
use std::sync::Arc;
use url::Url;

/// Connectivity parameters handed to a driver.
#[derive(Clone)]
pub struct DataSource {
    /// URL as configured (`jdbc:` prefix included, when given)
    pub url: String,
    /// Sub-protocol, e.g. `sqlite` for `jdbc:sqlite:app.db`
    pub scheme: String,
    /// Everything after `<scheme>:`
    pub target: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Requested driver identifier (`driverClassName`)
    pub driver: Option<String>,
}

impl DataSource {
    /// Parse the connectivity part of a pool configuration.
    pub fn from_config(config: &PoolConfig) -> DbResult<Self> {
        let url = config
            .jdbc_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DbError::config("jdbcUrl is required"))?;
        let stripped = url.strip_prefix("jdbc:").unwrap_or(url);
        let parsed = Url::parse(stripped)
            .map_err(|e| DbError::config(format!("Invalid jdbcUrl '{}': {}", url, e)))?;
        let scheme = parsed.scheme().to_string();
        let target = stripped[scheme.len() + 1..].to_string();

        Ok(Self {
            url: url.to_string(),
            scheme,
            target,
            username: config.username.clone(),
            password: config.password.clone(),
            driver: config
                .driver_class_name
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from),
        })
    }
}

impl fmt::Debug for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSource")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .field("driver", &self.driver)
            .finish()
    }
}

/// Factory for physical connections.
pub trait Driver: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Open a new session. Blocks.
    fn open(&self, source: &DataSource) -> DbResult<Box<dyn DriverConnection>>;
}

/// Receiver of rows read by [`DriverConnection::stream`].
///
/// Returning `false` from either method stops the read; the driver then
/// closes its cursor and returns `Ok(())`.
pub trait RowSink {
    /// Called once, before the first row.
    fn columns(&mut self, names: &[String]) -> bool;

    fn row(&mut self, values: Vec<SqlValue>) -> bool;
}

/// One physical session. Never used by two callers at once.
pub trait DriverConnection: Send {
    /// Run one statement with positional parameters.
    ///
    /// Drivers honor `options` where they can; `max_rows` is enforced again
    /// by the caller.
    fn execute(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        kind: StatementKind,
        options: &StatementOptions,
    ) -> DbResult<StatementOutput>;

    /// Run a query and hand its rows to `sink` as they are read.
    ///
    /// The default collects the whole result through
    /// [`DriverConnection::execute`] first.
    fn stream(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        options: &StatementOptions,
        sink: &mut dyn RowSink,
    ) -> DbResult<()> {
        let ResultSet { columns, rows } =
            match self.execute(sql, params, StatementKind::Query, options)? {
                StatementOutput::Rows(rows) => rows,
                _ => ResultSet::default(),
            };
        if !sink.columns(&columns) {
            return Ok(());
        }
        for row in rows {
            if !sink.row(row) {
                break;
            }
        }
        Ok(())
    }

    fn set_isolation(&mut self, level: IsolationLevel) -> DbResult<()>;

    /// Leave auto-commit mode.
    fn begin(&mut self) -> DbResult<()>;

    /// Commit and return to auto-commit mode.
    fn commit(&mut self) -> DbResult<()>;

    /// Roll back and return to auto-commit mode.
    fn rollback(&mut self) -> DbResult<()>;

    /// False once the session is unusable (closed, broken, stuck in a transaction).
    fn is_valid(&mut self) -> bool;

    fn close(self: Box<Self>) -> DbResult<()>;
}

/// Pick the bundled driver able to serve a data source.
pub fn resolve_driver(source: &DataSource) -> DbResult<Arc<dyn Driver>> {
    if let Some(id) = source.driver.as_deref() {
        if SqliteDriver::accepts_driver_id(id) {
            return Ok(Arc::new(SqliteDriver::new()));
        }
        return Err(DbError::config(format!(
            "No driver registered under '{}'",
            id
        )));
    }
    if SqliteDriver::accepts_scheme(&source.scheme) {
        return Ok(Arc::new(SqliteDriver::new()));
    }
    Err(DbError::config(format!(
        "No suitable driver for URL scheme '{}'",
        source.scheme
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(url: &str) -> DbResult<DataSource> {
        DataSource::from_config(&PoolConfig::new(url))
    }

    #[test]
    fn test_parse_jdbc_url() {
        let ds = source("jdbc:sqlite:/tmp/app.db").unwrap();
        assert_eq!(ds.scheme, "sqlite");
        assert_eq!(ds.target, "/tmp/app.db");

        let ds = source("sqlite::memory:").unwrap();
        assert_eq!(ds.target, ":memory:");
    }

    #[test]
    fn test_missing_and_unparsable_url() {
        assert!(matches!(source("  "), Err(DbError::Config { .. })));
        assert!(matches!(source("not a url"), Err(DbError::Config { .. })));
        assert!(matches!(
            DataSource::from_config(&PoolConfig::default()),
            Err(DbError::Config { .. })
        ));
    }

    #[test]
    fn test_resolve_driver() {
        let ds = source("jdbc:sqlite:app.db").unwrap();
        assert_eq!(resolve_driver(&ds).unwrap().name(), "sqlite");

        let ds = source("jdbc:postgresql://localhost/app").unwrap();
        assert!(matches!(resolve_driver(&ds), Err(DbError::Config { .. })));

        let mut ds = source("jdbc:sqlite:app.db").unwrap();
        ds.driver = Some("org.sqlite.JDBC".to_string());
        assert!(resolve_driver(&ds).is_ok());
        ds.driver = Some("com.mysql.cj.jdbc.Driver".to_string());
        assert!(resolve_driver(&ds).is_err());
    }

    #[test]
    fn test_debug_masks_password() {
        let config = PoolConfig::new("jdbc:sqlite:app.db").with_credentials("sa", "secret");
        let ds = DataSource::from_config(&config).unwrap();
        let text = format!("{ds:?}");
        assert!(!text.contains("secret"));
        assert!(text.contains("****"));
    }
}
