//! SQL Bridge - command line entry point.
//!
//! Runs `--execute` statements in order, then prints the rows of every
//! `--query` as JSON lines while they are read, all through one exclusive
//! client.

use async_sql_bridge::{Config, JdbcClient, SqlValue};
use futures_util::StreamExt;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // Logs go to stderr; stdout carries the query output
    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

async fn run(client: &JdbcClient, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    for sql in &config.execute {
        client.execute(sql.as_str()).await?;
    }

    for sql in &config.query {
        let mut rows = client.query_stream(sql.as_str(), ()).await?;
        let columns = rows.columns().to_vec();
        while let Some(row) = rows.next().await {
            let line: serde_json::Map<_, _> = columns
                .iter()
                .cloned()
                .zip(row?.iter().map(SqlValue::to_json))
                .collect();
            println!("{}", serde_json::to_string(&line)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse_args();
    init_tracing(&config);

    info!(
        statements = config.execute.len(),
        queries = config.query.len(),
        "Starting SQL Bridge v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = JdbcClient::create_exclusive(config.pool_config())?;
    let outcome = run(&client, &config).await;
    client.close().await?;

    if let Err(e) = &outcome {
        error!(error = %e, "Run failed");
    }
    outcome
}
