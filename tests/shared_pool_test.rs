//! Integration tests for data sources shared between clients.

mod common;

use async_sql_bridge::config::DEFAULT_DATASOURCE_NAME;
use async_sql_bridge::{DbError, JdbcClient, PoolRegistry};
use common::ScriptedDriver;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;

#[tokio::test]
async fn test_clients_share_one_pool() {
    let registry = Arc::new(PoolRegistry::new());
    let (driver, stats) = ScriptedDriver::new();

    let a = JdbcClient::create_shared_with_driver(
        common::config(2),
        Some("orders"),
        &registry,
        driver.clone(),
    )
    .unwrap();
    // A different configuration is ignored once the name exists
    let b = JdbcClient::create_shared_with_driver(
        common::config(9),
        Some("orders"),
        &registry,
        driver,
    )
    .unwrap();

    assert_eq!(registry.ref_count("orders"), 2);
    assert_eq!(a.datasource_name(), Some("orders"));
    assert_eq!(b.pool_status().max_size, 2);

    a.execute("CREATE TABLE t").await.unwrap();
    b.execute("CREATE TABLE u").await.unwrap();
    assert_eq!(stats.opened.load(Ordering::SeqCst), 1);

    a.close().await.unwrap();
    assert_eq!(registry.ref_count("orders"), 1);
    assert_eq!(stats.closed.load(Ordering::SeqCst), 0);
    assert!(matches!(
        a.query("SELECT 1", ()).await.unwrap_err(),
        DbError::PoolClosed
    ));
    assert!(b.query("SELECT 1", ()).await.is_ok());

    b.close().await.unwrap();
    assert!(!registry.contains("orders"));
    assert_eq!(stats.open_connections(), 0);
}

#[tokio::test]
async fn test_closing_twice_releases_once() {
    let registry = Arc::new(PoolRegistry::new());
    let (driver, _) = ScriptedDriver::new();
    let a = JdbcClient::create_shared_with_driver(common::config(1), None, &registry, driver.clone())
        .unwrap();
    let b = JdbcClient::create_shared_with_driver(common::config(1), None, &registry, driver)
        .unwrap();
    assert_eq!(a.datasource_name(), Some(DEFAULT_DATASOURCE_NAME));

    a.close().await.unwrap();
    a.close().await.unwrap();
    assert_eq!(registry.ref_count(DEFAULT_DATASOURCE_NAME), 1);
    b.close().await.unwrap();
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_configured_name_is_used() {
    let registry = Arc::new(PoolRegistry::new());
    let (driver, _) = ScriptedDriver::new();
    let config = common::config(1).with_datasource_name("reporting");
    let client = JdbcClient::create_shared_with_driver(config, None, &registry, driver).unwrap();

    assert!(registry.contains("reporting"));
    client.close().await.unwrap();
}

#[test]
fn test_concurrent_first_use_creates_one_pool() {
    let registry = Arc::new(PoolRegistry::new());
    let (driver, _) = ScriptedDriver::new();

    let clients: Vec<JdbcClient> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let driver = driver.clone();
            thread::spawn(move || {
                JdbcClient::create_shared_with_driver(
                    common::config(3),
                    Some("hot"),
                    &registry,
                    driver,
                )
                .unwrap()
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    assert_eq!(registry.len(), 1);
    assert_eq!(registry.ref_count("hot"), 8);
    let status = clients[0].pool_status();
    assert!(clients.iter().all(|client| client.pool_status() == status));
}

#[tokio::test]
async fn test_invalid_config_registers_nothing() {
    let registry = Arc::new(PoolRegistry::new());
    let (driver, _) = ScriptedDriver::new();
    let config = common::config(0);

    let err = JdbcClient::create_shared_with_driver(config, Some("bad"), &registry, driver)
        .unwrap_err();
    assert!(matches!(err, DbError::Config { .. }));
    assert!(!registry.contains("bad"));
}

#[tokio::test]
async fn test_unknown_scheme_is_config_error() {
    let registry = Arc::new(PoolRegistry::new());
    let err = JdbcClient::create_shared(common::config(1), Some("x"), &registry).unwrap_err();
    assert!(matches!(err, DbError::Config { .. }));
    assert!(registry.is_empty());
}
