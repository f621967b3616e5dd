#[path = "../bridge/harness.rs"]
mod harness;

use std::sync::Arc;
use std::time::Duration;

use harness::Harness;
use tds_bridge::config::{ConfigDuration, PoolSettings};
use tds_bridge::protocol::{ErrorCode, QueryRequest};
use tds_bridge::worker::{ConnectionPool, PoolConfig, PoolError, ScriptedDriver, Worker};
use tds_bridge::BridgeError;
use tokio::task::JoinSet;

fn settings(max: u32, connection_timeout: Duration) -> PoolSettings {
    PoolSettings {
        min_connections: 1,
        max_connections: max,
        transaction_connections: 0,
        connection_timeout: ConfigDuration(connection_timeout),
        ..PoolSettings::default()
    }
}

#[tokio::test]
async fn test_excess_requests_wait_for_a_connection() {
    let driver = Arc::new(ScriptedDriver::new().with_latency(Duration::from_millis(30)));
    let worker = Worker::start(Arc::clone(&driver), &settings(2, Duration::from_secs(2)))
        .await
        .unwrap();

    let mut tasks = JoinSet::new();
    for n in 0..8i64 {
        let worker = worker.clone();
        tasks.spawn(async move { worker.handle(QueryRequest::new(n, "SELECT 1")).await });
    }

    let mut answered = 0;
    while let Some(joined) = tasks.join_next().await {
        let response = joined.unwrap();
        assert!(response.error.is_none(), "{:?}", response.error);
        assert_eq!(response.result.len(), 1);
        answered += 1;
    }

    assert_eq!(answered, 8);
    assert!(driver.opened() <= 2);
    let stats = worker.pool().stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.waiting, 0);
    assert!(stats.total <= 2);
}

#[tokio::test]
async fn test_exhausted_pool_answers_with_error_code() {
    let driver = Arc::new(ScriptedDriver::new().with_delay("WAITFOR", Duration::from_millis(500)));
    let worker = Worker::start(Arc::clone(&driver), &settings(1, Duration::from_millis(50)))
        .await
        .unwrap();

    let busy = worker.clone();
    let holder = tokio::spawn(async move { busy.handle(QueryRequest::new(1, "WAITFOR")).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let response = worker.handle(QueryRequest::new(2, "SELECT 1")).await;
    assert_eq!(response.error_code, Some(ErrorCode::PoolExhausted));
    assert_eq!(
        response.error.as_deref(),
        Some("no connection available within 50ms")
    );

    assert!(holder.await.unwrap().error.is_none());
}

#[tokio::test]
async fn test_bridge_sees_pool_exhaustion() {
    let driver = ScriptedDriver::new().with_delay("WAITFOR", Duration::from_millis(500));
    let harness = Harness::with_settings(driver, settings(1, Duration::from_millis(50))).await;

    let (slow, fast) = tokio::join!(harness.bridge.exec("WAITFOR"), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        harness.bridge.exec("SELECT 1").await
    });

    assert!(slow.is_ok());
    let err = fast.unwrap_err();
    assert!(matches!(err, BridgeError::PoolExhausted(_)));
    assert!(err.is_retriable());
}

#[tokio::test]
async fn test_sequential_requests_reuse_connection() {
    let harness = Harness::with_settings(
        ScriptedDriver::new(),
        settings(4, Duration::from_secs(1)),
    )
    .await;

    harness.bridge.exec("SELECT 'a'").await.unwrap();
    harness.bridge.exec("SELECT 'b'").await.unwrap();

    let driver = &harness.driver;
    assert_eq!(driver.connection_for("SELECT 'a'"), driver.connection_for("SELECT 'b'"));
    assert_eq!(driver.opened(), 1);
}

#[tokio::test]
async fn test_stateless_requests_leave_transaction_pool_alone() {
    let harness = Harness::start(ScriptedDriver::new()).await;
    let spares = harness.worker.transactions().available_count().await;

    for _ in 0..5 {
        harness.bridge.exec("SELECT 1").await.unwrap();
    }

    assert_eq!(harness.worker.transactions().available_count().await, spares);
    assert_eq!(harness.worker.transactions().active_count().await, 0);
}

#[tokio::test]
async fn test_pool_refuses_after_shutdown() {
    let driver = Arc::new(ScriptedDriver::new());
    let pool = ConnectionPool::new(
        Arc::clone(&driver),
        PoolConfig {
            min_connections: 2,
            max_connections: 2,
            ..PoolConfig::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(driver.open_connections(), 2);

    pool.shutdown().await;
    assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
    assert_eq!(driver.open_connections(), 0);
}
