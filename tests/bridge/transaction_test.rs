mod harness;

use std::sync::Arc;
use std::time::Duration;

use harness::{pool_settings, Harness};
use tds_bridge::worker::ScriptedDriver;
use tds_bridge::BridgeError;

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_transaction_restores_spare_count() {
    let harness = Harness::start(ScriptedDriver::new()).await;
    let spares_before = harness.worker.transactions().available_count().await;

    let mut tx = harness.bridge.begin_transaction();
    tx.execute("BEGIN TRANSACTION").await.unwrap();
    tx.execute("INSERT INTO t VALUES (1)").await.unwrap();
    assert_eq!(harness.worker.transactions().active_count().await, 1);
    tx.finish("COMMIT").await.unwrap();

    assert_eq!(harness.worker.transactions().active_count().await, 0);
    assert_eq!(
        harness.worker.transactions().available_count().await,
        spares_before
    );
}

#[tokio::test]
async fn test_statements_share_one_connection() {
    let harness = Harness::start(ScriptedDriver::new()).await;

    let mut tx = harness.bridge.begin_transaction();
    tx.execute("BEGIN TRANSACTION").await.unwrap();
    tx.execute("UPDATE a SET x = 1").await.unwrap();
    tx.finish("COMMIT").await.unwrap();

    let driver = &harness.driver;
    let conn = driver.connection_for("BEGIN TRANSACTION");
    assert!(conn.is_some());
    assert_eq!(driver.connection_for("UPDATE a SET x = 1"), conn);
    assert_eq!(driver.connection_for("COMMIT"), conn);
}

#[tokio::test]
async fn test_concurrent_transactions_are_isolated() {
    let driver = ScriptedDriver::new().with_latency(Duration::from_millis(5));
    let harness = Arc::new(Harness::start(driver).await);

    let run = |label: &'static str| {
        let harness = Arc::clone(&harness);
        async move {
            let mut tx = harness.bridge.begin_transaction();
            for step in 0..3 {
                tx.execute(&format!("UPDATE {} SET step = {}", label, step))
                    .await
                    .unwrap();
            }
            tx.finish(&format!("COMMIT {}", label)).await.unwrap();
        }
    };
    tokio::join!(run("left"), run("right"));

    let driver = &harness.driver;
    let left = driver.connection_for("COMMIT left");
    let right = driver.connection_for("COMMIT right");
    assert_ne!(left, right);
    for step in 0..3 {
        assert_eq!(
            driver.connection_for(&format!("UPDATE left SET step = {}", step)),
            left
        );
        assert_eq!(
            driver.connection_for(&format!("UPDATE right SET step = {}", step)),
            right
        );
    }
}

#[tokio::test]
async fn test_released_id_gets_a_new_connection() {
    let harness = Harness::start(ScriptedDriver::new()).await;
    let bridge = &harness.bridge;

    bridge
        .execute("SELECT 'first'", Some(42), true, TIMEOUT)
        .await
        .unwrap();
    bridge
        .execute("SELECT 'second'", Some(42), true, TIMEOUT)
        .await
        .unwrap();

    let first = harness.driver.connection_for("SELECT 'first'");
    let second = harness.driver.connection_for("SELECT 'second'");
    assert!(first.is_some() && second.is_some());
    assert_ne!(first, second);
}

#[tokio::test]
async fn test_get_connection_is_idempotent() {
    let harness = Harness::start(ScriptedDriver::new()).await;
    let transactions = harness.worker.transactions();

    let first = transactions.get_connection(5).await.unwrap();
    let again = transactions.get_connection(5).await.unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    drop((first, again));

    assert!(transactions.release_connection(5).await);
    assert!(!transactions.release_connection(5).await);
}

#[tokio::test]
async fn test_failed_statement_rolls_back_and_keeps_binding() {
    let driver = ScriptedDriver::new().with_error("INSERT dup", "Violation of PRIMARY KEY constraint");
    let harness = Harness::start(driver).await;

    let mut tx = harness.bridge.begin_transaction();
    tx.execute("BEGIN TRANSACTION").await.unwrap();
    let err = tx.execute("INSERT dup").await.unwrap_err();
    assert!(matches!(err, BridgeError::Query(ref m) if m == "Violation of PRIMARY KEY constraint"));
    assert_eq!(harness.driver.rollbacks(), 1);

    // The id still maps to the same session until finished.
    tx.finish("SELECT @@TRANCOUNT").await.unwrap();
    assert_eq!(
        harness.driver.connection_for("SELECT @@TRANCOUNT"),
        harness.driver.connection_for("BEGIN TRANSACTION")
    );
    assert_eq!(harness.worker.transactions().active_count().await, 0);
}

#[tokio::test]
async fn test_failed_finish_still_releases() {
    let driver = ScriptedDriver::new().with_error("COMMIT", "The COMMIT TRANSACTION request has no corresponding BEGIN TRANSACTION.");
    let harness = Harness::with_settings(driver, pool_settings(2, 1)).await;

    let mut tx = harness.bridge.begin_transaction();
    tx.execute("UPDATE a SET x = 1").await.unwrap();
    assert!(tx.finish("COMMIT").await.is_err());

    assert_eq!(harness.worker.transactions().active_count().await, 0);
    assert_eq!(harness.worker.transactions().available_count().await, 1);
}

#[tokio::test]
async fn test_transaction_connect_failure_is_reported() {
    let harness = Harness::with_settings(ScriptedDriver::new(), pool_settings(2, 0)).await;
    harness.driver.set_connect_failure(Some("Login failed for user 'app'."));

    let err = harness
        .bridge
        .execute("BEGIN TRANSACTION", Some(1), false, TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Connect(ref m) if m.contains("Login failed")));
    assert!(harness.bridge.is_connected());
}
