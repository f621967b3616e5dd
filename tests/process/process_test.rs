#![cfg(unix)]

use std::path::PathBuf;
use std::time::Duration;

use tds_bridge::bridge::WorkerCommand;
use tds_bridge::{Bridge, BridgeError, BridgeOptions};
use tempfile::TempDir;

/// Answers every request with one row `{"":1}`.
const ECHO_BODY: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed 's/.*"msgId":\([0-9-]*\).*/\1/')
  printf '{"msgId":%s,"result":[[{"":1}]]}\n' "$id"
done
"#;

struct Script {
    _dir: TempDir,
    path: PathBuf,
}

fn script(body: &str) -> Script {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("worker.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    Script { _dir: dir, path }
}

fn command(script: &Script) -> WorkerCommand {
    WorkerCommand::new("sh").arg(script.path.to_string_lossy())
}

fn options() -> BridgeOptions {
    BridgeOptions {
        logs: false,
        handshake_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn test_handshake_then_query() {
    let worker = script(&format!("echo 'TDSLOG: Connection created'\n{}", ECHO_BODY));
    let bridge = Bridge::launch(command(&worker), options()).await.unwrap();

    let row = bridge.query_first("SELECT 1").await.unwrap();
    assert_eq!(row.get::<i64>("").unwrap(), 1);

    bridge.disconnect().await;
    assert!(!bridge.is_connected());
}

#[tokio::test]
async fn test_logging_worker_skips_handshake() {
    let worker = script(&format!("echo 'TDSLOG: Connected to db:5000/master'\n{}", ECHO_BODY));
    let options = BridgeOptions {
        logs: true,
        ..options()
    };
    let bridge = Bridge::launch(command(&worker), options).await.unwrap();

    let row = bridge.query_first("SELECT 1").await.unwrap();
    assert_eq!(row.get::<i64>("").unwrap(), 1);
}

#[tokio::test]
async fn test_startup_failure_reports_worker_error() {
    let worker = script("echo \"TDSERROR: Login failed for user 'sa'.\" >&2\nexit 1");

    let err = Bridge::launch(command(&worker), options()).await.unwrap_err();
    match err {
        BridgeError::Handshake(message) => {
            assert!(message.contains("exited before confirming startup"));
            assert!(message.contains("Login failed for user 'sa'."));
        }
        other => panic!("expected handshake error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unexpected_first_line_fails_handshake() {
    let worker = script("echo 'hello'\nexec sleep 5");

    let err = Bridge::launch(command(&worker), options()).await.unwrap_err();
    assert!(matches!(err, BridgeError::Handshake(ref m) if m.contains("hello")));
}

#[tokio::test]
async fn test_silent_worker_times_out_handshake() {
    let worker = script("exec sleep 5");
    let options = BridgeOptions {
        handshake_timeout: Duration::from_millis(100),
        ..options()
    };

    let err = Bridge::launch(command(&worker), options).await.unwrap_err();
    assert!(matches!(err, BridgeError::Handshake(ref m) if m.contains("within 100ms")));
}

#[tokio::test]
async fn test_missing_executable_is_startup_error() {
    let err = Bridge::launch(
        WorkerCommand::new("/nonexistent/tds-bridge-worker"),
        options(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, BridgeError::Startup(_)));
}

#[tokio::test]
async fn test_worker_exit_mid_request_disconnects() {
    let worker = script("echo 'TDSLOG: Connection created'\nread -r line\nexit 3");
    let bridge = Bridge::launch(command(&worker), options()).await.unwrap();

    let err = bridge.exec("WAITFOR DELAY '00:00:10'").await.unwrap_err();
    assert!(matches!(err, BridgeError::Disconnected));
    assert!(!bridge.is_connected());
}

#[tokio::test]
async fn test_stderr_garbage_disconnects() {
    let worker = script(
        "echo 'TDSLOG: Connection created'\nread -r line\necho 'TDSERROR: still fine' >&2\necho 'Segmentation fault' >&2\nexec sleep 5",
    );
    let bridge = Bridge::launch(command(&worker), options()).await.unwrap();

    let err = bridge.exec("SELECT 1").await.unwrap_err();
    assert!(matches!(err, BridgeError::Disconnected));
    assert!(!bridge.is_connected());
}
