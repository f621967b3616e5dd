mod harness;

use std::sync::Arc;
use std::time::Duration;

use harness::{eventually, options, Harness};
use tds_bridge::protocol::{self, QueryResponse};
use tds_bridge::rows::{Row, Value};
use tds_bridge::worker::ScriptedDriver;
use tds_bridge::{Bridge, BridgeError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinSet;

/// Host bridge plus the raw worker-side ends of its pipes.
struct FakeWorker {
    bridge: Bridge,
    requests: tokio::io::Lines<BufReader<DuplexStream>>,
    stdout: DuplexStream,
    stderr: DuplexStream,
}

fn fake_worker(request_timeout: Duration) -> FakeWorker {
    let (host_out, worker_in) = tokio::io::duplex(4096);
    let (stdout, host_in) = tokio::io::duplex(4096);
    let (stderr, host_err) = tokio::io::duplex(4096);
    let bridge = Bridge::from_streams(
        host_out,
        BufReader::new(host_in),
        BufReader::new(host_err),
        options(request_timeout),
    );
    FakeWorker {
        bridge,
        requests: BufReader::new(worker_in).lines(),
        stdout,
        stderr,
    }
}

#[tokio::test]
async fn test_select_one() {
    let harness = Harness::start(ScriptedDriver::new()).await;

    let result = harness.bridge.raw_query("SELECT 1").await.unwrap();
    assert_eq!(result, vec![vec![Row::new().with("", 1)]]);
}

#[tokio::test]
async fn test_query_error_keeps_bridge_connected() {
    let driver = ScriptedDriver::new().with_error("SELEC 1", "Incorrect syntax near 'SELEC'.");
    let harness = Harness::start(driver).await;

    let err = harness.bridge.raw_query("SELEC 1").await.unwrap_err();
    match err {
        BridgeError::Query(message) => assert_eq!(message, "Incorrect syntax near 'SELEC'."),
        other => panic!("expected query error, got {:?}", other),
    }

    assert!(harness.bridge.is_connected());
    let row = harness.bridge.query_first("SELECT 1").await.unwrap();
    assert_eq!(row.get::<i64>("").unwrap(), 1);
}

#[tokio::test]
async fn test_concurrent_requests_get_their_own_responses() {
    let mut driver = ScriptedDriver::new();
    for n in 0..20u64 {
        let sql = format!("SELECT {} AS n", n);
        // Later requests finish first so responses come back out of order.
        driver = driver
            .with_rows(&sql, vec![Row::new().with("n", n as i64)])
            .with_delay(&sql, Duration::from_millis((20 - n) * 5));
    }
    let harness = Arc::new(Harness::start(driver).await);

    let mut tasks = JoinSet::new();
    for n in 0..20i64 {
        let harness = Arc::clone(&harness);
        tasks.spawn(async move {
            let row = harness
                .bridge
                .query_first(&format!("SELECT {} AS n", n))
                .await
                .unwrap();
            (n, row.get::<i64>("n").unwrap())
        });
    }

    let mut seen = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let (sent, received) = joined.unwrap();
        assert_eq!(sent, received);
        seen.push(sent);
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..20).collect::<Vec<_>>());
    assert_eq!(harness.bridge.pending_requests(), 0);
}

#[tokio::test]
async fn test_row_order_and_nulls_survive_the_round_trip() {
    let rows = vec![
        Row::new()
            .with("id", 1)
            .with("name", "first")
            .with("deleted_at", Value::Null),
        Row::new()
            .with("id", 2)
            .with("name", Value::Null)
            .with("deleted_at", "2024-01-02T03:04:05.000Z"),
    ];
    let driver = ScriptedDriver::new().with_rows("SELECT * FROM items", rows.clone());
    let harness = Harness::start(driver).await;

    let result = harness.bridge.raw_query("SELECT * FROM items").await.unwrap();
    assert_eq!(result, vec![rows]);

    let second = &result[0][1];
    assert_eq!(
        second.column_names().collect::<Vec<_>>(),
        vec!["id", "name", "deleted_at"]
    );
    assert!(second.contains("name"));
    assert_eq!(second.get::<Option<String>>("name").unwrap(), None);
}

#[tokio::test]
async fn test_multiple_result_sets_iterate_in_order() {
    let driver = ScriptedDriver::new().with_results(
        "EXEC report",
        vec![
            vec![Row::new().with("n", 1), Row::new().with("n", 2)],
            vec![Row::new().with("n", 3)],
        ],
    );
    let harness = Harness::start(driver).await;

    let rows = harness
        .bridge
        .execute("EXEC report", None, true, Duration::from_secs(5))
        .await
        .unwrap();
    let values: Vec<i64> = rows.map(|row| row.get("n").unwrap()).collect();
    assert_eq!(values, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_query_first_without_rows() {
    let driver = ScriptedDriver::new().with_results("SELECT nothing", vec![vec![]]);
    let harness = Harness::start(driver).await;

    let err = harness.bridge.query_first("SELECT nothing").await.unwrap_err();
    assert!(matches!(err, BridgeError::NoRows));
}

#[derive(Debug)]
#[allow(dead_code)]
enum VisitError {
    Bridge(BridgeError),
    Stop(i64),
}

impl From<BridgeError> for VisitError {
    fn from(err: BridgeError) -> Self {
        Self::Bridge(err)
    }
}

#[tokio::test]
async fn test_query_callback_stops_at_first_error() {
    let rows = (1..=5).map(|n| Row::new().with("n", n as i64)).collect();
    let driver = ScriptedDriver::new().with_rows("SELECT n", rows);
    let harness = Harness::start(driver).await;

    let mut visited = Vec::new();
    let result: Result<(), VisitError> = harness
        .bridge
        .query("SELECT n", |row| {
            let n: i64 = row.get("n").map_err(|e| BridgeError::Protocol(e.to_string()))?;
            visited.push(n);
            if n == 3 {
                return Err(VisitError::Stop(n));
            }
            Ok(())
        })
        .await;

    assert!(matches!(result, Err(VisitError::Stop(3))));
    assert_eq!(visited, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_worker_death_resolves_in_flight_request() {
    let driver = ScriptedDriver::new().with_delay("WAITFOR DELAY '00:00:10'", Duration::from_secs(10));
    let harness = Harness::start(driver).await;

    for _ in 0..6 {
        harness.bridge.exec("SELECT 1").await.unwrap();
    }

    // The seventh request is in flight when the worker goes away.
    let (result, ()) = tokio::join!(
        harness.bridge.exec("WAITFOR DELAY '00:00:10'"),
        async {
            assert!(eventually(|| harness.bridge.pending_requests() == 1).await);
            harness.kill();
        }
    );

    assert!(matches!(result, Err(BridgeError::Disconnected)));
    assert!(!harness.bridge.is_connected());
    assert_eq!(harness.bridge.pending_requests(), 0);
    assert!(matches!(
        harness.bridge.exec("SELECT 1").await,
        Err(BridgeError::Disconnected)
    ));
}

#[tokio::test]
async fn test_worker_loop_stops_on_input_close() {
    let harness = Harness::start(ScriptedDriver::new()).await;
    harness.bridge.exec("SELECT 1").await.unwrap();

    harness.bridge.disconnect().await;
    harness.bridge.disconnect().await;
    assert!(!harness.bridge.is_connected());

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_timeout_abandons_request() {
    let mut worker = fake_worker(Duration::from_secs(5));

    let err = worker
        .bridge
        .execute("SELECT 1", None, true, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Timeout(_)));
    assert_eq!(worker.bridge.pending_requests(), 0);

    // The late answer is discarded and the bridge stays usable.
    let request = worker.requests.next_line().await.unwrap().unwrap();
    let request = protocol::parse_request(&request).unwrap();
    let late = protocol::encode(&QueryResponse::success(request.msg_id, vec![])).unwrap();
    worker.stdout.write_all(late.as_bytes()).await.unwrap();
    assert!(worker.bridge.is_connected());
}

#[tokio::test]
async fn test_diagnostics_and_garbage_on_stdout_are_skipped() {
    let FakeWorker {
        bridge,
        mut requests,
        mut stdout,
        stderr: _stderr,
    } = fake_worker(Duration::from_secs(5));

    let answer = async {
        let line = requests.next_line().await.unwrap().unwrap();
        let request = protocol::parse_request(&line).unwrap();
        assert_eq!(request.sql, "SELECT 1");

        let response = protocol::encode(&QueryResponse::success(
            request.msg_id,
            vec![vec![Row::new().with("", 1)]],
        ))
        .unwrap();
        let unknown = protocol::encode(&QueryResponse::success(9999, vec![])).unwrap();
        let output = format!(
            "TDSLOG: Executing request\n{{broken json\n{}{}",
            unknown, response
        );
        stdout.write_all(output.as_bytes()).await.unwrap();
    };

    let (row, ()) = tokio::join!(bridge.query_first("SELECT 1"), answer);
    assert_eq!(row.unwrap().get::<i64>("").unwrap(), 1);
    assert!(bridge.is_connected());
}

#[tokio::test]
async fn test_unexpected_stderr_tears_down() {
    let FakeWorker {
        bridge,
        mut requests,
        stdout: _stdout,
        mut stderr,
    } = fake_worker(Duration::from_secs(5));

    let crash = async {
        requests.next_line().await.unwrap().unwrap();
        stderr
            .write_all(b"TDSERROR: pool running low\nfatal runtime error: stack overflow\n")
            .await
            .unwrap();
    };

    let (result, ()) = tokio::join!(bridge.exec("SELECT 1"), crash);
    assert!(matches!(result, Err(BridgeError::Disconnected)));
    assert!(!bridge.is_connected());
}

#[tokio::test]
async fn test_worker_output_close_disconnects() {
    let FakeWorker {
        bridge,
        requests,
        stdout,
        stderr,
    } = fake_worker(Duration::from_secs(5));
    drop(stdout);

    assert!(eventually(|| !bridge.is_connected()).await);
    assert!(matches!(
        bridge.exec("SELECT 1").await,
        Err(BridgeError::Disconnected)
    ));
    drop((requests, stderr));
}
