//! In-process worker wired to a host bridge through duplex pipes.

#![allow(dead_code)]

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tds_bridge::config::{ConfigDuration, PoolSettings};
use tds_bridge::worker::{OutputSink, ScriptedDriver, Worker};
use tds_bridge::{Bridge, BridgeOptions};
use tokio::io::BufReader;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const PIPE_CAPACITY: usize = 64 * 1024;

pub struct Harness {
    pub bridge: Bridge,
    pub driver: Arc<ScriptedDriver>,
    pub worker: Worker<ScriptedDriver>,
    serve: JoinHandle<io::Result<()>>,
    writer: JoinHandle<io::Result<()>>,
    stop: Option<oneshot::Sender<()>>,
}

pub fn pool_settings(max: u32, transaction_connections: u32) -> PoolSettings {
    PoolSettings {
        min_connections: 1,
        max_connections: max,
        transaction_connections,
        connection_timeout: ConfigDuration::from_secs(2),
        ..PoolSettings::default()
    }
}

pub fn options(request_timeout: Duration) -> BridgeOptions {
    BridgeOptions {
        request_timeout,
        ..BridgeOptions::default()
    }
}

impl Harness {
    pub async fn start(driver: ScriptedDriver) -> Self {
        Self::with_settings(driver, pool_settings(4, 2)).await
    }

    pub async fn with_settings(driver: ScriptedDriver, settings: PoolSettings) -> Self {
        let driver = Arc::new(driver);
        let worker = Worker::start(Arc::clone(&driver), &settings)
            .await
            .expect("worker starts");

        let (host_out, worker_in) = tokio::io::duplex(PIPE_CAPACITY);
        let (worker_out, host_in) = tokio::io::duplex(PIPE_CAPACITY);

        let (sink, writer) = OutputSink::spawn(worker_out);
        let (stop, stopped) = oneshot::channel::<()>();
        let serving = worker.clone();
        let serve = tokio::spawn(async move {
            serving
                .serve(BufReader::new(worker_in), sink, async {
                    let _ = stopped.await;
                })
                .await
        });

        let bridge = Bridge::from_streams(
            host_out,
            BufReader::new(host_in),
            tokio::io::empty(),
            options(Duration::from_secs(5)),
        );

        Self {
            bridge,
            driver,
            worker,
            serve,
            writer,
            stop: Some(stop),
        }
    }

    /// Simulate the worker dying: its output closes without answering.
    pub fn kill(&self) {
        self.serve.abort();
        self.writer.abort();
    }

    /// Ask the worker loop to stop and wait for it.
    pub async fn stop(mut self) -> io::Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match (&mut self.serve).await {
            Ok(result) => result,
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}

/// Wait until `condition` holds, polling briefly.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
