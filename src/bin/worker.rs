//! tds-bridge-worker - database worker process
//!
//! Usage:
//!   tds-bridge-worker <config.toml>
//!   tds-bridge-worker <host> <port> <database> <username> <password> <logs>
//!                     <min> <max> <connection_timeout> <idle_timeout>
//!                     <keepalive> <max_lifetime> <transaction_connections>
//!
//! Reads one JSON request per line on stdin and answers on stdout. Durations
//! are in seconds. Exits with status 1 when the configuration is invalid or
//! the database is unreachable at startup.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tracing::{error, info};

use tds_bridge::config::Settings;
use tds_bridge::protocol::STARTUP_LINE;
use tds_bridge::worker::{init_worker_logging, write_error_line, OutputSink, TdsDriver, Worker};

/// Grace period for the blocking stdin reader at exit.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            write_error_line(&format!("Failed to start runtime: {}", e));
            return ExitCode::FAILURE;
        }
    };

    let code = runtime.block_on(run(args));
    // A stdin read can stay blocked after a signal; do not wait on it.
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
    code
}

async fn run(args: Vec<String>) -> ExitCode {
    let settings = match Settings::from_worker_args(&args) {
        Ok(settings) => settings,
        Err(e) => {
            write_error_line(&e.to_string());
            return ExitCode::FAILURE;
        }
    };

    let (sink, _writer) = OutputSink::spawn(tokio::io::stdout());
    if let Err(e) = init_worker_logging(sink.clone(), settings.worker.logs) {
        write_error_line(&format!("Failed to initialize logging: {}", e));
        return ExitCode::FAILURE;
    }

    if let Err(e) = settings.validate() {
        write_error_line(&e.to_string());
        return ExitCode::FAILURE;
    }
    let database = settings.database.clone();

    let target = database.describe();
    let driver = Arc::new(TdsDriver::new(database));
    let worker = match Worker::start(driver, &settings.pool).await {
        Ok(worker) => worker,
        Err(e) => {
            error!("Failed to connect to {}: {}", target, e);
            // The subscriber may be filtered off; the host must still see why.
            if !settings.worker.logs {
                write_error_line(&format!("Failed to connect to {}: {}", target, e));
            }
            return ExitCode::FAILURE;
        }
    };

    sink.send_line(STARTUP_LINE);
    info!("Connected to {}", target);
    info!("Ready to process SQL requests");

    let maintenance = worker.start_maintenance();
    let served = worker
        .serve(BufReader::new(tokio::io::stdin()), sink.clone(), shutdown_signal())
        .await;

    maintenance.abort();
    worker.shutdown().await;
    sink.flush().await;

    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            write_error_line(&format!("Failed to read requests: {}", e));
            ExitCode::FAILURE
        }
    }
}

/// Resolves on Ctrl-C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
