//! Host-side bridge client.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::{BridgeError, BridgeResult};
use super::locate::locate_worker;
use super::monitor::{monitor_loop, MonitorExit};
use super::router::{dispatch_loop, Router};
use super::supervisor::{spawn_worker, Supervisor, WorkerCommand};
use super::transaction::Transaction;
use crate::config::{Settings, WorkerSettings};
use crate::protocol::{self, QueryRequest};
use crate::rows::{ResultSet, Row, Rows};

type WorkerInput = BufWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// Host-side knobs for a bridge.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// The worker was started with diagnostics on; skip the handshake.
    pub logs: bool,

    /// Bound on waiting for the startup confirmation line.
    pub handshake_timeout: Duration,

    /// Timeout used by the convenience query methods.
    pub request_timeout: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self::from(&WorkerSettings::default())
    }
}

impl From<&WorkerSettings> for BridgeOptions {
    fn from(worker: &WorkerSettings) -> Self {
        Self {
            logs: worker.logs,
            handshake_timeout: worker.handshake_timeout.get(),
            request_timeout: worker.request_timeout.get(),
        }
    }
}

struct Shared {
    router: Arc<Router>,
    input: Mutex<Option<WorkerInput>>,
    connected: AtomicBool,
    supervisor: Supervisor,
    next_msg_id: AtomicI64,
    next_trans_id: AtomicI64,
    options: BridgeOptions,
}

impl Shared {
    /// Tear the bridge down. Every pending waiter resolves with
    /// `Disconnected`; later calls are no-ops.
    fn teardown(&self, reason: &str) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }

        let abandoned = self.router.close_all();
        if abandoned > 0 {
            warn!(reason, abandoned, "Worker disconnected with requests in flight");
        } else {
            info!(reason, "Worker disconnected");
        }

        // A writer holding the lock sees `connected == false` on its next call.
        if let Ok(mut input) = self.input.try_lock() {
            input.take();
        }
        self.supervisor.terminate();
    }

    async fn write_line(&self, line: &str) -> BridgeResult<()> {
        let mut guard = self.input.lock().await;
        let input = guard.as_mut().ok_or(BridgeError::Disconnected)?;
        input
            .write_all(line.as_bytes())
            .await
            .map_err(BridgeError::WriteFailed)?;
        input.flush().await.map_err(BridgeError::WriteFailed)
    }
}

/// Connection to a worker process.
///
/// Requests may be issued concurrently from many tasks; each one is matched
/// to its response by id. Dropping the bridge kills the worker.
///
/// # Example
///
/// ```ignore
/// let settings = Settings::load()?;
/// let bridge = Bridge::connect(&settings).await?;
///
/// let row = bridge.query_first("SELECT @@version AS version").await?;
/// println!("{}", row.get::<String>("version")?);
/// ```
pub struct Bridge {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge").finish_non_exhaustive()
    }
}

impl Bridge {
    /// Locate, spawn and handshake with a worker configured from `settings`.
    pub async fn connect(settings: &Settings) -> BridgeResult<Self> {
        let program = locate_worker(settings)?;
        let command = WorkerCommand::new(program).args(settings.to_worker_args()?);
        Self::launch(command, BridgeOptions::from(&settings.worker)).await
    }

    /// Spawn `command` as the worker.
    pub async fn launch(command: WorkerCommand, options: BridgeOptions) -> BridgeResult<Self> {
        let process = spawn_worker(&command, options.logs, options.handshake_timeout).await?;
        Ok(Self::assemble(
            Box::new(process.stdin),
            process.stdout,
            process.stderr,
            Some(process.child),
            options,
        ))
    }

    /// Attach to a worker reachable through arbitrary streams, without a
    /// handshake. Must be called inside a Tokio runtime.
    pub fn from_streams<W, R, E>(writer: W, reader: R, stderr: E, options: BridgeOptions) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncBufRead + Send + Unpin + 'static,
        E: AsyncBufRead + Send + Unpin + 'static,
    {
        Self::assemble(Box::new(writer), reader, stderr, None, options)
    }

    fn assemble<R, E>(
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        reader: R,
        stderr: E,
        child: Option<Child>,
        options: BridgeOptions,
    ) -> Self
    where
        R: AsyncBufRead + Send + Unpin + 'static,
        E: AsyncBufRead + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            router: Arc::new(Router::new()),
            input: Mutex::new(Some(BufWriter::new(writer))),
            connected: AtomicBool::new(true),
            supervisor: Supervisor::new(child),
            next_msg_id: AtomicI64::new(1),
            next_trans_id: AtomicI64::new(1),
            options,
        });

        // Tasks hold weak references so dropping the bridge tears it down.
        let router = Arc::clone(&shared.router);
        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let reader_task = tokio::spawn(async move {
            dispatch_loop(reader, &router).await;
            if let Some(shared) = weak.upgrade() {
                shared.teardown("worker output closed");
            }
        });

        let weak = Arc::downgrade(&shared);
        let monitor_task = tokio::spawn(async move {
            if let MonitorExit::Fault(line) = monitor_loop(stderr).await {
                if let Some(shared) = weak.upgrade() {
                    shared.teardown(&format!("unexpected worker stderr output: {}", line));
                }
            }
        });

        shared.supervisor.track(reader_task);
        shared.supervisor.track(monitor_task);

        Self { shared }
    }

    /// Run `sql` and wait at most `timeout` for the result.
    ///
    /// With `transaction` set, the statement runs on the worker connection
    /// bound to that id; `finish` releases the binding afterwards.
    pub async fn execute(
        &self,
        sql: &str,
        transaction: Option<i64>,
        finish: bool,
        timeout: Duration,
    ) -> BridgeResult<Rows> {
        self.execute_raw(sql, transaction, finish, timeout)
            .await
            .map(Rows::new)
    }

    async fn execute_raw(
        &self,
        sql: &str,
        transaction: Option<i64>,
        finish: bool,
        timeout: Duration,
    ) -> BridgeResult<Vec<ResultSet>> {
        if !self.is_connected() {
            return Err(BridgeError::Disconnected);
        }

        let msg_id = self.shared.next_msg_id.fetch_add(1, Ordering::Relaxed);
        let mut request = QueryRequest::new(msg_id, sql).with_timeout(timeout);
        if let Some(trans_id) = transaction {
            request = request.in_transaction(trans_id, finish);
        }
        let line = protocol::encode(&request).map_err(|e| BridgeError::Protocol(e.to_string()))?;

        // Register before writing so a fast response always finds its waiter.
        let rx = self.shared.router.register(msg_id)?;
        if let Err(e) = self.shared.write_line(&line).await {
            self.shared.router.abandon(msg_id);
            return Err(e);
        }
        debug!(msg_id, ?transaction, finish, "Sent request");

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(delivered) => delivered??,
            Err(_) => {
                self.shared.router.abandon(msg_id);
                return Err(BridgeError::Timeout(timeout));
            }
        };

        match response.error_text() {
            Some(text) if response.result.is_empty() => {
                Err(BridgeError::from_worker(response.error_code, text))
            }
            Some(text) => {
                warn!(msg_id, error = text, "Worker returned results alongside an error");
                Ok(response.result)
            }
            None => Ok(response.result),
        }
    }

    /// Run `sql` outside any transaction and return every result set.
    pub async fn raw_query(&self, sql: &str) -> BridgeResult<Vec<ResultSet>> {
        self.execute_raw(sql, None, true, self.request_timeout())
            .await
    }

    /// Run `sql` and return its first row.
    pub async fn query_first(&self, sql: &str) -> BridgeResult<Row> {
        self.execute(sql, None, true, self.request_timeout())
            .await?
            .next()
            .ok_or(BridgeError::NoRows)
    }

    /// Run `sql` and feed each row to `callback` in order, stopping at the
    /// callback's first error.
    pub async fn query<F, E>(&self, sql: &str, callback: F) -> Result<(), E>
    where
        F: FnMut(Row) -> Result<(), E>,
        E: From<BridgeError>,
    {
        let rows = self.execute(sql, None, true, self.request_timeout()).await?;
        rows.try_for_each_row(callback)
    }

    /// Run a statement, discarding any rows.
    pub async fn exec(&self, sql: &str) -> BridgeResult<()> {
        self.execute_raw(sql, None, true, self.request_timeout())
            .await
            .map(|_| ())
    }

    /// Start a transaction with a fresh id. No SQL is sent until the first
    /// statement; `BEGIN TRANSACTION` is the caller's to issue.
    pub fn begin_transaction(&self) -> Transaction<'_> {
        let id = self.shared.next_trans_id.fetch_add(1, Ordering::Relaxed);
        Transaction::new(self, id)
    }

    /// Tear the bridge down and kill the worker. Idempotent.
    pub async fn disconnect(&self) {
        self.shared.teardown("disconnect requested");
        self.shared.input.lock().await.take();
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.router.pending()
    }

    /// Default timeout of the convenience methods.
    pub fn request_timeout(&self) -> Duration {
        self.shared.options.request_timeout
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shared.teardown("bridge dropped");
    }
}
