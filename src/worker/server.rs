//! The worker's request loop.
//!
//! Reads one request per line, runs each on its own task, and writes each
//! response as one line through the [`OutputSink`]. Requests with a
//! transaction id run on that transaction's dedicated connection; all others
//! borrow from the stateless pool.
//!
//! No request can take the worker down: pool, driver and protocol failures
//! all become an `error` in that request's response.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::driver::{Connection, Driver};
use super::error::{DriverError, PoolError, PoolResult};
use super::output::OutputSink;
use super::pool::{ConnectionPool, PoolConfig};
use super::transaction::TransactionPool;
use crate::config::PoolSettings;
use crate::protocol::{self, ErrorCode, ProtocolError, QueryRequest, QueryResponse};
use crate::rows::ResultSet;

/// Why a single request failed.
#[derive(Debug, thiserror::Error)]
enum ExecError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("statement timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}

impl ExecError {
    fn code(&self) -> ErrorCode {
        match self {
            Self::Pool(e) => e.error_code(),
            Self::Driver(e) => e.error_code(),
            Self::Timeout(_) => ErrorCode::Timeout,
        }
    }
}

struct WorkerInner<D: Driver> {
    pool: ConnectionPool<D>,
    transactions: TransactionPool<D>,
}

/// Both connection pools plus the logic that routes requests to them.
pub struct Worker<D: Driver> {
    inner: Arc<WorkerInner<D>>,
}

impl<D: Driver> Clone for Worker<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Driver> Worker<D> {
    /// Open both pools. Either pool failing to reach its initial size fails
    /// the whole start.
    pub async fn start(driver: Arc<D>, settings: &PoolSettings) -> PoolResult<Self> {
        let pool = ConnectionPool::new(Arc::clone(&driver), PoolConfig::from(settings)).await?;
        let transactions = match TransactionPool::new(
            driver,
            settings.transaction_connections as usize,
            settings.connection_timeout.get(),
        )
        .await
        {
            Ok(transactions) => transactions,
            Err(e) => {
                pool.shutdown().await;
                return Err(e);
            }
        };

        Ok(Self {
            inner: Arc::new(WorkerInner { pool, transactions }),
        })
    }

    pub fn pool(&self) -> &ConnectionPool<D> {
        &self.inner.pool
    }

    pub fn transactions(&self) -> &TransactionPool<D> {
        &self.inner.transactions
    }

    /// Start the stateless pool's periodic maintenance.
    pub fn start_maintenance(&self) -> JoinHandle<()> {
        self.inner.pool.spawn_maintenance()
    }

    /// Serve requests from `input` until it closes or `shutdown` resolves,
    /// then wait for the requests already running.
    pub async fn serve<R, F>(&self, input: R, sink: OutputSink, shutdown: F) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        F: Future<Output = ()>,
    {
        let mut lines = input.lines();
        let mut tasks = JoinSet::new();
        let mut read_error = None;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting requests");
                    break;
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.dispatch(&line, &sink, &mut tasks),
                    Ok(None) => {
                        debug!("Input closed");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to read request");
                        read_error = Some(e);
                        break;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Request task failed");
                    }
                }
            }
        }

        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), "Waiting for in-flight requests");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Request task failed");
            }
        }
        sink.flush().await;

        match read_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn dispatch(&self, line: &str, sink: &OutputSink, tasks: &mut JoinSet<()>) {
        if line.trim().is_empty() {
            return;
        }

        let request = match protocol::parse_request(line) {
            Ok(request) => request,
            Err(ProtocolError::InvalidRequest { msg_id, reason }) => {
                warn!(msg_id, reason = %reason, "Rejecting invalid request");
                respond(
                    sink,
                    QueryResponse::failure(msg_id, ErrorCode::InvalidRequest, reason),
                );
                return;
            }
            Err(e) => {
                warn!(error = %e, line = %line, "Ignoring unanswerable request line");
                return;
            }
        };

        let worker = self.clone();
        let sink = sink.clone();
        tasks.spawn(async move {
            let response = worker.handle(request).await;
            respond(&sink, response);
        });
    }

    /// Run one request and build its response.
    pub async fn handle(&self, request: QueryRequest) -> QueryResponse {
        let limit = request.statement_timeout();
        debug!(
            msg_id = request.msg_id,
            trans_id = request.trans_id,
            finish = request.finish_trans,
            sql = %request.sql,
            "Executing request"
        );

        let outcome = match request.transaction() {
            Some(trans_id) => {
                self.run_in_transaction(trans_id, request.finish_trans, &request.sql, limit)
                    .await
            }
            None => self.run_stateless(&request.sql, limit).await,
        };

        let stats = self.inner.pool.stats();
        debug!(
            idle = stats.idle,
            active = stats.active,
            total = stats.total,
            waiting = stats.waiting,
            "Pool stats"
        );

        match outcome {
            Ok(result) => QueryResponse::success(request.msg_id, result),
            Err(e) => {
                warn!(msg_id = request.msg_id, error = %e, "Request failed");
                QueryResponse::failure(request.msg_id, e.code(), e.to_string())
            }
        }
    }

    async fn run_stateless(&self, sql: &str, limit: Duration) -> Result<Vec<ResultSet>, ExecError> {
        let mut conn = self.inner.pool.acquire().await?;
        match tokio::time::timeout(limit, conn.execute(sql)).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                conn.discard();
                Err(ExecError::Timeout(limit))
            }
        }
    }

    /// Run `sql` on the connection bound to `trans_id`. A failed statement
    /// is rolled back; `finish` releases the binding either way.
    async fn run_in_transaction(
        &self,
        trans_id: i64,
        finish: bool,
        sql: &str,
        limit: Duration,
    ) -> Result<Vec<ResultSet>, ExecError> {
        let shared = match self.inner.transactions.get_connection(trans_id).await {
            Ok(shared) => shared,
            Err(e) => {
                if finish {
                    self.inner.transactions.release_connection(trans_id).await;
                }
                return Err(e.into());
            }
        };

        let outcome = {
            let mut conn = shared.lock().await;
            let outcome = match tokio::time::timeout(limit, conn.execute(sql)).await {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(e)) => Err(ExecError::Driver(e)),
                Err(_) => Err(ExecError::Timeout(limit)),
            };
            if outcome.is_err() {
                if let Err(e) = conn.rollback().await {
                    warn!(trans_id, error = %e, "Rollback failed");
                }
            }
            outcome
        };
        drop(shared);

        if finish {
            self.inner.transactions.release_connection(trans_id).await;
        }
        outcome
    }

    /// Close both pools.
    pub async fn shutdown(&self) {
        self.inner.pool.shutdown().await;
        self.inner.transactions.shutdown().await;
        info!("Connection pools closed");
    }
}

fn respond(sink: &OutputSink, response: QueryResponse) {
    match protocol::encode(&response) {
        Ok(line) => {
            if !sink.send_line(line) {
                warn!(msg_id = response.msg_id, "Output closed, dropping response");
            }
        }
        Err(e) => error!(msg_id = response.msg_id, error = %e, "Failed to encode response"),
    }
}
