//! Transaction-affinity pool.
//!
//! Every statement of a transaction must run on the same connection. The pool
//! maps a host-assigned transaction id to its dedicated connection and keeps a
//! small reserve of spare connections so a new transaction rarely waits for a
//! login.
//!
//! A connection is either a spare or bound to exactly one transaction. Once
//! released, a transaction's connection is closed rather than reused, so no
//! session state leaks into the next transaction.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::driver::{Connection, Driver};
use super::error::{PoolError, PoolResult};

/// A transaction's connection, shared by its in-flight statements.
pub type SharedConnection<C> = Arc<Mutex<C>>;

struct TransactionState<C> {
    spares: VecDeque<C>,
    active: HashMap<i64, SharedConnection<C>>,
    closed: bool,
}

/// Maps transaction ids to dedicated connections.
///
/// All operations run under one lock, including opening and closing
/// connections, so the spare list and the map never disagree.
pub struct TransactionPool<D: Driver> {
    driver: Arc<D>,
    spare_target: usize,
    connection_timeout: Duration,
    state: Mutex<TransactionState<D::Connection>>,
}

impl<D: Driver> TransactionPool<D> {
    /// Create the pool and open `spare_target` spare connections.
    pub async fn new(
        driver: Arc<D>,
        spare_target: usize,
        connection_timeout: Duration,
    ) -> PoolResult<Self> {
        let pool = Self {
            driver,
            spare_target,
            connection_timeout,
            state: Mutex::new(TransactionState {
                spares: VecDeque::with_capacity(spare_target),
                active: HashMap::new(),
                closed: false,
            }),
        };

        {
            let mut state = pool.state.lock().await;
            while state.spares.len() < spare_target {
                match pool.open().await {
                    Ok(conn) => state.spares.push_back(conn),
                    Err(e) => {
                        for conn in state.spares.drain(..) {
                            let _ = conn.close().await;
                        }
                        return Err(e);
                    }
                }
            }
        }

        debug!(spares = spare_target, "Transaction pool ready");
        Ok(pool)
    }

    async fn open(&self) -> PoolResult<D::Connection> {
        match tokio::time::timeout(self.connection_timeout, self.driver.connect()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(PoolError::Connect(e)),
            Err(_) => Err(PoolError::Exhausted(self.connection_timeout)),
        }
    }

    /// Connection bound to `trans_id`, binding one first if needed.
    ///
    /// Repeated calls for the same id return the same connection until
    /// [`TransactionPool::release_connection`]. A new binding takes the oldest
    /// spare, or opens a connection when none is left.
    pub async fn get_connection(&self, trans_id: i64) -> PoolResult<SharedConnection<D::Connection>> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(PoolError::Closed);
        }

        if let Some(conn) = state.active.get(&trans_id) {
            return Ok(Arc::clone(conn));
        }

        let conn = match state.spares.pop_front() {
            Some(conn) => conn,
            None => {
                debug!(trans_id, "No spare connection, opening one");
                self.open().await?
            }
        };

        let shared = Arc::new(Mutex::new(conn));
        state.active.insert(trans_id, Arc::clone(&shared));
        debug!(
            trans_id,
            active = state.active.len(),
            spares = state.spares.len(),
            "Bound connection to transaction"
        );
        Ok(shared)
    }

    /// Unbind and close the connection of `trans_id`, then top the spares
    /// back up by one if they are below target.
    ///
    /// Returns whether `trans_id` was bound. Failing to open the replacement
    /// is logged, not returned.
    pub async fn release_connection(&self, trans_id: i64) -> bool {
        let mut state = self.state.lock().await;
        let Some(shared) = state.active.remove(&trans_id) else {
            return false;
        };

        match Arc::try_unwrap(shared) {
            Ok(conn) => {
                if let Err(e) = conn.into_inner().close().await {
                    debug!(trans_id, error = %e, "Error closing transaction connection");
                }
            }
            // A statement of this transaction still holds the connection; it
            // closes when that statement finishes with it.
            Err(_) => debug!(trans_id, "Transaction connection still in use, dropping"),
        }

        if !state.closed && state.spares.len() < self.spare_target {
            match self.open().await {
                Ok(conn) => state.spares.push_back(conn),
                Err(e) => warn!(trans_id, error = %e, "Failed to replenish transaction pool"),
            }
        }

        debug!(
            trans_id,
            active = state.active.len(),
            spares = state.spares.len(),
            "Released transaction connection"
        );
        true
    }

    /// Spare connections ready for new transactions.
    pub async fn available_count(&self) -> usize {
        self.state.lock().await.spares.len()
    }

    /// Transactions currently holding a connection.
    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active.len()
    }

    /// Close spares and every bound connection. Further calls to
    /// [`TransactionPool::get_connection`] fail with [`PoolError::Closed`].
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;

        let bound = state.active.len();
        if bound > 0 {
            warn!(count = bound, "Closing connections of unfinished transactions");
        }

        for conn in state.spares.drain(..) {
            let _ = conn.close().await;
        }
        for (_, shared) in state.active.drain() {
            if let Ok(conn) = Arc::try_unwrap(shared) {
                let _ = conn.into_inner().close().await;
            }
        }
        debug!("Transaction pool shut down");
    }
}
