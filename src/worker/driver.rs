//! Database driver seam.
//!
//! The worker's pools and request loop only see these traits. The production
//! binary plugs in [`TdsDriver`](super::TdsDriver); tests use
//! [`ScriptedDriver`](super::ScriptedDriver).

use async_trait::async_trait;

use super::error::DriverResult;
use crate::rows::ResultSet;

/// Opens database connections.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    type Connection: Connection;

    /// Open a new connection.
    async fn connect(&self) -> DriverResult<Self::Connection>;
}

/// A single open database connection.
#[async_trait]
pub trait Connection: Send + Sized + 'static {
    /// Run `sql` and drain every result set it produces, in order.
    ///
    /// Temporal columns come back as ISO-8601 text and SQL `NULL` as an
    /// explicit null value.
    async fn execute(&mut self, sql: &str) -> DriverResult<Vec<ResultSet>>;

    /// Cheap liveness check.
    async fn ping(&mut self) -> DriverResult<()> {
        self.execute("SELECT 1").await.map(|_| ())
    }

    /// Roll back any open transaction on this connection.
    async fn rollback(&mut self) -> DriverResult<()>;

    /// Close the connection.
    async fn close(self) -> DriverResult<()>;

    /// Whether the connection is known to be unusable.
    fn is_broken(&self) -> bool;
}

/// Close `conn` without waiting for it, off the caller's task.
///
/// Outside a runtime the connection is simply dropped.
pub(crate) fn close_detached<C: Connection>(conn: C) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = conn.close().await {
                    tracing::debug!(error = %e, "Error closing connection");
                }
            });
        }
        Err(_) => drop(conn),
    }
}
