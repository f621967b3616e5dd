//! Transaction handles.

use std::time::Duration;

use tracing::warn;

use super::client::Bridge;
use super::error::BridgeResult;
use crate::rows::Rows;

/// A transaction id bound to one worker connection.
///
/// Every statement issued through the handle runs on the same database
/// session. [`Transaction::finish`] sends the last statement (typically
/// `COMMIT`) and releases the session.
pub struct Transaction<'a> {
    bridge: &'a Bridge,
    id: i64,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(bridge: &'a Bridge, id: i64) -> Self {
        Self {
            bridge,
            id,
            finished: false,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// Run a statement and keep the session bound.
    pub async fn execute(&mut self, sql: &str) -> BridgeResult<Rows> {
        self.execute_with_timeout(sql, self.bridge.request_timeout())
            .await
    }

    pub async fn execute_with_timeout(&mut self, sql: &str, timeout: Duration) -> BridgeResult<Rows> {
        self.bridge.execute(sql, Some(self.id), false, timeout).await
    }

    /// Run the final statement and release the session, even if it fails.
    pub async fn finish(mut self, sql: &str) -> BridgeResult<Rows> {
        self.finished = true;
        self.bridge
            .execute(sql, Some(self.id), true, self.bridge.request_timeout())
            .await
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished && self.bridge.is_connected() {
            warn!(
                trans_id = self.id,
                "Transaction dropped without finish; its worker connection stays leased"
            );
        }
    }
}
