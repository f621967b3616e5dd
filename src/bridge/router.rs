//! Response routing.
//!
//! The router owns the table of pending waiters. A waiter is registered before
//! its request is written and removed by exactly one of: the matching
//! response, the caller abandoning it after a timeout, or the bridge closing.
//! All three happen under the same lock, so a waiter is never resolved twice.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use super::error::{BridgeError, BridgeResult};
use super::monitor::log_diagnostic;
use crate::protocol::{self, Message, QueryResponse};

type Waiter = oneshot::Sender<BridgeResult<QueryResponse>>;

/// Receiving half handed to a caller by [`Router::register`].
pub type ResponseReceiver = oneshot::Receiver<BridgeResult<QueryResponse>>;

struct RouterState {
    waiters: HashMap<i64, Waiter>,
    closed: bool,
}

/// Table of requests awaiting a response.
pub struct Router {
    state: Mutex<RouterState>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RouterState {
                waiters: HashMap::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter for `msg_id`.
    ///
    /// Fails with [`BridgeError::Disconnected`] once the router is closed and
    /// with [`BridgeError::Protocol`] if `msg_id` is already in flight.
    pub fn register(&self, msg_id: i64) -> BridgeResult<ResponseReceiver> {
        let mut state = self.lock();
        if state.closed {
            return Err(BridgeError::Disconnected);
        }
        if state.waiters.contains_key(&msg_id) {
            return Err(BridgeError::Protocol(format!(
                "request id {} is already in flight",
                msg_id
            )));
        }

        let (tx, rx) = oneshot::channel();
        state.waiters.insert(msg_id, tx);
        Ok(rx)
    }

    /// Deliver `response` to its waiter. Returns `false` when no waiter
    /// matched (unknown, finished or abandoned id).
    pub fn fulfil(&self, response: QueryResponse) -> bool {
        let waiter = self.lock().waiters.remove(&response.msg_id);
        match waiter {
            // A closed receiver means the caller gave up between its timeout
            // and the abandon call; nothing else to do.
            Some(tx) => {
                let _ = tx.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Stop waiting for `msg_id`. A response arriving later is discarded.
    pub fn abandon(&self, msg_id: i64) -> bool {
        self.lock().waiters.remove(&msg_id).is_some()
    }

    /// Resolve every pending waiter with [`BridgeError::Disconnected`] and
    /// refuse new registrations. Returns how many waiters were resolved.
    pub fn close_all(&self) -> usize {
        let waiters: Vec<Waiter> = {
            let mut state = self.lock();
            state.closed = true;
            state.waiters.drain().map(|(_, tx)| tx).collect()
        };

        let count = waiters.len();
        for tx in waiters {
            let _ = tx.send(Err(BridgeError::Disconnected));
        }
        count
    }

    /// Requests currently awaiting a response.
    pub fn pending(&self) -> usize {
        self.lock().waiters.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Handle one line from the worker's stdout.
    pub fn route_line(&self, line: &str) {
        if line.trim().is_empty() || log_diagnostic(line) {
            return;
        }

        match protocol::decode(line) {
            Ok(Message::Response(response)) => {
                let msg_id = response.msg_id;
                if !self.fulfil(response) {
                    warn!(msg_id, "Discarding response with no waiting request");
                }
            }
            Ok(Message::Request(request)) => {
                warn!(msg_id = request.msg_id, "Worker echoed a request line, ignoring")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, line = %line, "Dropping malformed line from worker"),
        }
    }
}

/// Read worker stdout until it closes, routing every line.
pub(crate) async fn dispatch_loop<R>(reader: R, router: &Router)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => router.route_line(&line),
            Ok(None) => {
                debug!("Worker stdout closed");
                break;
            }
            Err(e) => {
                error!(error = %e, "Failed to read worker stdout");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rows::Row;

    fn response(msg_id: i64) -> QueryResponse {
        QueryResponse::success(msg_id, vec![vec![Row::new().with("id", msg_id)]])
    }

    #[tokio::test]
    async fn test_fulfil_delivers_to_matching_waiter() {
        let router = Router::new();
        let rx1 = router.register(1).unwrap();
        let rx2 = router.register(2).unwrap();

        assert!(router.fulfil(response(2)));
        assert!(router.fulfil(response(1)));

        assert_eq!(rx1.await.unwrap().unwrap().msg_id, 1);
        assert_eq!(rx2.await.unwrap().unwrap().msg_id, 2);
        assert_eq!(router.pending(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_response_is_discarded() {
        let router = Router::new();
        let rx = router.register(5).unwrap();

        assert!(router.fulfil(response(5)));
        assert!(!router.fulfil(response(5)));
        assert_eq!(rx.await.unwrap().unwrap(), response(5));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let router = Router::new();
        let _rx = router.register(3).unwrap();
        assert!(matches!(router.register(3), Err(BridgeError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_abandoned_waiter_ignores_late_response() {
        let router = Router::new();
        let rx = router.register(9).unwrap();

        assert!(router.abandon(9));
        assert!(!router.fulfil(response(9)));
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_close_all_resolves_with_disconnected() {
        let router = Router::new();
        let rx1 = router.register(1).unwrap();
        let rx2 = router.register(2).unwrap();

        assert_eq!(router.close_all(), 2);
        assert!(matches!(rx1.await.unwrap(), Err(BridgeError::Disconnected)));
        assert!(matches!(rx2.await.unwrap(), Err(BridgeError::Disconnected)));
        assert!(matches!(router.register(3), Err(BridgeError::Disconnected)));
        assert_eq!(router.close_all(), 0);
    }

    #[tokio::test]
    async fn test_route_line_ignores_diagnostics_and_garbage() {
        let router = Router::new();
        let rx = router.register(1).unwrap();

        router.route_line("TDSLOG: {\"msgId\":1,\"result\":[]}");
        router.route_line("TDSERROR: pool running low");
        router.route_line("{not json");
        assert_eq!(router.pending(), 1);

        router.route_line(r#"{"msgId":1,"result":[[{"":1}]]}"#);
        let delivered = rx.await.unwrap().unwrap();
        assert_eq!(delivered.result[0].len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_loop_routes_until_eof() {
        let router = Router::new();
        let rx = router.register(4).unwrap();
        let input: &[u8] = b"TDSLOG: hello\n{\"msgId\":4,\"result\":[]}\n";

        dispatch_loop(input, &router).await;
        assert_eq!(rx.await.unwrap().unwrap().msg_id, 4);
    }
}
