//! In-memory driver with canned answers.
//!
//! Used by the test suites and for running the worker without a database.
//! Every connection gets a numeric id so tests can check which connection ran
//! which statement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::driver::{Connection, Driver};
use super::error::{DriverError, DriverResult};
use crate::rows::{ResultSet, Row};

#[derive(Debug, Clone)]
enum Outcome {
    Results(Vec<ResultSet>),
    Error(String),
    /// Fail and leave the connection unusable.
    Disconnect(String),
}

#[derive(Debug, Clone)]
struct Script {
    outcome: Outcome,
    delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct ScriptState {
    scripts: Mutex<HashMap<String, Script>>,
    latency: Mutex<Duration>,
    connect_failure: Mutex<Option<String>>,
    executed: Mutex<Vec<(usize, String)>>,
    next_id: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    rollbacks: AtomicUsize,
    pings_fail: AtomicBool,
}

impl ScriptState {
    fn script_for(&self, sql: &str) -> Option<Script> {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sql.trim())
            .cloned()
    }

    fn latency(&self) -> Duration {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Driver answering from a table of scripted statements.
///
/// `SELECT 1` is scripted out of the box and returns one row with a single
/// unnamed column. Statements without a script succeed with no result sets.
#[derive(Debug, Clone)]
pub struct ScriptedDriver {
    state: Arc<ScriptState>,
}

impl Default for ScriptedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedDriver {
    pub fn new() -> Self {
        let driver = Self {
            state: Arc::new(ScriptState::default()),
        };
        driver.script("SELECT 1", Outcome::Results(vec![vec![Row::new().with("", 1)]]));
        driver
    }

    fn script(&self, sql: &str, outcome: Outcome) {
        self.state
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                sql.trim().to_string(),
                Script {
                    outcome,
                    delay: None,
                },
            );
    }

    /// Answer `sql` with these result sets.
    pub fn with_results(self, sql: &str, result_sets: Vec<ResultSet>) -> Self {
        self.script(sql, Outcome::Results(result_sets));
        self
    }

    /// Answer `sql` with a single result set.
    pub fn with_rows(self, sql: &str, rows: ResultSet) -> Self {
        self.with_results(sql, vec![rows])
    }

    /// Fail `sql` with `message`.
    pub fn with_error(self, sql: &str, message: &str) -> Self {
        self.script(sql, Outcome::Error(message.to_string()));
        self
    }

    /// Fail `sql` with `message` and break the connection that ran it.
    pub fn with_disconnect(self, sql: &str, message: &str) -> Self {
        self.script(sql, Outcome::Disconnect(message.to_string()));
        self
    }

    /// Delay `sql` by `delay` before answering. Scripts it as an empty
    /// success if it had no script yet.
    pub fn with_delay(self, sql: &str, delay: Duration) -> Self {
        let mut scripts = self
            .state
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        scripts
            .entry(sql.trim().to_string())
            .or_insert(Script {
                outcome: Outcome::Results(Vec::new()),
                delay: None,
            })
            .delay = Some(delay);
        drop(scripts);
        self
    }

    /// Delay every statement by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self
            .state
            .latency
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = latency;
        self
    }

    /// Make `connect` fail with `message`, or succeed again with `None`.
    pub fn set_connect_failure(&self, message: Option<&str>) {
        *self
            .state
            .connect_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = message.map(str::to_string);
    }

    /// Make every ping fail.
    pub fn set_ping_failure(&self, fail: bool) {
        self.state.pings_fail.store(fail, Ordering::SeqCst);
    }

    /// Connections opened so far.
    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    /// Connections closed or dropped so far.
    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Connections currently open.
    pub fn open_connections(&self) -> usize {
        self.opened().saturating_sub(self.closed())
    }

    /// Rollbacks issued so far.
    pub fn rollbacks(&self) -> usize {
        self.state.rollbacks.load(Ordering::SeqCst)
    }

    /// Every executed statement with the id of the connection that ran it.
    pub fn executed(&self) -> Vec<(usize, String)> {
        self.state
            .executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Id of the connection that ran `sql` most recently.
    pub fn connection_for(&self, sql: &str) -> Option<usize> {
        self.executed()
            .into_iter()
            .rev()
            .find(|(_, executed)| executed == sql)
            .map(|(id, _)| id)
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    type Connection = ScriptedConnection;

    async fn connect(&self) -> DriverResult<ScriptedConnection> {
        let failure = self
            .state
            .connect_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(message) = failure {
            return Err(DriverError::Connect(message));
        }

        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedConnection {
            id,
            state: Arc::clone(&self.state),
            broken: false,
        })
    }
}

/// Connection handed out by [`ScriptedDriver`].
#[derive(Debug)]
pub struct ScriptedConnection {
    id: usize,
    state: Arc<ScriptState>,
    broken: bool,
}

impl ScriptedConnection {
    pub fn id(&self) -> usize {
        self.id
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn execute(&mut self, sql: &str) -> DriverResult<Vec<ResultSet>> {
        if self.broken {
            return Err(DriverError::Closed);
        }

        self.state
            .executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((self.id, sql.to_string()));

        let script = self.state.script_for(sql);
        let delay = self.state.latency() + script.as_ref().and_then(|s| s.delay).unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match script.map(|s| s.outcome) {
            None => Ok(Vec::new()),
            Some(Outcome::Results(result_sets)) => Ok(result_sets),
            Some(Outcome::Error(message)) => Err(DriverError::Query(message)),
            Some(Outcome::Disconnect(message)) => {
                self.broken = true;
                Err(DriverError::Query(message))
            }
        }
    }

    async fn ping(&mut self) -> DriverResult<()> {
        if self.broken || self.state.pings_fail.load(Ordering::SeqCst) {
            return Err(DriverError::Closed);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        if self.broken {
            return Err(DriverError::Closed);
        }
        Ok(())
    }

    async fn close(self) -> DriverResult<()> {
        Ok(())
    }

    fn is_broken(&self) -> bool {
        self.broken
    }
}

impl Drop for ScriptedConnection {
    fn drop(&mut self) {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}
