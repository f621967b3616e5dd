//! Stateless connection pool.
//!
//! Serves non-transactional requests. A connection is borrowed for one
//! statement and handed back when the [`PooledConnection`] guard drops.
//!
//! ```text
//!   acquire() ──► permit (≤ max) ──► idle connection ──► ping if stale ──► guard
//!                                     └─ none idle ──► driver.connect() ─┘
//!   drop(guard) ──► back to idle, or closed when broken / expired / over max
//! ```
//!
//! Permits bound the number of connections lent out. The idle list sits
//! behind one lock that is never held across an await.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::driver::{close_detached, Connection, Driver};
use super::error::{DriverError, DriverResult, PoolError, PoolResult};
use crate::config::PoolSettings;
use crate::rows::ResultSet;

/// Shortest maintenance interval, whatever the keepalive setting.
const MIN_MAINTENANCE_INTERVAL: Duration = Duration::from_millis(100);

/// Sizing and timing of a [`ConnectionPool`].
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    pub connection_timeout: Duration,
    pub idle_timeout: Duration,
    pub keepalive_time: Duration,
    pub max_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&PoolSettings::default())
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            min_connections: settings.min_connections as usize,
            max_connections: settings.max_connections.max(1) as usize,
            connection_timeout: settings.connection_timeout.get(),
            idle_timeout: settings.idle_timeout.get(),
            keepalive_time: settings.keepalive_time.get(),
            max_lifetime: settings.max_lifetime.get(),
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub idle: usize,
    pub active: usize,
    pub total: usize,
    pub waiting: usize,
}

struct IdleConnection<C> {
    conn: C,
    created: Instant,
    idle_since: Instant,
}

struct PoolState<C> {
    idle: VecDeque<IdleConnection<C>>,
    active: usize,
    opening: usize,
    closed: bool,
}

impl<C> PoolState<C> {
    fn total(&self) -> usize {
        self.idle.len() + self.active + self.opening
    }
}

struct PoolInner<D: Driver> {
    driver: Arc<D>,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState<D::Connection>>,
    waiting: AtomicUsize,
}

impl<D: Driver> PoolInner<D> {
    fn lock(&self) -> MutexGuard<'_, PoolState<D::Connection>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the most recently used idle connection, or reserve a slot for
    /// opening a new one.
    fn take_idle(&self) -> PoolResult<Option<IdleConnection<D::Connection>>> {
        let mut state = self.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }
        match state.idle.pop_back() {
            Some(idle) => {
                state.active += 1;
                Ok(Some(idle))
            }
            None => {
                state.opening += 1;
                Ok(None)
            }
        }
    }

    /// Drop a borrowed connection that turned out to be unusable.
    fn discard(&self, conn: D::Connection) {
        {
            let mut state = self.lock();
            state.active = state.active.saturating_sub(1);
        }
        close_detached(conn);
    }

    fn give_back(&self, conn: D::Connection, created: Instant) {
        let mut state = self.lock();
        state.active = state.active.saturating_sub(1);

        let retire = state.closed
            || conn.is_broken()
            || created.elapsed() >= self.config.max_lifetime
            || state.total() >= self.config.max_connections;
        if retire {
            drop(state);
            close_detached(conn);
            return;
        }

        state.idle.push_back(IdleConnection {
            conn,
            created,
            idle_since: Instant::now(),
        });
    }
}

/// Bounded pool of ready connections for one-shot statements.
pub struct ConnectionPool<D: Driver> {
    inner: Arc<PoolInner<D>>,
}

impl<D: Driver> Clone for ConnectionPool<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Driver> ConnectionPool<D> {
    /// Create the pool and open `min_connections` up front.
    pub async fn new(driver: Arc<D>, config: PoolConfig) -> PoolResult<Self> {
        let pool = Self {
            inner: Arc::new(PoolInner {
                driver,
                permits: Arc::new(Semaphore::new(config.max_connections)),
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    active: 0,
                    opening: 0,
                    closed: false,
                }),
                waiting: AtomicUsize::new(0),
            }),
        };

        if let Err(e) = pool.fill_to_min().await {
            pool.shutdown().await;
            return Err(e);
        }

        debug!(
            min = pool.inner.config.min_connections,
            max = pool.inner.config.max_connections,
            "Stateless pool ready"
        );
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Borrow a connection, waiting up to `connection_timeout`.
    ///
    /// Idle connections past their lifetime are dropped; those idle longer
    /// than `keepalive_time` are pinged first and dropped if the ping fails.
    /// With nothing idle a new connection is opened, bounded by the same
    /// deadline.
    pub async fn acquire(&self) -> PoolResult<PooledConnection<D>> {
        let timeout = self.inner.config.connection_timeout;
        let deadline = Instant::now() + timeout;

        if self.inner.lock().closed {
            return Err(PoolError::Closed);
        }

        self.inner.waiting.fetch_add(1, Ordering::SeqCst);
        let permit =
            tokio::time::timeout_at(deadline, Arc::clone(&self.inner.permits).acquire_owned())
                .await;
        self.inner.waiting.fetch_sub(1, Ordering::SeqCst);

        let permit = match permit {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => return Err(PoolError::Exhausted(timeout)),
        };

        loop {
            match self.inner.take_idle()? {
                Some(mut idle) => {
                    if idle.created.elapsed() >= self.inner.config.max_lifetime
                        || idle.conn.is_broken()
                    {
                        self.inner.discard(idle.conn);
                        continue;
                    }
                    if idle.idle_since.elapsed() >= self.inner.config.keepalive_time {
                        if let Err(e) = idle.conn.ping().await {
                            debug!(error = %e, "Discarding idle connection that failed its ping");
                            self.inner.discard(idle.conn);
                            continue;
                        }
                    }
                    return Ok(PooledConnection::new(idle.conn, idle.created, permit, self));
                }
                None => {
                    let opened =
                        tokio::time::timeout_at(deadline, self.inner.driver.connect()).await;
                    let mut state = self.inner.lock();
                    state.opening = state.opening.saturating_sub(1);
                    match opened {
                        Ok(Ok(conn)) => {
                            if state.closed {
                                drop(state);
                                close_detached(conn);
                                return Err(PoolError::Closed);
                            }
                            state.active += 1;
                            drop(state);
                            return Ok(PooledConnection::new(conn, Instant::now(), permit, self));
                        }
                        Ok(Err(e)) => return Err(PoolError::Connect(e)),
                        Err(_) => return Err(PoolError::Exhausted(timeout)),
                    }
                }
            }
        }
    }

    /// Open connections until the pool holds `min_connections`.
    async fn fill_to_min(&self) -> PoolResult<usize> {
        let mut opened = 0;
        loop {
            {
                let mut state = self.inner.lock();
                if state.closed || state.total() >= self.inner.config.min_connections {
                    break;
                }
                state.opening += 1;
            }

            let result = tokio::time::timeout(
                self.inner.config.connection_timeout,
                self.inner.driver.connect(),
            )
            .await;

            let leftover = {
                let mut state = self.inner.lock();
                state.opening = state.opening.saturating_sub(1);
                match result {
                    Ok(Ok(conn)) if state.closed => Some(conn),
                    Ok(Ok(conn)) => {
                        let now = Instant::now();
                        state.idle.push_back(IdleConnection {
                            conn,
                            created: now,
                            idle_since: now,
                        });
                        opened += 1;
                        None
                    }
                    Ok(Err(e)) => return Err(PoolError::Connect(e)),
                    Err(_) => {
                        return Err(PoolError::Exhausted(self.inner.config.connection_timeout))
                    }
                }
            };

            if let Some(conn) = leftover {
                close_detached(conn);
                break;
            }
        }
        Ok(opened)
    }

    /// Retire expired and surplus idle connections, then refill to the minimum.
    pub async fn maintain(&self) -> PoolResult<()> {
        let retired = {
            let mut state = self.inner.lock();
            if state.closed {
                return Ok(());
            }

            let config = &self.inner.config;
            let mut total = state.total();
            let mut keep = VecDeque::with_capacity(state.idle.len());
            let mut retired = Vec::new();
            // Oldest first, so the surplus that goes is the least recently used.
            while let Some(idle) = state.idle.pop_front() {
                let expired = idle.created.elapsed() >= config.max_lifetime || idle.conn.is_broken();
                let surplus =
                    idle.idle_since.elapsed() >= config.idle_timeout && total > config.min_connections;
                if expired || surplus {
                    total -= 1;
                    retired.push(idle.conn);
                } else {
                    keep.push_back(idle);
                }
            }
            state.idle = keep;
            retired
        };

        if !retired.is_empty() {
            debug!(count = retired.len(), "Retiring idle connections");
        }
        for conn in retired {
            if let Err(e) = conn.close().await {
                debug!(error = %e, "Error closing retired connection");
            }
        }

        let opened = self.fill_to_min().await?;
        if opened > 0 {
            debug!(count = opened, "Refilled stateless pool");
        }
        Ok(())
    }

    /// Run [`ConnectionPool::maintain`] every `keepalive_time` until shutdown.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let pool = self.clone();
        let period = pool.inner.config.keepalive_time.max(MIN_MAINTENANCE_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if pool.is_closed() {
                    break;
                }
                if let Err(e) = pool.maintain().await {
                    warn!(error = %e, "Pool maintenance could not refill connections");
                }
            }
        })
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            idle: state.idle.len(),
            active: state.active,
            total: state.idle.len() + state.active,
            waiting: self.inner.waiting.load(Ordering::SeqCst),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Close every idle connection and refuse further borrows. Connections
    /// still lent out are closed as they come back.
    pub async fn shutdown(&self) {
        let idle: Vec<_> = {
            let mut state = self.inner.lock();
            state.closed = true;
            state.idle.drain(..).collect()
        };
        self.inner.permits.close();

        for entry in idle {
            if let Err(e) = entry.conn.close().await {
                debug!(error = %e, "Error closing connection during shutdown");
            }
        }
        debug!("Stateless pool shut down");
    }
}

/// A connection borrowed from a [`ConnectionPool`].
///
/// Dropping the guard releases the connection back to the pool.
pub struct PooledConnection<D: Driver> {
    conn: Option<D::Connection>,
    created: Instant,
    pool: Arc<PoolInner<D>>,
    _permit: OwnedSemaphorePermit,
}

impl<D: Driver> PooledConnection<D> {
    fn new(
        conn: D::Connection,
        created: Instant,
        permit: OwnedSemaphorePermit,
        pool: &ConnectionPool<D>,
    ) -> Self {
        Self {
            conn: Some(conn),
            created,
            pool: Arc::clone(&pool.inner),
            _permit: permit,
        }
    }

    pub async fn execute(&mut self, sql: &str) -> DriverResult<Vec<ResultSet>> {
        match self.conn.as_mut() {
            Some(conn) => conn.execute(sql).await,
            None => Err(DriverError::Closed),
        }
    }

    pub fn is_broken(&self) -> bool {
        self.conn.as_ref().map_or(true, Connection::is_broken)
    }

    /// Return the connection to the pool now.
    pub fn release(self) {
        drop(self);
    }

    /// Close the connection instead of returning it, for a connection whose
    /// state is unknown (e.g. a statement abandoned mid-flight).
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard(conn);
        }
    }
}

impl<D: Driver> Drop for PooledConnection<D> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn, self.created);
        }
    }
}
