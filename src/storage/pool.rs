//! Bounded async pool of `SQLite` connections.
//!
//! # Checkout model
//!
//! A tokio semaphore with `max_connections` permits bounds the number of
//! handles checked out at once. A caller holding a permit takes the most
//! recently returned idle connection, or opens a new one if none is idle.
//! Because every live connection is either idle or held together with a
//! permit, the pool never owns more than `max_connections` connections.
//!
//! [`PooledConnection`] returns its connection and permit on drop, so release
//! happens on every exit path, including cancellation of the owning task.
//! Statements run on tokio's blocking pool via [`PooledConnection::interact`].
//!
//! The pool never retries. Open failures surface as [`Error::Connection`]
//! for the caller's [`RetryPolicy`](crate::resilience::RetryPolicy) to handle.

use super::sqlite::{acquire_lock, open_file, open_shared_memory, ping};
use crate::{Error, Result};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Where pooled connections point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseTarget {
    /// A database file on disk.
    File(PathBuf),
    /// A named shared-cache in-memory database.
    Memory(String),
}

impl DatabaseTarget {
    fn open(&self) -> Result<Connection> {
        match self {
            Self::File(path) => open_file(path),
            Self::Memory(name) => open_shared_memory(name),
        }
    }
}

impl std::fmt::Display for DatabaseTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Memory(name) => write!(f, "memory:{name}"),
        }
    }
}

/// Pool tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Upper bound on live connections and concurrent checkouts.
    pub max_connections: usize,
    /// Period of the idle-connection health check.
    pub health_check_interval: Duration,
    /// How long `acquire` may wait for a free slot. `None` waits forever.
    pub acquire_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            health_check_interval: Duration::from_secs(60),
            acquire_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl PoolConfig {
    /// Sets the maximum number of connections.
    #[must_use]
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the health check interval.
    #[must_use]
    pub const fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Sets the acquire timeout.
    #[must_use]
    pub const fn with_acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

/// Bookkeeping carried alongside each connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionMeta {
    /// Pool-local connection id.
    pub id: u64,
    /// When the connection was opened.
    pub created_at: Instant,
    /// When the connection last finished a statement.
    pub last_used_at: Instant,
    /// Cleared after a connection-class failure; unhealthy connections are
    /// closed instead of returned to the idle list.
    pub is_healthy: bool,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Live connections owned by the pool (idle plus checked out).
    pub total_created: usize,
    /// Connections currently checked out.
    pub currently_in_use: usize,
    /// Configured bound.
    pub max_connections: usize,
    /// Connections waiting in the idle list.
    pub idle_count: usize,
}

struct IdleConnection {
    conn: Connection,
    meta: ConnectionMeta,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<IdleConnection>,
    live: usize,
    in_use: usize,
    next_id: u64,
    closed: bool,
}

struct PoolInner {
    target: DatabaseTarget,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn release(&self, conn: Option<Connection>, meta: ConnectionMeta) {
        let mut state = acquire_lock(&self.state);
        state.in_use = state.in_use.saturating_sub(1);
        let discarded = match conn {
            Some(conn) if meta.is_healthy && !state.closed => {
                state.idle.push_back(IdleConnection { conn, meta });
                None
            },
            other => {
                state.live = state.live.saturating_sub(1);
                Some(other)
            },
        };
        let (in_use, idle) = (state.in_use, state.idle.len());
        drop(state);

        if let Some(conn) = discarded {
            tracing::debug!(
                connection_id = meta.id,
                healthy = meta.is_healthy,
                "Discarding pooled connection"
            );
            metrics::counter!("pool_connections_discarded_total").increment(1);
            drop(conn);
        }
        record_gauges(in_use, idle);
    }
}

/// Bounded pool of `SQLite` connections.
///
/// Cheap to clone; clones share the same connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("target", &self.inner.target)
            .field("stats", &self.get_connection_stats())
            .finish()
    }
}

impl ConnectionPool {
    /// Creates an empty pool. Connections are opened on demand.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `max_connections` is zero.
    pub fn new(target: DatabaseTarget, config: PoolConfig) -> Result<Self> {
        if config.max_connections == 0 {
            return Err(Error::InvalidInput(
                "max_connections must be at least 1".to_string(),
            ));
        }
        let semaphore = Arc::new(Semaphore::new(config.max_connections));
        Ok(Self {
            inner: Arc::new(PoolInner {
                target,
                config,
                semaphore,
                state: Mutex::new(PoolState::default()),
            }),
        })
    }

    /// Returns the database target.
    #[must_use]
    pub fn target(&self) -> &DatabaseTarget {
        &self.inner.target
    }

    /// Checks out a connection, waiting while the pool is saturated.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolClosed`] after [`close_all`](Self::close_all)
    /// - [`Error::Timeout`] if `acquire_timeout` elapses
    /// - [`Error::Connection`] if a new connection cannot be opened
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let permit = self.acquire_permit().await?;

        let reused = {
            let mut state = acquire_lock(&self.inner.state);
            if state.closed {
                return Err(Error::PoolClosed);
            }
            state.in_use += 1;
            let reused = state.idle.pop_back();
            if reused.is_none() {
                state.live += 1;
                state.next_id += 1;
            }
            let id = state.next_id;
            record_gauges(state.in_use, state.idle.len());
            reused.ok_or(id)
        };

        let id = match reused {
            Ok(idle) => {
                return Ok(PooledConnection {
                    conn: Some(idle.conn),
                    meta: idle.meta,
                    pool: Arc::clone(&self.inner),
                    _permit: permit,
                });
            },
            Err(id) => id,
        };

        // The slot is reserved; dropping the guard gives it back if opening
        // fails or this task is cancelled mid-open.
        let now = Instant::now();
        let mut guard = PooledConnection {
            conn: None,
            meta: ConnectionMeta {
                id,
                created_at: now,
                last_used_at: now,
                is_healthy: true,
            },
            pool: Arc::clone(&self.inner),
            _permit: permit,
        };

        let target = self.inner.target.clone();
        let conn = tokio::task::spawn_blocking(move || target.open())
            .await
            .map_err(|e| Error::Connection {
                operation: "open_connection".to_string(),
                cause: e.to_string(),
            })??;

        tracing::debug!(connection_id = id, target = %self.inner.target, "Opened pooled connection");
        metrics::counter!("pool_connections_created_total").increment(1);
        guard.conn = Some(conn);
        Ok(guard)
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        let permit = Arc::clone(&self.inner.semaphore).acquire_owned();
        let permit = match self.inner.config.acquire_timeout {
            Some(limit) => tokio::time::timeout(limit, permit)
                .await
                .map_err(|_| Error::Timeout {
                    operation: "pool_acquire".to_string(),
                    elapsed_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                })?,
            None => permit.await,
        };
        permit.map_err(|_| Error::PoolClosed)
    }

    /// Checks out a connection and runs `f` on it.
    ///
    /// # Errors
    ///
    /// Returns acquisition errors or the error produced by `f`.
    pub async fn with_connection<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let mut conn = self.acquire().await?;
        conn.interact(f).await
    }

    /// Pings every idle connection and closes the ones that fail.
    ///
    /// Each pinged connection is checked out with a permit, so the check never
    /// lets the pool grow past its bound. Stops early when the pool is
    /// saturated or closed. Returns the number of connections removed.
    pub async fn check_idle_connections(&self) -> usize {
        let candidates = acquire_lock(&self.inner.state).idle.len();
        let mut removed = 0;

        for _ in 0..candidates {
            let Ok(permit) = Arc::clone(&self.inner.semaphore).try_acquire_owned() else {
                break;
            };
            let idle = {
                let mut state = acquire_lock(&self.inner.state);
                if state.closed {
                    break;
                }
                let Some(idle) = state.idle.pop_front() else {
                    break;
                };
                state.in_use += 1;
                idle
            };

            let mut conn = PooledConnection {
                conn: Some(idle.conn),
                meta: idle.meta,
                pool: Arc::clone(&self.inner),
                _permit: permit,
            };
            if let Err(err) = conn.interact(|c| ping(c)).await {
                tracing::warn!(connection_id = conn.meta.id, error = %err, "Health check failed");
                conn.mark_unhealthy();
                removed += 1;
            }
        }

        if removed > 0 {
            metrics::counter!("pool_health_check_removed_total").increment(removed as u64);
        }
        removed
    }

    /// Spawns the periodic health monitor.
    ///
    /// The task holds only a weak reference and exits once the pool is
    /// closed or dropped.
    pub fn spawn_health_monitor(&self) -> JoinHandle<()> {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.health_check_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let pool = Self { inner };
                if pool.is_closed() {
                    break;
                }
                let removed = pool.check_idle_connections().await;
                tracing::debug!(removed, "Pool health check complete");
            }
        })
    }

    /// Returns the pool counters. Pure read.
    #[must_use]
    pub fn get_connection_stats(&self) -> PoolStats {
        let state = acquire_lock(&self.inner.state);
        PoolStats {
            total_created: state.live,
            currently_in_use: state.in_use,
            max_connections: self.inner.config.max_connections,
            idle_count: state.idle.len(),
        }
    }

    /// Returns `true` once [`close_all`](Self::close_all) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        acquire_lock(&self.inner.state).closed
    }

    /// Closes every idle connection and rejects all future checkouts.
    ///
    /// Checked-out connections are closed when their holders release them.
    /// Waiting `acquire` calls fail with [`Error::PoolClosed`].
    pub fn close_all(&self) {
        let drained: Vec<IdleConnection> = {
            let mut state = acquire_lock(&self.inner.state);
            state.closed = true;
            let drained: Vec<IdleConnection> = state.idle.drain(..).collect();
            state.live = state.live.saturating_sub(drained.len());
            drained
        };
        self.inner.semaphore.close();
        tracing::info!(
            closed = drained.len(),
            target = %self.inner.target,
            "Connection pool closed"
        );
        drop(drained);
        record_gauges(acquire_lock(&self.inner.state).in_use, 0);
    }
}

/// A checked-out connection.
///
/// Dropping it returns the connection to the pool, or closes it if it was
/// marked unhealthy, the pool was closed, or an [`interact`](Self::interact)
/// call was abandoned mid-flight.
pub struct PooledConnection {
    conn: Option<Connection>,
    meta: ConnectionMeta,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("meta", &self.meta)
            .field("attached", &self.conn.is_some())
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    /// Runs `f` against the connection on the blocking thread pool.
    ///
    /// An [`Error::Connection`] from `f` marks the connection unhealthy.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `f`, or [`Error::Connection`] if the
    /// connection was lost by an earlier abandoned call or `f` panicked.
    pub async fn interact<F, R>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let Some(mut conn) = self.conn.take() else {
            return Err(Error::Connection {
                operation: "interact".to_string(),
                cause: "connection was lost by an abandoned call".to_string(),
            });
        };

        let joined = tokio::task::spawn_blocking(move || {
            let result = f(&mut conn);
            (conn, result)
        })
        .await;

        match joined {
            Ok((conn, result)) => {
                self.conn = Some(conn);
                self.meta.last_used_at = Instant::now();
                if matches!(result, Err(Error::Connection { .. })) {
                    self.meta.is_healthy = false;
                }
                result
            },
            Err(join_err) => {
                self.meta.is_healthy = false;
                Err(Error::Connection {
                    operation: "interact".to_string(),
                    cause: join_err.to_string(),
                })
            },
        }
    }

    /// Returns the connection metadata.
    #[must_use]
    pub const fn meta(&self) -> ConnectionMeta {
        self.meta
    }

    /// Marks the connection so it is closed instead of reused.
    pub const fn mark_unhealthy(&mut self) {
        self.meta.is_healthy = false;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.release(self.conn.take(), self.meta);
    }
}

#[allow(clippy::cast_precision_loss)]
fn record_gauges(in_use: usize, idle: usize) {
    metrics::gauge!("pool_connections_in_use").set(in_use as f64);
    metrics::gauge!("pool_connections_idle").set(idle as f64);
}
