//! # Connection Pool
//!
//! Purpose: Share a bounded set of connections to one cache endpoint between
//! many threads, creating them lazily and blocking callers while the pool is
//! saturated.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: At most `max_connections` connections exist;
//!    idle ones are reused last-in-first-out.
//! 2. **Monitor Pattern**: All counters and the idle list sit behind one
//!    mutex; waiters sleep on a condition variable and re-check on wake.
//! 3. **Reserve, Then Connect**: A slot is reserved under the lock and the
//!    network handshake happens outside it, so critical sections stay short.
//! 4. **Fail Fast on Growth**: A failed open is reported to the caller that
//!    triggered it and never retried internally.
//!
//! ## Accounting
//! `total` counts idle connections, checked-out connections, and slots
//! reserved for an open in progress. A `Connection` gives its slot back when
//! it is dropped, so every path that closes one (release after shutdown,
//! failed health check, a caller dropping it) keeps the count exact.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use kvpool_common::{PoolError, PoolResult, PoolSettings};
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectOptions, Connection, Connector, Origin};
use crate::metrics::{MetricsSnapshot, PoolMetrics};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Point-in-time view of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub name: String,
    pub max_connections: usize,
    /// Connections in existence (idle + checked out).
    pub total: usize,
    pub idle: usize,
    pub checked_out: usize,
    pub shutdown: bool,
    pub metrics: MetricsSnapshot,
}

struct PoolState {
    idle: Vec<Connection>,
    total: usize,
    shutdown: bool,
}

/// State shared between the pool handle and its connections.
pub(crate) struct PoolCore {
    origin: Arc<Origin>,
    settings: PoolSettings,
    state: Mutex<PoolState>,
    available: Condvar,
    next_conn_id: AtomicU64,
    metrics: PoolMetrics,
}

enum Checkout {
    Idle(Connection),
    Grow,
}

impl PoolCore {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        // No code path panics between two related updates; poisoned state is usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Gives back the slot of a connection that is being destroyed.
    pub(crate) fn forget_slot(&self) {
        {
            let mut state = self.lock_state();
            state.total = state.total.saturating_sub(1);
        }
        self.metrics.record_close();
        self.available.notify_one();
    }

    fn name(&self) -> &str {
        &self.origin.pool_name
    }

    fn shutting_down(&self) -> PoolError {
        PoolError::PoolShuttingDown {
            pool: self.name().to_string(),
        }
    }
}

/// Bounded pool of connections to one target.
pub struct ConnectionPool {
    core: Arc<PoolCore>,
}

impl ConnectionPool {
    /// Creates an empty pool. No connection is opened until first use.
    pub fn new(
        name: impl Into<String>,
        settings: PoolSettings,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let name: String = name.into();
        let origin = Origin {
            pool_id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            pool_name: Arc::from(name.as_str()),
            target: settings.target(),
            options: ConnectOptions::from_settings(&settings),
            connector,
        };
        let state = PoolState {
            idle: Vec::with_capacity(settings.max_connections),
            total: 0,
            shutdown: false,
        };
        ConnectionPool {
            core: Arc::new(PoolCore {
                origin: Arc::new(origin),
                settings,
                state: Mutex::new(state),
                available: Condvar::new(),
                next_conn_id: AtomicU64::new(1),
                metrics: PoolMetrics::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.core.settings
    }

    /// Acquires a connection, waiting at most the configured acquire timeout.
    pub fn acquire_default(&self) -> PoolResult<Connection> {
        self.acquire(self.core.settings.acquire_timeout())
    }

    /// Acquires a connection.
    ///
    /// **Input**: `timeout`, `None` to wait as long as it takes.
    /// **Output**: an exclusively owned connection, or
    /// `ConnectFailed` / `AcquireTimeout` / `PoolShuttingDown`.
    ///
    /// **Logic**:
    /// 1. Pop an idle connection if there is one (health-checked when enabled).
    /// 2. Otherwise reserve a slot if under capacity and open a connection.
    /// 3. Otherwise wait for a release, a freed slot, the deadline, or shutdown.
    pub fn acquire(&self, timeout: Option<Duration>) -> PoolResult<Connection> {
        let started = Instant::now();
        let deadline = timeout.map(|timeout| started + timeout);

        loop {
            match self.checkout(started, deadline)? {
                Checkout::Idle(mut conn) => {
                    // Ping happens outside the lock; a dead connection frees
                    // its slot on drop and we go around again.
                    if self.core.settings.health_check && !conn.ping() {
                        warn!(pool = %self.name(), conn_id = conn.id(), "discarding dead idle connection");
                        self.core.metrics.record_discard();
                        drop(conn);
                        continue;
                    }
                    conn.touch();
                    self.core.metrics.record_acquire();
                    debug!(pool = %self.name(), conn_id = conn.id(), "reused idle connection");
                    return Ok(conn);
                }
                Checkout::Grow => return self.grow(),
            }
        }
    }

    fn checkout(&self, started: Instant, deadline: Option<Instant>) -> PoolResult<Checkout> {
        let core = &self.core;
        let mut state = core.lock_state();
        let mut blocked = false;

        loop {
            if state.shutdown {
                if blocked {
                    core.metrics.record_wait(started.elapsed());
                }
                return Err(core.shutting_down());
            }
            if let Some(conn) = state.idle.pop() {
                if blocked {
                    core.metrics.record_wait(started.elapsed());
                }
                return Ok(Checkout::Idle(conn));
            }
            if state.total < core.settings.max_connections {
                state.total += 1;
                if blocked {
                    core.metrics.record_wait(started.elapsed());
                }
                return Ok(Checkout::Grow);
            }

            if !blocked {
                blocked = true;
                warn!(
                    pool = %core.name(),
                    max = core.settings.max_connections,
                    "pool exhausted, waiting for a connection"
                );
            }

            state = match deadline {
                None => core
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        let waited = started.elapsed();
                        core.metrics.record_wait(waited);
                        core.metrics.record_timeout();
                        warn!(pool = %core.name(), waited_ms = waited.as_millis() as u64, "acquire timed out");
                        return Err(PoolError::AcquireTimeout {
                            pool: core.name().to_string(),
                            waited,
                        });
                    }
                    core.available
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Opens a connection into an already reserved slot.
    fn grow(&self) -> PoolResult<Connection> {
        let core = &self.core;
        let id = core.next_conn_id.fetch_add(1, Ordering::Relaxed);

        match Connection::open(core.origin.clone(), Arc::downgrade(core), id) {
            Ok(conn) => {
                core.metrics.record_open();
                let shutdown = core.lock_state().shutdown;
                if shutdown {
                    // Dropped after the guard is gone; returns the slot.
                    drop(conn);
                    return Err(core.shutting_down());
                }
                core.metrics.record_acquire();
                Ok(conn)
            }
            Err(source) => {
                {
                    let mut state = core.lock_state();
                    state.total = state.total.saturating_sub(1);
                }
                // A waiter may now be able to grow instead.
                core.available.notify_one();
                core.metrics.record_connect_failure();
                error!(pool = %core.name(), endpoint = %core.origin.target, error = %source, "failed to open connection");
                Err(PoolError::ConnectFailed {
                    pool: core.name().to_string(),
                    source,
                })
            }
        }
    }

    /// Returns a connection to the pool.
    ///
    /// Connections from another pool are rejected (and closed, which frees
    /// their slot in the pool that issued them). After shutdown, or when the
    /// handle was lost while checked out, the connection is closed instead of
    /// going back to the idle list.
    pub fn release(&self, mut conn: Connection) -> PoolResult<()> {
        let core = &self.core;
        if conn.pool_id() != core.origin.pool_id {
            warn!(
                pool = %core.name(),
                owner = %conn.pool_name(),
                conn_id = conn.id(),
                "rejected release of a foreign connection"
            );
            return Err(PoolError::InvalidRelease {
                pool: core.name().to_string(),
                reason: "connection was issued by a different pool",
            });
        }

        if !conn.is_connected() {
            warn!(pool = %core.name(), conn_id = conn.id(), "discarding broken connection on release");
            core.metrics.record_discard();
            return Ok(());
        }

        conn.touch();
        let rejected = {
            let mut state = core.lock_state();
            if state.shutdown {
                Some(conn)
            } else {
                state.idle.push(conn);
                None
            }
        };

        match rejected {
            // Closed here, outside the lock.
            Some(conn) => debug!(pool = %core.name(), conn_id = conn.id(), "released into a shut down pool"),
            None => core.available.notify_one(),
        }
        Ok(())
    }

    /// Releases an optional connection; `None` is logged and reported.
    pub fn release_opt(&self, conn: Option<Connection>) -> PoolResult<()> {
        match conn {
            Some(conn) => self.release(conn),
            None => {
                warn!(pool = %self.name(), "release called without a connection");
                Err(PoolError::InvalidRelease {
                    pool: self.name().to_string(),
                    reason: "no connection to release",
                })
            }
        }
    }

    /// Opens connections until `min_idle` are idle.
    pub fn warm_up(&self) -> PoolResult<usize> {
        let core = &self.core;
        let mut opened = Vec::new();
        let mut result = Ok(());

        loop {
            {
                let mut state = core.lock_state();
                if state.shutdown {
                    result = Err(core.shutting_down());
                    break;
                }
                if state.idle.len() + opened.len() >= core.settings.min_idle
                    || state.total >= core.settings.max_connections
                {
                    break;
                }
                state.total += 1;
            }
            match self.grow() {
                Ok(conn) => opened.push(conn),
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }

        let count = opened.len();
        for conn in opened {
            self.release(conn)?;
        }
        result.map(|()| count)
    }

    /// Stops the pool.
    ///
    /// Wakes every waiter (they fail with `PoolShuttingDown`) and closes idle
    /// connections. Checked-out connections close when they are released.
    pub fn shutdown(&self) {
        let core = &self.core;
        let idle = {
            let mut state = core.lock_state();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            std::mem::take(&mut state.idle)
        };
        core.available.notify_all();

        let closed = idle.len();
        drop(idle);
        info!(pool = %core.name(), closed, "pool shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.core.lock_state().shutdown
    }

    pub fn stats(&self) -> PoolStats {
        let (total, idle, shutdown) = {
            let state = self.core.lock_state();
            (state.total, state.idle.len(), state.shutdown)
        };
        PoolStats {
            name: self.name().to_string(),
            max_connections: self.core.settings.max_connections,
            total,
            idle,
            checked_out: total.saturating_sub(idle),
            shutdown,
            metrics: self.core.metrics.snapshot(),
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.name())
            .field("target", &self.core.origin.target)
            .field("max_connections", &self.core.settings.max_connections)
            .finish_non_exhaustive()
    }
}
