//! # Pool Registry
//!
//! Purpose: Single entry point for application code. Maps pool names to
//! lazily built `ConnectionPool`s and routes releases back to the pool that
//! issued each connection.
//!
//! ## Design Principles
//! 1. **Explicit Composition Root**: The registry is an ordinary value the
//!    application builds once and shares (`&PoolRegistry` or `Arc`), not a
//!    hidden global.
//! 2. **Idempotent Construction**: Lookup and insertion happen under one
//!    lock, so concurrent first lookups of a name build exactly one pool.
//! 3. **No Global Blocking**: The registry lock is released before any
//!    `acquire`, so a saturated pool never stalls lookups of other pools.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use kvpool_common::{ConfigError, PoolError, PoolResult, RegistryConfig};
use tracing::{info, warn};

use crate::connection::{Connection, Connector, TcpConnector};
use crate::lease::ScopedLease;
use crate::pool::{ConnectionPool, PoolStats};

struct RegistryState {
    pools: HashMap<String, Arc<ConnectionPool>>,
    shutdown: bool,
}

/// Name → pool map built from configuration.
pub struct PoolRegistry {
    config: RegistryConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<RegistryState>,
    created: AtomicUsize,
}

impl PoolRegistry {
    /// Creates a registry that opens connections through `connector`.
    pub fn new(config: RegistryConfig, connector: Arc<dyn Connector>) -> Self {
        PoolRegistry {
            config,
            connector,
            state: Mutex::new(RegistryState {
                pools: HashMap::new(),
                shutdown: false,
            }),
            created: AtomicUsize::new(0),
        }
    }

    /// Creates a registry that connects over TCP.
    pub fn from_config(config: RegistryConfig) -> Self {
        Self::new(config, Arc::new(TcpConnector))
    }

    /// Loads a TOML configuration file and builds a TCP registry from it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        RegistryConfig::from_file(path).map(Self::from_config)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the pool called `name`, building it on first use.
    ///
    /// **Errors**: `ConfigNotFound` for names missing from configuration,
    /// `PoolShuttingDown` once the registry has been shut down.
    ///
    /// Lookups never wait on a pool. The one exception is the first lookup of
    /// a pool with `min_idle > 0`: it opens those connections on the calling
    /// thread (outside the registry lock) and can block for up to
    /// `min_idle × connect_timeout`.
    pub fn pool(&self, name: &str) -> PoolResult<Arc<ConnectionPool>> {
        let (pool, fresh) = {
            let mut state = self.lock_state();
            if state.shutdown {
                return Err(PoolError::PoolShuttingDown {
                    pool: name.to_string(),
                });
            }
            match state.pools.get(name) {
                Some(pool) => (pool.clone(), false),
                None => {
                    let settings = self.config.get(name).ok_or_else(|| {
                        warn!(pool = %name, "lookup of unconfigured pool");
                        PoolError::ConfigNotFound {
                            name: name.to_string(),
                        }
                    })?;
                    let pool = Arc::new(ConnectionPool::new(
                        name,
                        settings.clone(),
                        self.connector.clone(),
                    ));
                    state.pools.insert(name.to_string(), pool.clone());
                    self.created.fetch_add(1, Ordering::Relaxed);
                    info!(
                        pool = %name,
                        endpoint = %settings.target(),
                        max = settings.max_connections,
                        "created connection pool"
                    );
                    (pool, true)
                }
            }
        };

        if fresh && pool.settings().min_idle > 0 {
            // A cold pool still works; the first acquire reports the failure.
            if let Err(err) = pool.warm_up() {
                warn!(pool = %name, error = %err, "warm-up incomplete");
            }
        }
        Ok(pool)
    }

    /// Acquires a connection from `name`, using the pool's configured timeout.
    pub fn get_connection(&self, name: &str) -> PoolResult<Connection> {
        self.pool(name)?.acquire_default()
    }

    /// Acquires a connection from `name` with an explicit timeout
    /// (`None` waits indefinitely).
    pub fn get_connection_timeout(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> PoolResult<Connection> {
        self.pool(name)?.acquire(timeout)
    }

    /// Acquires a connection that is released when the lease goes out of scope.
    pub fn lease(&self, name: &str) -> PoolResult<ScopedLease<'_>> {
        ScopedLease::acquire(self, name)
    }

    /// Returns a connection to the pool that issued it.
    pub fn release_connection(&self, conn: Connection) -> PoolResult<()> {
        let pool = self.lock_state().pools.get(conn.pool_name()).cloned();
        match pool {
            Some(pool) => pool.release(conn),
            None => {
                warn!(pool = %conn.pool_name(), conn_id = conn.id(), "release to a pool this registry does not manage");
                Err(PoolError::InvalidRelease {
                    pool: conn.pool_name().to_string(),
                    reason: "pool is not managed by this registry",
                })
            }
        }
    }

    /// Like `release_connection`, but tolerates a missing connection by
    /// logging it.
    pub fn release_connection_opt(&self, conn: Option<Connection>) -> PoolResult<()> {
        match conn {
            Some(conn) => self.release_connection(conn),
            None => {
                warn!("release called without a connection");
                Err(PoolError::InvalidRelease {
                    pool: String::new(),
                    reason: "no connection to release",
                })
            }
        }
    }

    /// Shuts down every pool built so far; later lookups fail.
    pub fn shutdown(&self) {
        let pools: Vec<Arc<ConnectionPool>> = {
            let mut state = self.lock_state();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.pools.values().cloned().collect()
        };
        for pool in &pools {
            pool.shutdown();
        }
        info!(pools = pools.len(), "registry shut down");
    }

    /// Number of pools constructed over the registry's lifetime.
    pub fn pools_created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Names of the pools built so far, sorted.
    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_state().pools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stats of an already built pool.
    pub fn stats(&self, name: &str) -> Option<PoolStats> {
        let pool = self.lock_state().pools.get(name).cloned();
        pool.map(|pool| pool.stats())
    }
}

impl Drop for PoolRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("configured", &self.config.pools.keys().collect::<Vec<_>>())
            .field("created", &self.pools_created())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use kvpool_common::PoolSettings;

    use super::*;
    use crate::connection::testing::MockConnector;

    fn registry(max: usize) -> (Arc<PoolRegistry>, MockConnector) {
        let connector = MockConnector::default();
        let config = RegistryConfig::default()
            .with_pool(
                "token",
                PoolSettings {
                    max_connections: max,
                    ..PoolSettings::default()
                },
            )
            .with_pool(
                "ranking",
                PoolSettings {
                    port: 6380,
                    max_connections: max,
                    ..PoolSettings::default()
                },
            );
        let registry = PoolRegistry::new(config, Arc::new(connector.clone()));
        (Arc::new(registry), connector)
    }

    #[test]
    fn unknown_pool_is_config_not_found() {
        let (registry, _) = registry(1);
        let err = registry.get_connection("missing").unwrap_err();
        assert!(matches!(err, PoolError::ConfigNotFound { ref name } if name == "missing"));
        assert_eq!(registry.pools_created(), 0);
    }

    #[test]
    fn pools_are_built_lazily_once() {
        let (registry, _) = registry(2);
        assert!(registry.pool_names().is_empty());

        let first = registry.pool("token").expect("pool");
        let second = registry.pool("token").expect("pool");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.pools_created(), 1);
        assert_eq!(registry.pool_names(), vec!["token".to_string()]);
    }

    #[test]
    fn concurrent_first_lookup_builds_one_pool() {
        let (registry, _) = registry(8);
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let conn = registry.get_connection("token").expect("acquire");
                    registry.release_connection(conn).expect("release");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker");
        }
        assert_eq!(registry.pools_created(), 1);
    }

    #[test]
    fn release_routes_to_issuing_pool() {
        let (registry, _) = registry(1);
        let token = registry.get_connection("token").expect("token");
        let ranking = registry.get_connection("ranking").expect("ranking");
        assert_eq!(ranking.target().port, 6380);

        registry.release_connection(ranking).expect("release");
        registry.release_connection(token).expect("release");
        assert_eq!(registry.stats("token").expect("stats").idle, 1);
        assert_eq!(registry.stats("ranking").expect("stats").idle, 1);
    }

    #[test]
    fn release_to_foreign_registry_is_invalid() {
        let (issuer, _) = registry(1);
        let (other, _) = registry(1);
        let conn = issuer.get_connection("token").expect("acquire");

        // `other` has no pool built for "token" yet.
        let err = other.release_connection(conn).unwrap_err();
        assert!(matches!(err, PoolError::InvalidRelease { .. }));
        assert_eq!(issuer.stats("token").expect("stats").total, 0);
    }

    #[test]
    fn missing_connection_release_is_invalid() {
        let (registry, _) = registry(1);
        assert!(matches!(
            registry.release_connection_opt(None),
            Err(PoolError::InvalidRelease { .. })
        ));
    }

    #[test]
    fn saturated_pool_does_not_block_other_pools() {
        let (registry, _) = registry(1);
        let _held = registry.get_connection("token").expect("token");

        let waiter_registry = registry.clone();
        let waiter = thread::spawn(move || {
            waiter_registry.get_connection_timeout("token", Some(Duration::from_millis(300)))
        });
        thread::sleep(Duration::from_millis(20));

        // The registry lock is free while the waiter blocks.
        let other = registry
            .get_connection_timeout("ranking", Some(Duration::from_millis(50)))
            .expect("ranking");
        registry.release_connection(other).expect("release");

        assert!(matches!(
            waiter.join().expect("join"),
            Err(PoolError::AcquireTimeout { .. })
        ));
    }

    #[test]
    fn shutdown_closes_all_pools() {
        let (registry, connector) = registry(2);
        let token = registry.get_connection("token").expect("token");
        let ranking = registry.get_connection("ranking").expect("ranking");
        registry.release_connection(ranking).expect("release");

        registry.shutdown();
        assert!(matches!(
            registry.get_connection("token"),
            Err(PoolError::PoolShuttingDown { .. })
        ));
        assert_eq!(registry.stats("ranking").expect("stats").total, 0);

        registry.release_connection(token).expect("release after shutdown");
        assert_eq!(registry.stats("token").expect("stats").total, 0);
        assert_eq!(connector.state.closes(), 2);
    }

    #[test]
    fn warm_up_runs_on_first_lookup() {
        let connector = MockConnector::default();
        let config = RegistryConfig::default().with_pool(
            "token",
            PoolSettings {
                max_connections: 4,
                min_idle: 3,
                ..PoolSettings::default()
            },
        );
        let registry = PoolRegistry::new(config, Arc::new(connector.clone()));

        registry.pool("token").expect("pool");
        assert_eq!(connector.state.connects(), 3);
        assert_eq!(registry.stats("token").expect("stats").idle, 3);
    }

    #[test]
    fn first_lookup_blocks_for_warm_up_only_once() {
        let connector = MockConnector::default();
        connector.state.connect_delay_ms.store(20, Ordering::SeqCst);
        let config = RegistryConfig::default().with_pool(
            "token",
            PoolSettings {
                max_connections: 2,
                min_idle: 2,
                ..PoolSettings::default()
            },
        );
        let registry = PoolRegistry::new(config, Arc::new(connector.clone()));

        let started = std::time::Instant::now();
        registry.pool("token").expect("pool");
        assert!(started.elapsed() >= Duration::from_millis(40));

        registry.pool("token").expect("pool");
        assert_eq!(connector.state.connects(), 2);
    }
}
