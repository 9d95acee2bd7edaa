//! # Scoped Lease
//!
//! RAII guard tying a checked-out connection to a lexical scope: whatever
//! way the scope is left (normal return, `?`, panic unwinding), the
//! connection goes back to its pool exactly once.

use std::ops::{Deref, DerefMut};

use kvpool_common::PoolResult;
use tracing::debug;

use crate::connection::Connection;
use crate::registry::PoolRegistry;

/// Connection borrowed from a `PoolRegistry` for the lifetime of a scope.
pub struct ScopedLease<'r> {
    registry: &'r PoolRegistry,
    conn: Option<Connection>,
}

impl<'r> ScopedLease<'r> {
    /// Acquires from the named pool using its configured timeout.
    pub fn acquire(registry: &'r PoolRegistry, name: &str) -> PoolResult<Self> {
        let conn = registry.get_connection(name)?;
        Ok(Self::wrap(registry, Some(conn)))
    }

    /// Takes charge of an already acquired connection.
    ///
    /// `None` (a failed acquire) is accepted; dropping such a lease releases
    /// nothing.
    pub fn wrap(registry: &'r PoolRegistry, conn: Option<Connection>) -> Self {
        ScopedLease { registry, conn }
    }

    pub fn get(&self) -> Option<&Connection> {
        self.conn.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut Connection> {
        self.conn.as_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.conn.is_none()
    }

    /// Detaches the connection; the caller becomes responsible for releasing it.
    pub fn into_inner(mut self) -> Option<Connection> {
        self.conn.take()
    }
}

/// # Panics
/// Dereferencing an empty lease (built with `wrap(_, None)`) panics; use
/// `get()` when the lease may be empty.
impl Deref for ScopedLease<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("lease holds no connection")
    }
}

impl DerefMut for ScopedLease<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("lease holds no connection")
    }
}

impl Drop for ScopedLease<'_> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let conn_id = conn.id();
        // Failures are already logged by the registry.
        if self.registry.release_connection(conn).is_ok() {
            debug!(conn_id, "lease released connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::Arc;

    use kvpool_common::{PoolError, PoolSettings, RegistryConfig};

    use super::*;
    use crate::connection::testing::MockConnector;

    fn registry() -> PoolRegistry {
        let config = RegistryConfig::default().with_pool(
            "token",
            PoolSettings {
                max_connections: 1,
                ..PoolSettings::default()
            },
        );
        PoolRegistry::new(config, Arc::new(MockConnector::default()))
    }

    fn idle(registry: &PoolRegistry) -> usize {
        registry.stats("token").map(|stats| stats.idle).unwrap_or(0)
    }

    #[test]
    fn releases_on_scope_exit() {
        let registry = registry();
        {
            let mut lease = registry.lease("token").expect("lease");
            lease.exec(&[b"SET", b"k", b"v"]).expect("exec");
            assert_eq!(idle(&registry), 0);
        }
        assert_eq!(idle(&registry), 1);
    }

    #[test]
    fn releases_on_early_return() {
        fn work(registry: &PoolRegistry) -> Result<(), PoolError> {
            let _lease = registry.lease("token")?;
            registry.get_connection("missing")?;
            Ok(())
        }

        let registry = registry();
        assert!(matches!(work(&registry), Err(PoolError::ConfigNotFound { .. })));
        assert_eq!(idle(&registry), 1);
    }

    #[test]
    fn releases_on_panic() {
        let registry = registry();
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _lease = registry.lease("token").expect("lease");
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(idle(&registry), 1);
    }

    #[test]
    fn empty_lease_releases_nothing() {
        let registry = registry();
        let lease = ScopedLease::wrap(&registry, None);
        assert!(lease.is_empty());
        drop(lease);
        assert!(registry.stats("token").is_none());
    }

    #[test]
    fn wrapped_connection_is_released_once() {
        let registry = registry();
        let conn = registry.get_connection("token").expect("acquire");
        drop(ScopedLease::wrap(&registry, Some(conn)));

        let stats = registry.stats("token").expect("stats");
        assert_eq!((stats.total, stats.idle), (1, 1));
    }

    #[test]
    fn into_inner_detaches() {
        let registry = registry();
        let lease = registry.lease("token").expect("lease");
        let conn = lease.into_inner().expect("connection");
        assert_eq!(idle(&registry), 0);
        registry.release_connection(conn).expect("release");
        assert_eq!(idle(&registry), 1);
    }
}
