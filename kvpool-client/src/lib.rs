//! # KVPool Client
//!
//! Purpose: Share a bounded number of connections to Redis-compatible cache
//! servers between the threads of an application.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections instead of reconnecting.
//! 2. **Blocking Acquire**: A saturated pool parks the caller on a condition
//!    variable until a connection comes back, a deadline passes, or shutdown.
//! 3. **RAII Release**: `ScopedLease` returns connections on every exit path.
//! 4. **Injected Transport**: Pools open connections through a `Connector`,
//!    so they can be exercised without a server.
//!
//! ```no_run
//! use kvpool_client::PoolRegistry;
//!
//! let registry = PoolRegistry::from_file("kvpool.toml")?;
//! let mut lease = registry.lease("token")?;
//! lease.exec(&[b"SET", b"greeting", b"hello"])?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod connection;
mod lease;
mod metrics;
mod pool;
mod registry;
mod resp;

pub use connection::{
    ConnectOptions, Connection, Connector, TcpConnector, TcpTransport, Transport,
    RECONNECT_INTERVAL,
};
pub use kvpool_common::{
    ClientError, ClientResult, ConfigError, ConnectError, PoolError, PoolResult, PoolSettings,
    RegistryConfig, Target,
};
pub use lease::ScopedLease;
pub use metrics::{LatencySnapshot, MetricsSnapshot, PoolMetrics};
pub use pool::{ConnectionPool, PoolStats};
pub use registry::PoolRegistry;
pub use resp::{encode_command, read_response, RespValue};
