//! # Error Types
//!
//! Purpose: Name every failure the pool, its connections, and the
//! configuration loader can report, so callers can match on the kind instead
//! of parsing messages.
//!
//! ## Design Principles
//! 1. **Layered Errors**: `ConnectError` (opening a handle) is wrapped by
//!    `PoolError` (acquire/release protocol); `ClientError` covers commands
//!    issued on a checked-out connection.
//! 2. **Never Fatal**: every variant degrades one caller's operation only.
//! 3. **No Secrets**: credentials never appear in messages.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type for pool and registry operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Result type for commands issued on a connection.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the acquire/release protocol.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool name is unknown to the registry configuration.
    #[error("no configured pool named `{name}`")]
    ConfigNotFound { name: String },

    /// Growing the pool failed because the connection could not be opened.
    #[error("pool `{pool}`: connect failed: {source}")]
    ConnectFailed { pool: String, source: ConnectError },

    /// The pool stayed saturated past the caller's deadline.
    #[error("pool `{pool}`: no connection available after {waited:?}")]
    AcquireTimeout { pool: String, waited: Duration },

    /// The pool (or the whole registry) is shutting down.
    #[error("pool `{pool}` is shutting down")]
    PoolShuttingDown { pool: String },

    /// A missing or foreign connection was handed back.
    #[error("invalid release to pool `{pool}`: {reason}")]
    InvalidRelease { pool: String, reason: &'static str },
}

impl PoolError {
    /// Returns true for failures a caller may reasonably retry later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PoolError::ConnectFailed { .. } | PoolError::AcquireTimeout { .. }
        )
    }
}

/// Errors raised while opening a transport to the cache server.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Host/port could not be resolved into a socket address.
    #[error("invalid address `{0}`")]
    InvalidAddress(String),

    /// Network failure: refused, unreachable, timed out.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The server rejected the configured credential.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The server refused to switch to the configured database index.
    #[error("select db {db} rejected: {message}")]
    SelectRejected { db: u16, message: String },

    /// The server answered the handshake with something unexpected.
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Errors surfaced while running a command on a checked-out connection.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// RESP2 framing or parse error.
    #[error("protocol error")]
    Protocol,

    /// Server returned an error reply.
    #[error("server error: {}", String::from_utf8_lossy(.message))]
    Server { message: Vec<u8> },

    /// The handle is closed and a reconnect was attempted too recently.
    #[error("not connected; next reconnect allowed in {retry_in:?}")]
    ReconnectThrottled { retry_in: Duration },

    /// The handle was closed and reopening it failed.
    #[error("reconnect failed: {0}")]
    Reconnect(#[source] Box<ConnectError>),
}

impl ClientError {
    /// Whether the failure leaves the underlying handle unusable.
    ///
    /// Server error replies are well-formed answers, so the stream stays in
    /// sync and the connection can go back into service.
    pub fn breaks_connection(&self) -> bool {
        !matches!(self, ClientError::Server { .. })
    }
}

/// Errors raised while loading or validating pool configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("pool `{pool}`: {reason}")]
    Invalid { pool: String, reason: String },
}
