//! # Pooled Connection
//!
//! Purpose: One live link to a cache endpoint, plus the seams used to open
//! it (`Connector`) and to talk over it (`Transport`).
//!
//! ## Design Principles
//! 1. **Strategy Pattern**: The pool only sees `Connector`/`Transport`, so the
//!    TCP implementation can be swapped for an in-memory one in tests.
//! 2. **Weak Back-Reference**: A connection records its pool's name and id
//!    for routing, and a `Weak` handle so that dropping it without a release
//!    still gives its slot back. The pool owns connections, never the reverse.
//! 3. **Self-Healing Handle**: An I/O failure closes the handle; the next
//!    command reopens it, throttled to one attempt per `RECONNECT_INTERVAL`.
//! 4. **Performance First**: The TCP transport reuses its buffers and
//!    disables Nagle for small request/response exchanges.

use std::fmt;
use std::io::{BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use kvpool_common::{ClientError, ClientResult, ConnectError, PoolSettings, Target};
use tracing::{debug, warn};

use crate::pool::PoolCore;
use crate::resp::{encode_command, read_response, RespValue};

/// Minimum spacing between two reconnect attempts of the same connection.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(4);

/// Socket-level options applied when a transport is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    pub connect_timeout: Option<Duration>,
    pub io_timeout: Option<Duration>,
}

impl ConnectOptions {
    pub fn from_settings(settings: &PoolSettings) -> Self {
        ConnectOptions {
            connect_timeout: settings.connect_timeout(),
            io_timeout: settings.io_timeout(),
        }
    }
}

/// An open, authenticated channel to the cache server.
pub trait Transport: Send {
    /// Sends one command and reads its reply.
    fn exec(&mut self, args: &[&[u8]]) -> ClientResult<RespValue>;

    /// Returns true if the server answers `PING`.
    fn ping(&mut self) -> bool {
        matches!(self.exec(&[b"PING"]), Ok(RespValue::Simple(ref text)) if text == b"PONG")
    }

    /// Releases the underlying resources. Called at most once.
    fn close(&mut self) {}
}

/// Opens transports; injected into pools so tests can avoid the network.
pub trait Connector: Send + Sync {
    fn connect(&self, target: &Target, options: &ConnectOptions)
        -> Result<Box<dyn Transport>, ConnectError>;
}

/// Identity shared by every connection of one pool.
pub(crate) struct Origin {
    pub(crate) pool_id: u64,
    pub(crate) pool_name: Arc<str>,
    pub(crate) target: Target,
    pub(crate) options: ConnectOptions,
    pub(crate) connector: Arc<dyn Connector>,
}

impl Origin {
    pub(crate) fn open_transport(&self) -> Result<Box<dyn Transport>, ConnectError> {
        self.connector.connect(&self.target, &self.options)
    }
}

/// A connection checked out of (or idle in) a `ConnectionPool`.
///
/// Exclusively owned while checked out: the pool hands it out by value and
/// takes it back by value.
pub struct Connection {
    id: u64,
    origin: Arc<Origin>,
    pool: Weak<PoolCore>,
    handle: Option<Box<dyn Transport>>,
    created_at: Instant,
    last_active: Instant,
    last_connect: Instant,
}

impl Connection {
    /// Opens a fresh handle for `origin`.
    pub(crate) fn open(
        origin: Arc<Origin>,
        pool: Weak<PoolCore>,
        id: u64,
    ) -> Result<Self, ConnectError> {
        let handle = origin.open_transport()?;
        let now = Instant::now();
        debug!(pool = %origin.pool_name, endpoint = %origin.target, conn_id = id, "connection opened");
        Ok(Connection {
            id,
            origin,
            pool,
            handle: Some(handle),
            created_at: now,
            last_active: now,
            last_connect: now,
        })
    }

    /// Runs one raw command, reopening the handle first if it was lost.
    ///
    /// Server error replies come back as `Ok(RespValue::Error(..))`; I/O and
    /// framing failures close the handle so the pool will not reuse it.
    pub fn exec(&mut self, args: &[&[u8]]) -> ClientResult<RespValue> {
        if self.handle.is_none() {
            self.reconnect()?;
        }
        let Some(handle) = self.handle.as_mut() else {
            return Err(ClientError::Protocol);
        };

        let result = handle.exec(args);
        self.last_active = Instant::now();
        if let Err(err) = &result {
            if err.breaks_connection() {
                warn!(pool = %self.origin.pool_name, conn_id = self.id, error = %err, "closing broken connection");
                self.close_handle();
            }
        }
        result
    }

    /// Health-checks the handle; a failed ping closes it.
    pub fn ping(&mut self) -> bool {
        let alive = match self.handle.as_mut() {
            Some(handle) => handle.ping(),
            None => false,
        };
        if !alive {
            self.close_handle();
        }
        alive
    }

    /// Whether the connection currently holds an open handle.
    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Name of the pool this connection belongs to.
    pub fn pool_name(&self) -> &str {
        &self.origin.pool_name
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.origin.pool_id
    }

    pub fn target(&self) -> &Target {
        &self.origin.target
    }

    /// Time since the connection was last used or returned.
    pub fn idle_for(&self) -> Duration {
        self.last_active.elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    fn reconnect(&mut self) -> ClientResult<()> {
        let since = self.last_connect.elapsed();
        if since < RECONNECT_INTERVAL {
            return Err(ClientError::ReconnectThrottled {
                retry_in: RECONNECT_INTERVAL - since,
            });
        }

        self.last_connect = Instant::now();
        match self.origin.open_transport() {
            Ok(handle) => {
                debug!(pool = %self.origin.pool_name, conn_id = self.id, "connection reopened");
                self.handle = Some(handle);
                Ok(())
            }
            Err(err) => {
                warn!(pool = %self.origin.pool_name, conn_id = self.id, error = %err, "reconnect failed");
                Err(ClientError::Reconnect(Box::new(err)))
            }
        }
    }

    fn close_handle(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close();
        }
    }
}

// Must never run while the owning pool's state lock is held.
impl Drop for Connection {
    fn drop(&mut self) {
        debug!(pool = %self.origin.pool_name, conn_id = self.id, "connection closed");
        self.close_handle();
        if let Some(pool) = self.pool.upgrade() {
            pool.forget_slot();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("pool", &self.origin.pool_name)
            .field("target", &self.origin.target)
            .field("connected", &self.handle.is_some())
            .finish()
    }
}

/// Opens plain TCP transports, authenticating and selecting the database.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(
        &self,
        target: &Target,
        options: &ConnectOptions,
    ) -> Result<Box<dyn Transport>, ConnectError> {
        let stream = connect_stream(target, options.connect_timeout)?;
        stream.set_read_timeout(options.io_timeout)?;
        stream.set_write_timeout(options.io_timeout)?;
        stream.set_nodelay(true)?;

        let mut transport = TcpTransport::new(stream);
        transport.handshake(target)?;
        Ok(Box::new(transport))
    }
}

fn connect_stream(target: &Target, timeout: Option<Duration>) -> Result<TcpStream, ConnectError> {
    let addr = target.addr();
    let candidates: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .map_err(|_| ConnectError::InvalidAddress(addr.clone()))?
        .collect();
    if candidates.is_empty() {
        return Err(ConnectError::InvalidAddress(addr));
    }

    let mut last_err = None;
    for candidate in candidates {
        let attempt = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&candidate, timeout),
            None => TcpStream::connect(candidate),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err
        .map(ConnectError::Io)
        .unwrap_or(ConnectError::InvalidAddress(addr)))
}

/// RESP2 over a TCP stream, with reusable buffers.
pub struct TcpTransport {
    // Buffered reader reduces syscalls while writes go straight to the socket.
    reader: BufReader<TcpStream>,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
}

impl TcpTransport {
    fn new(stream: TcpStream) -> Self {
        TcpTransport {
            reader: BufReader::new(stream),
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
        }
    }

    fn handshake(&mut self, target: &Target) -> Result<(), ConnectError> {
        if let Some(password) = &target.password {
            match self.exec(&[b"AUTH", password.as_bytes()]) {
                Ok(reply) if reply.is_ok() => {}
                Ok(RespValue::Error(message)) => {
                    return Err(ConnectError::AuthRejected(
                        String::from_utf8_lossy(&message).into_owned(),
                    ))
                }
                Ok(other) => return Err(unexpected("AUTH", &other)),
                Err(err) => return Err(handshake_failure(err)),
            }
        }

        if target.db != 0 {
            let db = target.db.to_string();
            match self.exec(&[b"SELECT", db.as_bytes()]) {
                Ok(reply) if reply.is_ok() => {}
                Ok(RespValue::Error(message)) => {
                    return Err(ConnectError::SelectRejected {
                        db: target.db,
                        message: String::from_utf8_lossy(&message).into_owned(),
                    })
                }
                Ok(other) => return Err(unexpected("SELECT", &other)),
                Err(err) => return Err(handshake_failure(err)),
            }
        }
        Ok(())
    }
}

fn unexpected(command: &str, reply: &RespValue) -> ConnectError {
    ConnectError::Handshake(format!("unexpected {command} reply: {reply:?}"))
}

fn handshake_failure(err: ClientError) -> ConnectError {
    match err {
        ClientError::Io(err) => ConnectError::Io(err),
        other => ConnectError::Handshake(other.to_string()),
    }
}

impl Transport for TcpTransport {
    fn exec(&mut self, args: &[&[u8]]) -> ClientResult<RespValue> {
        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);

        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()?;

        read_response(&mut self.reader, &mut self.line_buf)
    }

    fn close(&mut self) {
        let _ = self.reader.get_ref().shutdown(Shutdown::Both);
    }
}
