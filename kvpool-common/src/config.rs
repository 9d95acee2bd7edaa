//! # Pool Configuration
//!
//! Purpose: Describe, per pool name, which cache endpoint to connect to and
//! how many connections the pool may hold, loaded from a TOML file.
//!
//! ```toml
//! [pools.token]
//! host = "127.0.0.1"
//! port = 6379
//! db = 0
//! password = ""
//! max_connections = 8
//! acquire_timeout_ms = 0
//! ```
//!
//! ## Notes
//! - Timeouts are plain milliseconds; `0` means "no timeout" everywhere.
//! - An empty password disables `AUTH`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default cache server port.
pub const DEFAULT_PORT: u16 = 6379;

/// Default pool capacity.
pub const DEFAULT_MAX_CONNECTIONS: usize = 16;

/// Default connect timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 200;

/// Identity of a remote cache endpoint.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub db: u16,
    pub password: Option<String>,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Target {
            host: host.into(),
            port,
            db: 0,
            password: None,
        }
    }

    /// Returns `host:port`, suitable for socket address resolution.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Manual impls keep the credential out of logs.
impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.db)
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db", &self.db)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Settings for one named pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    pub host: String,
    pub port: u16,
    pub db: u16,
    pub password: String,
    /// Capacity ceiling (idle + checked out).
    pub max_connections: usize,
    /// Connections opened as soon as the pool is first looked up.
    pub min_idle: usize,
    /// How long `acquire` blocks on a saturated pool; `0` waits forever.
    pub acquire_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Socket read/write timeout; `0` disables it.
    pub io_timeout_ms: u64,
    /// Ping idle connections before handing them out.
    pub health_check: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            db: 0,
            password: String::new(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_idle: 0,
            acquire_timeout_ms: 0,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            io_timeout_ms: 0,
            health_check: true,
        }
    }
}

impl PoolSettings {
    /// Resolves the endpoint these settings point at.
    pub fn target(&self) -> Target {
        Target {
            host: self.host.clone(),
            port: self.port,
            db: self.db,
            password: (!self.password.is_empty()).then(|| self.password.clone()),
        }
    }

    /// Acquire deadline, `None` meaning block indefinitely.
    pub fn acquire_timeout(&self) -> Option<Duration> {
        millis(self.acquire_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        millis(self.io_timeout_ms)
    }

    /// Checks the settings of the pool called `name`.
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid {
            pool: name.to_string(),
            reason: reason.to_string(),
        };
        if self.host.trim().is_empty() {
            return Err(invalid("host must not be empty"));
        }
        if self.port == 0 {
            return Err(invalid("port must be non-zero"));
        }
        if self.max_connections == 0 {
            return Err(invalid("max_connections must be at least 1"));
        }
        if self.min_idle > self.max_connections {
            return Err(invalid("min_idle cannot exceed max_connections"));
        }
        Ok(())
    }
}

fn millis(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_millis(value))
}

/// All configured pools, keyed by pool name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub pools: BTreeMap<String, PoolSettings>,
}

impl RegistryConfig {
    /// Reads, parses, and validates a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RegistryConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Adds or replaces one pool definition.
    pub fn with_pool(mut self, name: impl Into<String>, settings: PoolSettings) -> Self {
        self.pools.insert(name.into(), settings);
        self
    }

    pub fn get(&self, name: &str) -> Option<&PoolSettings> {
        self.pools.get(name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, settings) in &self.pools {
            settings.validate(name)?;
        }
        Ok(())
    }
}
