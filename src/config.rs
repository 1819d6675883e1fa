//! Layered driver configuration
//!
//! A [`DriverConfig`] is resolved once, in [`DriverConfigBuilder::build`], from
//! three layers where later layers win:
//!
//! 1. built-in defaults
//! 2. `CUBEJS_DB_*` environment values
//! 3. explicit overrides set on the builder
//!
//! The environment is passed in as a map so it can be faked in tests.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::connection::ConnectionConfig;
use crate::error::{Error, Result};
use crate::pool::PoolConfig;

/// Backend host
pub const ENV_DB_HOST: &str = "CUBEJS_DB_HOST";
/// Database name
pub const ENV_DB_NAME: &str = "CUBEJS_DB_NAME";
/// Backend port
pub const ENV_DB_PORT: &str = "CUBEJS_DB_PORT";
/// User name
pub const ENV_DB_USER: &str = "CUBEJS_DB_USER";
/// Password
pub const ENV_DB_PASS: &str = "CUBEJS_DB_PASS";
/// Unix socket path
pub const ENV_DB_SOCKET_PATH: &str = "CUBEJS_DB_SOCKET_PATH";
/// Maximum pool size
pub const ENV_DB_MAX_POOL: &str = "CUBEJS_DB_MAX_POOL";

const ENV_PREFIX: &str = "CUBEJS_DB_";

/// Fully resolved driver configuration
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Where connections go
    pub connection: ConnectionConfig,
    /// Pool sizing and timeouts
    pub pool: PoolConfig,
    /// Dialect name passed to [`crate::dialect::dialect_for`]
    pub dialect: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            pool: PoolConfig::default(),
            dialect: "cubestore".to_string(),
        }
    }
}

impl DriverConfig {
    /// Start a builder with no environment layer
    pub fn builder() -> DriverConfigBuilder {
        DriverConfigBuilder::default()
    }

    /// Resolve defaults overlaid with the process environment
    pub fn from_env() -> Result<Self> {
        Self::builder().with_process_env().build()
    }
}

/// Builder resolving defaults, environment and overrides into a [`DriverConfig`]
#[derive(Debug, Default, Clone)]
pub struct DriverConfigBuilder {
    env: HashMap<String, String>,

    url: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    database: Option<String>,
    user: Option<String>,
    password: Option<String>,
    socket_path: Option<String>,
    timezone: Option<String>,
    connect_timeout_ms: Option<u64>,
    dialect: Option<String>,

    min_size: Option<usize>,
    max_size: Option<usize>,
    idle_timeout: Option<Duration>,
    soft_idle_timeout: Option<Duration>,
    eviction_interval: Option<Duration>,
    acquire_timeout: Option<Duration>,
    validate_on_borrow: Option<bool>,
}

impl DriverConfigBuilder {
    /// Use the given map as the environment layer
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Use the `CUBEJS_DB_*` variables of the current process as the environment layer
    pub fn with_process_env(self) -> Self {
        let env = std::env::vars()
            .filter(|(key, _)| key.starts_with(ENV_PREFIX))
            .collect();
        self.with_env(env)
    }

    /// Connection URL; wins over the discrete connection fields
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Backend host
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Backend port
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Database name
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// User name
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Password
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Unix socket path
    pub fn socket_path(mut self, path: impl Into<String>) -> Self {
        self.socket_path = Some(path.into());
        self
    }

    /// Session timezone
    pub fn timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    /// Connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Dialect name (`cubestore` or `mysql`)
    pub fn dialect(mut self, name: impl Into<String>) -> Self {
        self.dialect = Some(name.into());
        self
    }

    /// Minimum pool size
    pub fn min_pool_size(mut self, size: usize) -> Self {
        self.min_size = Some(size);
        self
    }

    /// Maximum pool size
    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.max_size = Some(size);
        self
    }

    /// Idle timeout
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Soft idle timeout
    pub fn soft_idle_timeout(mut self, timeout: Duration) -> Self {
        self.soft_idle_timeout = Some(timeout);
        self
    }

    /// Eviction interval
    pub fn eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = Some(interval);
        self
    }

    /// Acquire timeout
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Health-check idle connections before handing them out
    pub fn validate_on_borrow(mut self, validate: bool) -> Self {
        self.validate_on_borrow = Some(validate);
        self
    }

    fn env_str(&self, key: &str) -> Option<String> {
        self.env
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    fn env_parse<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        self.env_str(key)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|_| Error::config(format!("{} has invalid value '{}'", key, raw)))
            })
            .transpose()
    }

    /// Resolve all layers and validate the result
    pub fn build(self) -> Result<DriverConfig> {
        let defaults = DriverConfig::default();

        let mut connection = defaults.connection;
        if let Some(host) = self.host.clone().or_else(|| self.env_str(ENV_DB_HOST)) {
            connection.host = host;
        }
        let port = match self.port {
            Some(port) => Some(port),
            None => self.env_parse::<u16>(ENV_DB_PORT)?,
        };
        if let Some(port) = port {
            connection.port = port;
        }
        connection.database = self.database.clone().or_else(|| self.env_str(ENV_DB_NAME));
        connection.user = self.user.clone().or_else(|| self.env_str(ENV_DB_USER));
        connection.password = self.password.clone().or_else(|| self.env_str(ENV_DB_PASS));
        connection.socket_path = self
            .socket_path
            .clone()
            .or_else(|| self.env_str(ENV_DB_SOCKET_PATH));
        connection.url = self.url.clone();
        if let Some(timezone) = self.timezone.clone() {
            connection.timezone = timezone;
        }
        if let Some(ms) = self.connect_timeout_ms {
            connection.connect_timeout_ms = ms;
        }

        let mut pool = defaults.pool;
        if let Some(max) = self.env_parse::<usize>(ENV_DB_MAX_POOL)? {
            pool.max_size = max;
        }
        if let Some(max) = self.max_size {
            pool.max_size = max;
        }
        if let Some(min) = self.min_size {
            pool.min_size = min;
        }
        if let Some(timeout) = self.idle_timeout {
            pool.idle_timeout = timeout;
        }
        if let Some(timeout) = self.soft_idle_timeout {
            pool.soft_idle_timeout = timeout;
        }
        if let Some(interval) = self.eviction_interval {
            pool.eviction_interval = interval;
        }
        if let Some(timeout) = self.acquire_timeout {
            pool.acquire_timeout = timeout;
        }
        if let Some(validate) = self.validate_on_borrow {
            pool.validate_on_borrow = validate;
        }
        pool.validate()?;

        Ok(DriverConfig {
            connection,
            pool,
            dialect: self.dialect.unwrap_or(defaults.dialect),
        })
    }
}
