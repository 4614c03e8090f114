//! Relay configuration.
//!
//! Resolved once at startup and immutable afterwards. Raw integers coming from
//! the command line go through [`RelayConfig::from_raw`] so that negative or
//! out-of-range values are rejected before the server binds.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 8443;

/// Default number of messages replayed to a new connection.
pub const DEFAULT_HISTORY_WINDOW: usize = 20;

/// Default interval between durable-log flush cycles.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Default durable-log path.
pub const DEFAULT_LOG_PATH: &str = "./history.log";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid port {0}: must be between 0 and 65535")]
    InvalidPort(i64),
    #[error("invalid history size {0}: must be non-negative")]
    NegativeHistory(i64),
    #[error("bind host must not be empty")]
    EmptyBindHost,
    #[error("log path must not be empty")]
    EmptyLogPath,
    #[error("flush interval must be greater than zero")]
    ZeroFlushInterval,
}

/// Relay configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    /// Host/interface to bind to
    pub bind_host: String,
    /// Listen port (0 = pick an ephemeral port)
    pub port: u16,
    /// Deliver a sender's own message back to it
    pub self_echo: bool,
    /// Number of recent messages replayed to new connections (0 = none)
    pub history_window: usize,
    /// Append-only durable log
    pub log_path: PathBuf,
    /// Period of the durable-log flush cycle
    pub flush_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            self_echo: false,
            history_window: DEFAULT_HISTORY_WINDOW,
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

impl RelayConfig {
    /// Build a config from unvalidated command-line integers.
    ///
    /// Everything not covered by the arguments keeps its default.
    pub fn from_raw(port: i64, self_echo: bool, history: i64) -> Result<Self, ConfigError> {
        let port = u16::try_from(port).map_err(|_| ConfigError::InvalidPort(port))?;
        if history < 0 {
            return Err(ConfigError::NegativeHistory(history));
        }
        let history_window =
            usize::try_from(history).map_err(|_| ConfigError::NegativeHistory(history))?;

        Ok(Self {
            port,
            self_echo,
            history_window,
            ..Self::default()
        })
    }

    /// Config for testing: loopback interface, ephemeral port, fast flushes.
    pub fn for_testing(log_path: impl Into<PathBuf>) -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            port: 0,
            log_path: log_path.into(),
            flush_interval: Duration::from_millis(100),
            ..Self::default()
        }
    }

    /// Check the invariants that the type system does not already enforce.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_host.trim().is_empty() {
            return Err(ConfigError::EmptyBindHost);
        }
        if self.log_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyLogPath);
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::ZeroFlushInterval);
        }
        Ok(())
    }

    /// `host:port` string suitable for `TcpListener::bind`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }
}
