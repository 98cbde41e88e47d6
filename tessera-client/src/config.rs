//! Client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via TESSERA_CONFIG)
//! 3. Environment variables

use crate::endpoint::Endpoint;
use crate::error::ConfigError;
use crate::replica::{HintGranularity, DEFAULT_REVIVAL_WINDOW};
use crate::retry::{ExponentialBackoff, FixedRetry, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tessera_protocol::{PORT_OFFSET, WIRE_MAGIC};

/// Default dial timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(20);

/// Default interval at which a reader re-checks whether its socket is still current.
pub const DEFAULT_READ_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default margin subtracted from the time allowance sent to replicas.
pub const DEFAULT_RTT_MARGIN: Duration = Duration::from_millis(1);

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Transport settings of a connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Leading magic of the protocol family spoken on these connections.
    pub magic: u16,
    /// Dial timeout; a dial is also bounded by the request deadline.
    pub connect_timeout: Duration,
    /// Upper bound on a single blocking read in the reader task.
    pub read_poll_interval: Duration,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
}

impl ConnectionConfig {
    pub fn new(magic: u16) -> Self {
        Self {
            magic,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_poll_interval: DEFAULT_READ_POLL_INTERVAL,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_poll_interval(mut self, interval: Duration) -> Self {
        self.read_poll_interval = interval;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new(WIRE_MAGIC)
    }
}

/// Retry policy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryKind {
    /// Three immediate attempts.
    Fixed,
    /// Five attempts, 1 ms doubling to 32 ms.
    #[default]
    Exponential,
}

impl RetryKind {
    pub fn policy(self) -> Arc<dyn RetryPolicy> {
        match self {
            RetryKind::Fixed => Arc::new(FixedRetry::default()),
            RetryKind::Exponential => Arc::new(ExponentialBackoff::default()),
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "fixed" => Some(RetryKind::Fixed),
            "exponential" | "exp" => Some(RetryKind::Exponential),
            _ => None,
        }
    }
}

/// Key-value client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Nominal replica endpoints, in selection order.
    pub replicas: Vec<Endpoint>,
    /// Added to each nominal port to reach the key-value service.
    pub port_offset: u16,
    pub connect_timeout_ms: u64,
    pub read_poll_ms: u64,
    pub read_buffer_size: usize,
    /// How long a failed replica is avoided.
    pub revival_secs: u64,
    /// Subtracted from the time allowance sent with each request.
    pub rtt_margin_us: u64,
    pub retry: RetryKind,
    pub hint: HintGranularity,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            replicas: Vec::new(),
            port_offset: PORT_OFFSET,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            read_poll_ms: DEFAULT_READ_POLL_INTERVAL.as_millis() as u64,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            revival_secs: DEFAULT_REVIVAL_WINDOW.as_secs(),
            rtt_margin_us: DEFAULT_RTT_MARGIN.as_micros() as u64,
            retry: RetryKind::default(),
            hint: HintGranularity::default(),
        }
    }
}

impl ClientConfig {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("TESSERA_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(list) = std::env::var("TESSERA_REPLICAS") {
            match Endpoint::parse_list(&list) {
                Ok(replicas) => self.replicas = replicas,
                Err(e) => tracing::warn!(value = %list, error = %e, "ignoring TESSERA_REPLICAS"),
            }
        }

        if let Ok(offset) = std::env::var("TESSERA_PORT_OFFSET") {
            if let Ok(n) = offset.parse() {
                self.port_offset = n;
            }
        }

        if let Ok(timeout) = std::env::var("TESSERA_CONNECT_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.connect_timeout_ms = ms;
            }
        }

        if let Ok(poll) = std::env::var("TESSERA_READ_POLL_MS") {
            if let Ok(ms) = poll.parse() {
                self.read_poll_ms = ms;
            }
        }

        if let Ok(revival) = std::env::var("TESSERA_REVIVAL_SECS") {
            if let Ok(secs) = revival.parse() {
                self.revival_secs = secs;
            }
        }

        if let Ok(margin) = std::env::var("TESSERA_RTT_MARGIN_US") {
            if let Ok(us) = margin.parse() {
                self.rtt_margin_us = us;
            }
        }

        if let Ok(retry) = std::env::var("TESSERA_RETRY") {
            if let Some(kind) = RetryKind::parse(&retry) {
                self.retry = kind;
            }
        }

        if let Ok(hint) = std::env::var("TESSERA_HINT") {
            if let Some(granularity) = HintGranularity::parse(&hint) {
                self.hint = granularity;
            }
        }
    }

    /// Checks that the configuration describes a usable replica set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replicas.is_empty() {
            return Err(ConfigError::Validation("no replicas configured".into()));
        }
        if self.read_poll_ms == 0 {
            return Err(ConfigError::Validation("read_poll_ms must be positive".into()));
        }
        self.service_endpoints().map(|_| ())
    }

    /// Replica endpoints with the port offset applied.
    pub fn service_endpoints(&self) -> Result<Vec<Endpoint>, ConfigError> {
        self.replicas
            .iter()
            .map(|ep| {
                ep.with_port_offset(self.port_offset).ok_or_else(|| {
                    ConfigError::Validation(format!(
                        "port offset {} overflows port of {}",
                        self.port_offset, ep
                    ))
                })
            })
            .collect()
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::new(WIRE_MAGIC)
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_read_poll_interval(Duration::from_millis(self.read_poll_ms))
            .with_read_buffer_size(self.read_buffer_size)
    }

    pub fn revival_window(&self) -> Duration {
        Duration::from_secs(self.revival_secs)
    }

    pub fn rtt_margin(&self) -> Duration {
        Duration::from_micros(self.rtt_margin_us)
    }
}
