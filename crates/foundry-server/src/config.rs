//! Server configuration.
//!
//! Sources, highest precedence first:
//! - The file named by `--config`
//! - `foundry.toml`, `/etc/foundry/foundry.toml`, `~/.config/foundry/foundry.toml`
//! - Built-in defaults, where `FOUNDRY_HOST`, `FOUNDRY_PORT` and `PORT`
//!   replace the default host and port
//!
//! Every section may be omitted or partially filled in.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

const SEARCH_PATHS: [&str; 3] = [
    "foundry.toml",
    "/etc/foundry/foundry.toml",
    "~/.config/foundry/foundry.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub transport: TransportConfig,
    pub limits: LimitsConfig,
    pub heartbeat: HeartbeatConfig,
    pub metrics: MetricsConfig,
}

/// Where clients reach the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Route of the WebSocket endpoint.
    pub websocket_path: String,
}

/// Resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Upgrades beyond this many live connections get HTTP 503.
    pub max_connections: usize,
    /// Largest accepted inbound WebSocket message, in bytes.
    pub max_message_size: usize,
    /// Frames queued for one observer before it is dropped as too slow.
    pub observer_queue_capacity: usize,
}

/// Liveness checking of idle connections.
///
/// The server pings every connection at `interval_ms` and drops it when
/// nothing has been heard for `timeout_ms`, so dead observers leave the
/// fan-out set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

/// Prometheus exporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let host = std::env::var("FOUNDRY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = ["FOUNDRY_PORT", "PORT"]
            .iter()
            .find_map(|var| std::env::var(var).ok()?.parse().ok())
            .unwrap_or(3000);

        Self {
            host,
            port,
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: "/ws".to_string(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_message_size: 64 * 1024,
            observer_queue_capacity: foundry_core::DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 90_000,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
        }
    }
}

impl Config {
    /// Load and validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the explicit file cannot be read, if a file
    /// found on the search path cannot be parsed, or if validation fails.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::search() {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn search() -> Option<String> {
        SEARCH_PATHS
            .iter()
            .map(|p| shellexpand::tilde(p).into_owned())
            .find(|p| Path::new(p).exists())
    }

    /// Parse a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Reject settings the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        if !self.transport.websocket_path.starts_with('/') {
            bail!(
                "transport.websocket_path must start with '/', got {:?}",
                self.transport.websocket_path
            );
        }
        if matches!(self.transport.websocket_path.as_str(), "/" | "/health" | "/machines") {
            bail!(
                "transport.websocket_path {:?} collides with an HTTP route",
                self.transport.websocket_path
            );
        }
        if self.limits.max_connections == 0 {
            bail!("limits.max_connections must be at least 1");
        }
        if self.limits.observer_queue_capacity == 0 {
            bail!("limits.observer_queue_capacity must be at least 1");
        }
        if self.heartbeat.interval_ms == 0 || self.heartbeat.timeout_ms <= self.heartbeat.interval_ms {
            bail!("heartbeat.timeout_ms must exceed a non-zero heartbeat.interval_ms");
        }
        self.bind_addr().map(|_| ())
    }

    /// Socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.limits.max_message_size, 64 * 1024);
        assert!(config.metrics.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_bind_addr() {
        let config = Config {
            host: "0.0.0.0".to_string(),
            port: 3000,
            ..Config::default()
        };
        assert_eq!(config.bind_addr().unwrap().port(), 3000);

        let bad = Config {
            host: "not a host".to_string(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_connections = 500

            [transport]
            websocket_path = "/socket"
            "#,
        )
        .unwrap();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_connections, 500);
        assert_eq!(config.limits.max_message_size, 64 * 1024);
        assert_eq!(config.limits.observer_queue_capacity, 1024);
        assert_eq!(config.transport.websocket_path, "/socket");
        assert_eq!(config.heartbeat.interval_ms, 30_000);
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.transport.websocket_path = "ws".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transport.websocket_path = "/machines".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.heartbeat.timeout_ms = config.heartbeat.interval_ms;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.limits.max_connections = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.limits.observer_queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_explicit_file() {
        assert!(Config::load(Some(Path::new("/nonexistent/foundry.toml"))).is_err());
    }
}
