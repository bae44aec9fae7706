//! Simulator configuration.
//!
//! Loaded from `--config <path>` or `foundry-sim.toml` in the working
//! directory, falling back to defaults. `FOUNDRY_SIM_URL` overrides the
//! default server URL.

use crate::generator::{GeneratorParams, DEFAULT_BASELINE, DEFAULT_NOISE_AMPLITUDE};
use foundry_protocol::Encoding;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "foundry-sim.toml";

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Simulator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// WebSocket URL of the server.
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Wire encoding requested from the server.
    #[serde(default)]
    pub format: Encoding,

    /// Tick interval in milliseconds.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Half-width of the random noise band.
    #[serde(default = "default_noise_amplitude")]
    pub noise_amplitude: f64,

    /// Baseline for sensors without a usable value.
    #[serde(default = "default_baseline")]
    pub default_baseline: f64,

    /// Reconnection backoff.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Exponential backoff for reconnecting to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first attempt in milliseconds.
    #[serde(default = "default_initial_delay")]
    pub initial_ms: u64,

    /// Backoff cap in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_ms: u64,

    /// Multiplier applied per attempt.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_server_url() -> String {
    std::env::var("FOUNDRY_SIM_URL").unwrap_or_else(|_| "ws://127.0.0.1:3000/ws".to_string())
}

fn default_tick_interval() -> u64 {
    500
}

fn default_noise_amplitude() -> f64 {
    DEFAULT_NOISE_AMPLITUDE
}

fn default_baseline() -> f64 {
    DEFAULT_BASELINE
}

fn default_initial_delay() -> u64 {
    250
}

fn default_max_delay() -> u64 {
    15_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            format: Encoding::default(),
            tick_interval_ms: default_tick_interval(),
            noise_amplitude: default_noise_amplitude(),
            default_baseline: default_baseline(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_delay(),
            max_ms: default_max_delay(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl SimulatorConfig {
    /// Load from an explicit path, or `foundry-sim.toml` if present, or
    /// defaults, then validate.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file cannot be read or parsed, or if
    /// validation fails.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let expanded = shellexpand::tilde(DEFAULT_CONFIG_FILE);
        let config = match explicit {
            Some(path) => Self::from_file(path)?,
            None if Path::new(expanded.as_ref()).exists() => Self::from_file(expanded.as_ref())?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject numbers the generator and the backoff cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.noise_amplitude.is_finite() && self.noise_amplitude >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "noise_amplitude must be a finite number >= 0, got {}",
                self.noise_amplitude
            )));
        }
        if !(self.default_baseline.is_finite() && self.default_baseline >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "default_baseline must be a finite number >= 0, got {}",
                self.default_baseline
            )));
        }
        if !(self.reconnect.backoff_factor.is_finite() && self.reconnect.backoff_factor >= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "reconnect.backoff_factor must be a finite number >= 1, got {}",
                self.reconnect.backoff_factor
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick_interval_ms must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Load from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    #[must_use]
    pub fn generator_params(&self) -> GeneratorParams {
        GeneratorParams {
            noise_amplitude: self.noise_amplitude,
            default_baseline: self.default_baseline,
        }
    }
}

impl ReconnectConfig {
    /// Delay before attempt `attempt` (1-based), with ±25% jitter.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let base = self.initial_ms as f64 * self.backoff_factor.max(1.0).powi(exp);
        let capped = base.min(self.max_ms as f64);
        let jitter = capped * 0.25 * rand::thread_rng().gen_range(-1.0..=1.0);
        Duration::from_millis((capped + jitter).max(1.0) as u64)
    }
}
