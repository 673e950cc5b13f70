//! Layered bridge configuration using Figment.
//!
//! Sources, later ones overriding earlier ones:
//! 1. Built-in defaults ([`BridgeConfig::default`])
//! 2. A TOML file (`config/bridge.toml` unless another path is given)
//! 3. Environment variables prefixed with `BALANCE_BRIDGE_`, using `__` to
//!    separate nesting levels
//!
//! ```text
//! BALANCE_BRIDGE_INSTRUMENT__HOST=192.168.1.40
//! BALANCE_BRIDGE_STREAM__POLL_INTERVAL=500ms
//! ```
//!
//! A missing or empty instrument host is not an error: the bridge starts in
//! disabled mode and reports `not configured` to consumers.
//!
//! # Example
//! ```no_run
//! use bridge_core::BridgeConfig;
//!
//! let config = BridgeConfig::load()?;
//! config.validate()?;
//! println!("polling every {:?}", config.stream.poll_interval);
//! # Ok::<(), bridge_core::BridgeError>(())
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};
use crate::io::Endpoint;

/// Default configuration file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/bridge.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "BALANCE_BRIDGE_";

/// Top-level bridge configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Instrument address and exchange deadlines
    pub instrument: InstrumentConfig,
    /// Reconnect backoff
    pub reconnect: ReconnectConfig,
    /// Streaming cadence and buffering
    pub stream: StreamConfig,
    /// Default stability detector parameters for consumers
    pub stability: StabilityConfig,
    /// HTTP listener
    pub server: ServerConfig,
    /// Log output
    pub logging: LoggingConfig,
}

/// Instrument connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Balance host name or IP. Absent or blank disables the bridge.
    pub host: Option<String>,
    /// Balance TCP port
    pub port: u16,
    /// Master switch; `false` disables the bridge even with a host set
    pub enabled: bool,
    /// Deadline for opening the TCP connection
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Deadline for one command/response exchange
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
}

/// Reconnect backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retry and after every successful connect
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Upper bound on the delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Growth factor per consecutive failure
    pub multiplier: f64,
}

/// Stream endpoint settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Time between polls while at least one subscriber is attached
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Fan-out buffer; slower subscribers skip readings beyond this
    pub fanout_capacity: usize,
    /// Per-subscriber output queue
    pub subscriber_capacity: usize,
}

/// Stability detector defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    /// Number of readings in the rolling window
    pub window: usize,
    /// Maximum max-min spread inside the window
    pub tolerance: f64,
}

/// HTTP server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for the stream endpoint
    pub bind: SocketAddr,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (`info`, `debug`, `bridge_driver_mtsics=trace`, ...)
    pub level: String,
    /// Output format: `pretty`, `compact` or `json`
    pub format: String,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 8001,
            enabled: true,
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(2),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            fanout_capacity: 64,
            subscriber_capacity: 16,
        }
    }
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            window: crate::stability::DEFAULT_WINDOW,
            tolerance: crate::stability::DEFAULT_TOLERANCE,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8765)),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl InstrumentConfig {
    /// Instrument endpoint, or `None` when the bridge should run disabled.
    pub fn endpoint(&self) -> Option<Endpoint> {
        if !self.enabled {
            return None;
        }
        let host = self.host.as_deref()?.trim();
        if host.is_empty() {
            return None;
        }
        Some(Endpoint::new(host, self.port))
    }
}

impl BridgeConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> BridgeResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment.
    ///
    /// A missing file is treated as empty.
    pub fn load_from<P: AsRef<Path>>(path: P) -> BridgeResult<Self> {
        Self::figment(path.as_ref())
            .extract()
            .map_err(|e| BridgeError::Configuration(e.to_string()))
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> BridgeResult<()> {
        let invalid = |msg: String| Err(BridgeError::Configuration(msg));

        if self.instrument.endpoint().is_some() && self.instrument.port == 0 {
            return invalid("instrument.port must be non-zero".to_string());
        }
        if self.instrument.connect_timeout.is_zero() || self.instrument.command_timeout.is_zero() {
            return invalid("instrument timeouts must be greater than zero".to_string());
        }
        if self.reconnect.initial_delay.is_zero() {
            return invalid("reconnect.initial_delay must be greater than zero".to_string());
        }
        if self.reconnect.max_delay < self.reconnect.initial_delay {
            return invalid(format!(
                "reconnect.max_delay ({:?}) is shorter than reconnect.initial_delay ({:?})",
                self.reconnect.max_delay, self.reconnect.initial_delay
            ));
        }
        if !self.reconnect.multiplier.is_finite() || self.reconnect.multiplier < 1.0 {
            return invalid(format!(
                "reconnect.multiplier {} must be a finite value >= 1.0",
                self.reconnect.multiplier
            ));
        }
        if self.stream.poll_interval.is_zero() {
            return invalid("stream.poll_interval must be greater than zero".to_string());
        }
        if self.stream.fanout_capacity == 0 || self.stream.subscriber_capacity == 0 {
            return invalid("stream buffer capacities must be greater than zero".to_string());
        }
        if self.stability.window == 0 {
            return invalid("stability.window must be at least 1".to_string());
        }
        if !self.stability.tolerance.is_finite() || self.stability.tolerance < 0.0 {
            return invalid(format!(
                "stability.tolerance {} must be a finite non-negative value",
                self.stability.tolerance
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return invalid(format!(
                "Invalid logging.format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            ));
        }

        Ok(())
    }
}
