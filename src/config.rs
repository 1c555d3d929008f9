use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the connscope daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Snapshot source connection configuration.
    #[serde(default)]
    pub source: SourceConfig,

    /// Reconciliation and throttling configuration.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Reconnection backoff policy.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Metrics and state HTTP server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Snapshot source connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// WebSocket URL of the core's connections stream.
    #[serde(default = "default_source_url")]
    pub url: String,

    /// Maximum time to wait for the handshake. Default: 10s.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

/// Reconciliation and throttling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Maximum number of closed connections retained. Default: 500.
    #[serde(default = "default_closed_capacity")]
    pub closed_capacity: usize,

    /// Minimum spacing between reconciliations. Default: 200ms.
    #[serde(default = "default_throttle_interval", with = "humantime_serde")]
    pub throttle_interval: Duration,

    /// How often to log a summary of the connection table. Default: 60s.
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,
}

/// Exponential reconnection backoff.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first retry. Default: 1s.
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Upper bound on the retry delay. Default: 30s.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Growth factor applied per consecutive failure. Default: 2.0.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

/// Metrics and state HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_source_url() -> String {
    "ws://127.0.0.1:9097/connections".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_closed_capacity() -> usize {
    crate::reconcile::DEFAULT_CLOSED_CAPACITY
}

fn default_throttle_interval() -> Duration {
    crate::throttle::DEFAULT_INTERVAL
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            source: SourceConfig::default(),
            monitor: MonitorConfig::default(),
            reconnect: ReconnectConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: default_source_url(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            closed_capacity: default_closed_capacity(),
            throttle_interval: default_throttle_interval(),
            stats_interval: default_stats_interval(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.source.url.is_empty() {
            bail!("source.url is required");
        }

        if !self.source.url.starts_with("ws://") {
            bail!("source.url must be a ws:// URL, got {:?}", self.source.url);
        }

        if self.source.connect_timeout.is_zero() {
            bail!("source.connect_timeout must be positive");
        }

        if self.monitor.closed_capacity == 0 {
            bail!("monitor.closed_capacity must be positive");
        }

        if self.monitor.throttle_interval.is_zero() {
            bail!("monitor.throttle_interval must be positive");
        }

        if self.monitor.stats_interval.is_zero() {
            bail!("monitor.stats_interval must be positive");
        }

        // A zero delay would allow back-to-back retries.
        if self.reconnect.initial_delay.is_zero() {
            bail!("reconnect.initial_delay must be positive");
        }

        if self.reconnect.max_delay < self.reconnect.initial_delay {
            bail!(
                "reconnect.max_delay {:?} must not be less than reconnect.initial_delay {:?}",
                self.reconnect.max_delay,
                self.reconnect.initial_delay
            );
        }

        if !self.reconnect.multiplier.is_finite() || self.reconnect.multiplier < 1.0 {
            bail!(
                "reconnect.multiplier must be at least 1.0, got {}",
                self.reconnect.multiplier
            );
        }

        Ok(())
    }
}
