//! # Configuration Management Module
//!
//! Runtime settings for the bridge, loaded once at startup.
//!
//! ## Configuration Structure
//!
//! - [`BridgeConfig`] - HTTP listener and stream settings
//! - [`MeshtasticConfig`] - Device communication settings
//! - [`LoggingConfig`] - Logging level and optional log file
//!
//! ## Configuration File Format
//!
//! ```toml
//! [bridge]
//! bind = "0.0.0.0"
//! port = 5000
//! heartbeat_secs = 30
//!
//! [meshtastic]
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//! handshake_timeout_secs = 10
//!
//! [logging]
//! level = "info"
//! # file = "meshbridge.log"
//! ```
//!
//! Every section and key is optional; missing values take the defaults above.
//!
//! ## Precedence
//!
//! CLI flag > environment (`MESHTASTIC_DEVICE`, `PORT`) > config file > defaults.
//! The environment is read by the CLI layer and handed to
//! [`Config::apply_overrides`].

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub meshtastic: MeshtasticConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Listen address for the HTTP server.
    pub bind: String,
    pub port: u16,
    /// Seconds of stream silence before a heartbeat comment is sent.
    pub heartbeat_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 5000,
            heartbeat_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshtasticConfig {
    pub port: String,
    pub baud_rate: u32,
    /// How long to wait for the radio's config download when opening a session.
    pub handshake_timeout_secs: u64,
}

impl Default for MeshtasticConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
            handshake_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl LoggingConfig {
    pub fn level_filter(&self) -> log::LevelFilter {
        self.level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists; otherwise fall back to defaults unless the
    /// path was given explicitly.
    pub async fn load_or_default(path: &str, explicit: bool) -> Result<Self> {
        if !explicit && !Path::new(path).exists() {
            return Ok(Config::default());
        }
        Self::load(path).await
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let content = toml::to_string_pretty(&Config::default())
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn apply_overrides(
        &mut self,
        device: Option<String>,
        http_port: Option<u16>,
        bind: Option<String>,
    ) {
        if let Some(device) = device.filter(|d| !d.trim().is_empty()) {
            self.meshtastic.port = device;
        }
        if let Some(port) = http_port {
            self.bridge.port = port;
        }
        if let Some(bind) = bind {
            self.bridge.bind = bind;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.meshtastic.port.trim().is_empty() {
            bail!("meshtastic.port must name a serial device");
        }
        if self.meshtastic.baud_rate == 0 {
            bail!("meshtastic.baud_rate must be non-zero");
        }
        if self.bridge.port == 0 {
            bail!("bridge.port must be non-zero");
        }
        if self.bridge.heartbeat_secs == 0 {
            bail!("bridge.heartbeat_secs must be at least 1");
        }
        self.bind_addr()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .bridge
            .bind
            .parse()
            .map_err(|e| anyhow!("Invalid bind address '{}': {}", self.bridge.bind, e))?;
        Ok(SocketAddr::new(ip, self.bridge.port))
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.bridge.heartbeat_secs)
    }
}
