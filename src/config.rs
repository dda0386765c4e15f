//! Configuration
//!
//! TOML-backed configuration with full defaults, so both roles run without a
//! config file. Connection parameters, timeouts and the ad hoc Authorize
//! probe policies all live here rather than in code.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration for both roles.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub policy: ProbePolicy,
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

/// Default config file location (`~/.config/voltlink-ocpp/config.toml`).
pub fn default_config_path() -> PathBuf {
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("voltlink-ocpp")
        .join("config.toml")
}

/// CSMS server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Heartbeat interval advertised in BootNotification responses, seconds.
    pub heartbeat_interval: u64,
    /// Timeout for outbound CSMS→CP requests, seconds.
    pub message_timeout: u64,
    /// How often the heartbeat monitor scans sessions, seconds.
    pub monitor_check_interval: u64,
    /// How often the stats task logs counters, seconds.
    pub stats_interval: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
            heartbeat_interval: 300,
            message_timeout: 30,
            monitor_check_interval: 60,
            stats_interval: 300,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout)
    }
}

/// CP client settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Station ID; generated (`CP{4 hex}`) when absent.
    pub station_id: Option<String>,
    pub csms_url: String,
    pub model: String,
    pub vendor_name: String,
    pub serial_number: String,
    pub firmware_version: String,
    /// Seconds between heartbeats.
    pub heartbeat_interval: u64,
    /// Timeout for request-expecting Calls, seconds.
    pub message_timeout: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            station_id: None,
            csms_url: "ws://localhost:9000".to_string(),
            model: "Generic OCPP 2.1 CP".to_string(),
            vendor_name: "VoltLink".to_string(),
            serial_number: "VL-CP-0001".to_string(),
            firmware_version: "1.0.0".to_string(),
            heartbeat_interval: 8,
            message_timeout: 30,
            max_reconnect_attempts: 10,
        }
    }
}

impl ClientConfig {
    pub fn station_id_or_generated(&self) -> String {
        self.station_id.clone().unwrap_or_else(|| {
            format!(
                "CP{}",
                &uuid::Uuid::new_v4().simple().to_string()[..4].to_uppercase()
            )
        })
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout)
    }
}

/// The two ad hoc Authorize probes observed in the field.
///
/// Non-standard behavior: kept as configurable policy, off-switchable, and
/// not assumed to generalize to other deployments.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbePolicy {
    /// Issue one Authorize request to a CP shortly after boot acceptance.
    pub authorize_on_boot: bool,
    /// Delay before the post-boot probe, milliseconds.
    pub boot_probe_delay_ms: u64,
    /// Issue one Authorize request after this many heartbeats (0 disables).
    pub authorize_after_heartbeats: u64,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            authorize_on_boot: true,
            boot_probe_delay_ms: 500,
            authorize_after_heartbeats: 5,
        }
    }
}

impl ProbePolicy {
    pub fn boot_probe_delay(&self) -> Duration {
        Duration::from_millis(self.boot_probe_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
