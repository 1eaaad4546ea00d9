//! Server configuration management

use crate::broker::BrokerConfig;
use crate::device::DeviceLoopConfig;
use anyhow::{Context, Result, anyhow};
use common::{MailboxConfig, RAW_HID_USAGE, RAW_HID_USAGE_PAGE};
use protocol::DeviceIdentity;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub broker: BrokerSettings,
    #[serde(default)]
    pub device: DeviceSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Address the request router listens on
    #[serde(default = "ServerSettings::default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "ServerSettings::default_log_level")]
    pub log_level: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: Self::default_bind_addr(),
            log_level: Self::default_log_level(),
        }
    }
}

impl ServerSettings {
    fn default_bind_addr() -> String {
        "127.0.0.1:42060".to_string()
    }

    fn default_log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// Devices registered at startup, as `VID:PID` strings
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default = "BrokerSettings::default_write_read_timeout_ms")]
    pub write_read_timeout_ms: u64,
    /// Where the management pin is written on start (`~` is expanded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin_file: Option<String>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            write_read_timeout_ms: Self::default_write_read_timeout_ms(),
            pin_file: None,
        }
    }
}

impl BrokerSettings {
    fn default_write_read_timeout_ms() -> u64 {
        1000
    }

    /// Parse the configured device list
    pub fn device_identities(&self) -> Result<Vec<DeviceIdentity>> {
        self.devices
            .iter()
            .map(|s| {
                s.parse::<DeviceIdentity>()
                    .with_context(|| format!("Invalid device id '{}' in [broker] devices", s))
            })
            .collect()
    }

    /// `pin_file` with a leading `~` expanded
    pub fn pin_path(&self) -> Option<PathBuf> {
        self.pin_file
            .as_deref()
            .map(|raw| PathBuf::from(shellexpand::tilde(raw).as_ref()))
    }
}

/// Per-device loop tunables
///
/// Durations are in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub usage_page: u16,
    pub usage: u16,
    pub write_retries: u32,
    pub reconnect_backoff_ms: u64,
    pub idle_read_timeout_ms: u64,
    pub fragment_read_timeout_ms: u64,
    pub outbound_capacity: usize,
    pub inbound_capacity: usize,
    pub enqueue_timeout_ms: u64,
    pub handshake: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            usage_page: RAW_HID_USAGE_PAGE,
            usage: RAW_HID_USAGE,
            write_retries: 10,
            reconnect_backoff_ms: 5000,
            idle_read_timeout_ms: 5,
            fragment_read_timeout_ms: 5000,
            outbound_capacity: 100,
            inbound_capacity: 100,
            enqueue_timeout_ms: 5000,
            handshake: true,
        }
    }
}

impl From<&DeviceSettings> for DeviceLoopConfig {
    fn from(settings: &DeviceSettings) -> Self {
        Self {
            usage_page: settings.usage_page,
            usage: settings.usage,
            write_retries: settings.write_retries,
            reconnect_backoff: Duration::from_millis(settings.reconnect_backoff_ms),
            idle_read_timeout: Duration::from_millis(settings.idle_read_timeout_ms),
            fragment_read_timeout: Duration::from_millis(settings.fragment_read_timeout_ms),
            mailbox: MailboxConfig {
                outbound_capacity: settings.outbound_capacity,
                inbound_capacity: settings.inbound_capacity,
                enqueue_timeout: Duration::from_millis(settings.enqueue_timeout_ms),
            },
            handshake: settings.handshake,
        }
    }
}

impl ServerConfig {
    /// Load configuration from the specified path or the standard locations
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/hid-broker/server.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ServerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load from the standard locations, falling back to defaults
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("{:#}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("hid-broker").join("server.toml")
        } else {
            PathBuf::from(".config/hid-broker/server.toml")
        }
    }

    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.server.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.server.log_level,
                valid_levels.join(", ")
            ));
        }

        self.broker.device_identities()?;

        if self.device.outbound_capacity == 0 || self.device.inbound_capacity == 0 {
            return Err(anyhow!("Queue capacities must be at least 1"));
        }

        Ok(())
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            device: DeviceLoopConfig::from(&self.device),
            write_read_timeout: Duration::from_millis(self.broker.write_read_timeout_ms),
        }
    }
}
