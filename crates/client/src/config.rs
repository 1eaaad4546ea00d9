//! Client configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub client: ClientSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Broker router address
    pub endpoint: String,
    pub log_level: String,
    /// How long to wait for a reply before giving up
    pub request_timeout_ms: u64,
    /// File holding the broker's management pin (`~` is expanded)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pin_file: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:42060".to_string(),
            log_level: "warn".to_string(),
            request_timeout_ms: 5000,
            pin_file: None,
        }
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl ClientConfig {
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/hid-broker/client.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ClientConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default() -> Self {
        Self::load(None).unwrap_or_default()
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
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("hid-broker").join("client.toml")
        } else {
            PathBuf::from(".config/hid-broker/client.toml")
        }
    }

    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.client.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.client.log_level,
                valid_levels.join(", ")
            ));
        }
        if self.client.request_timeout_ms == 0 {
            return Err(anyhow!("request_timeout_ms must be greater than zero"));
        }
        Ok(())
    }
}

/// Read a management pin from `path`, expanding a leading `~`
pub fn read_pin_file(path: &str) -> Result<String> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    let pin = fs::read_to_string(&path_buf)
        .with_context(|| format!("Failed to read pin file: {}", path_buf.display()))?;
    let pin = pin.trim();
    if pin.is_empty() {
        return Err(anyhow!("Pin file {} is empty", path_buf.display()));
    }
    Ok(pin.to_string())
}
