//! Configuration file management

use anyhow::{Context, Result, anyhow};
use common::LogLevel;
use host::{ChannelSettings, MonitorSettings};
use model::DeviceFilter;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Contents of `usbhost.toml`
///
/// # Example Configuration
/// ```toml
/// watch = ["0x04f9:*", "0x1234:0x5678@1.4"]
///
/// [logging]
/// level = "info"
///
/// [transfer]
/// timeout_ms = 500
/// auto_poll_interrupt = true
///
/// [monitor]
/// poll_interval_ms = 250
/// force_polling = false
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Filters watched by `usbhost watch` when none are given on the command line
    #[serde(default)]
    pub watch: Vec<String>,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub transfer: ChannelSettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default)]
    pub level: LogLevel,
}

impl HostConfig {
    /// Load configuration from `path`, or from the first standard location that exists
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => expand(&p),
            None => {
                let candidates = vec![Self::default_path(), PathBuf::from("/etc/usbhost/usbhost.toml")];

                candidates
                    .into_iter()
                    .find(|p| p.exists())
                    .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
            }
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HostConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        let path = expand(path);
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbhost").join("usbhost.toml")
        } else {
            PathBuf::from(".config/usbhost/usbhost.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        for filter in &self.watch {
            filter
                .parse::<DeviceFilter>()
                .with_context(|| format!("Invalid watch filter '{}'", filter))?;
        }

        if self.monitor.poll_interval_ms == 0 {
            return Err(anyhow!("monitor.poll_interval_ms must be greater than 0"));
        }

        if self.transfer.poll_size == Some(0) {
            return Err(anyhow!("transfer.poll_size must be greater than 0"));
        }

        Ok(())
    }

    /// The watched filters, parsed
    pub fn watch_filters(&self) -> Result<Vec<DeviceFilter>> {
        self.watch
            .iter()
            .map(|f| {
                f.parse::<DeviceFilter>()
                    .with_context(|| format!("Invalid watch filter '{}'", f))
            })
            .collect()
    }
}

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HostConfig::default();
        assert_eq!(config.logging.level, LogLevel::Warning);
        assert_eq!(config.transfer, ChannelSettings::default());
        assert!(config.watch.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_watch_filters() {
        let mut config = HostConfig::default();
        config.watch = vec!["0x1234:0x5678".to_string(), "0x04f9:*@1.*".to_string()];
        assert!(config.validate().is_ok());
        assert_eq!(config.watch_filters().unwrap().len(), 2);

        config.watch.push("1234:5678".to_string());
        assert!(config.validate().is_err());
        assert!(config.watch_filters().is_err());
    }

    #[test]
    fn test_validate_intervals() {
        let mut config = HostConfig::default();
        config.monitor.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = HostConfig::default();
        config.transfer.poll_size = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = HostConfig::default();
        config.logging.level = LogLevel::DebugAll;
        config.watch = vec!["0x1234:0x5678".to_string()];
        config.transfer.poll_size = Some(1024);

        let toml_str = toml::to_string(&config).unwrap();
        let parsed: HostConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, parsed);
    }
}
