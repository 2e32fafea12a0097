//! Application settings stored in `config.toml`

use crate::controller::report::DeviceIndex;
use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};

pub const APP_DIR: &str = "padremap";
pub const CONFIG_FILE: &str = "config.toml";
pub const PROFILES_DIR: &str = "profiles";
pub const CALIBRATIONS_FILE: &str = "calibrations.toml";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// One of trace, debug, info, warn, error
    pub log_level: String,
    pub poll_interval_ms: u64,
    pub default_profile: String,
    /// Profile per device slot, keyed by slot number
    pub device_profiles: BTreeMap<String, String>,
    pub autosave_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            poll_interval_ms: 4,
            default_profile: "default".to_string(),
            device_profiles: BTreeMap::new(),
            autosave_interval_secs: 300,
        }
    }
}

impl AppConfig {
    pub fn level(&self) -> Level {
        match self.log_level.to_ascii_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }

    /// Device slots with a profile other than the default
    pub fn device_overrides(&self) -> Vec<(DeviceIndex, String)> {
        self.device_profiles
            .iter()
            .filter_map(|(slot, profile)| {
                let device = slot.parse::<usize>().ok().and_then(DeviceIndex::new);
                if device.is_none() {
                    warn!("Ignoring profile override for unknown device slot '{}'", slot);
                }
                device.map(|d| (d, profile.clone()))
            })
            .collect()
    }

    /// Reads the config file, writing defaults first if it does not exist
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            info!("Creating default application config at {}", path.display());
            let config = Self::default();
            config.save(path).await?;
            return Ok(config);
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file: {}", e))?;
        toml::from_str(&content).map_err(|e| eyre!("Failed to parse config file: {}", e))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize application config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file: {}", e))
    }
}

/// `<config dir>/padremap`, or `./padremap` when the platform has none
pub fn config_root() -> PathBuf {
    let base = dirs::config_dir().unwrap_or_else(|| {
        warn!("Could not determine config directory, using current directory");
        PathBuf::from(".")
    });
    base.join(APP_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            log_level = "debug"
            [device_profiles]
            1 = "racing"
            9 = "ignored"
            "#,
        )
        .unwrap();

        assert_eq!(config.level(), Level::DEBUG);
        assert_eq!(config.default_profile, "default");
        assert_eq!(
            config.device_overrides(),
            vec![(DeviceIndex::new(1).unwrap(), "racing".to_string())]
        );
    }

    #[test]
    fn unknown_level_means_info() {
        let config = AppConfig {
            log_level: "loud".to_string(),
            ..AppConfig::default()
        };
        assert_eq!(config.level(), Level::INFO);
    }
}
