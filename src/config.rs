//! Application configuration loaded from a TOML file.
//!
//! The file lives at `$VALVE_CONTROLLER_CONFIG` or, by default, under the
//! user's config directory. A missing file is written out with defaults so the
//! operator has something to edit; every section falls back to defaults for
//! fields it leaves out.

use crate::mqtt::config::{BrokerConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const CONFIG_ENV: &str = "VALVE_CONTROLLER_CONFIG";
const CONFIG_DIR: &str = "valve-controller";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub session: SessionConfig,
    pub relay: RelayConfig,
    pub display: DisplayConfig,
    pub network: NetworkConfig,
    pub watering: WateringConfig,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RelayBackend {
    Gpio,
    Simulated,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    pub backend: RelayBackend,
    /// BCM pin number driving the relay
    pub pin: u8,
    pub active_low: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            backend: RelayBackend::Gpio,
            pin: 4,
            active_low: false,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DisplayBackend {
    Lcd,
    Console,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct DisplayConfig {
    pub backend: DisplayBackend,
    pub i2c_bus: u8,
    pub address: u16,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            backend: DisplayBackend::Lcd,
            i2c_bus: 1,
            address: 0x27,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface whose IPv4 address is shown on the display
    pub interface: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: "wlan0".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct WateringConfig {
    pub tick_ms: u64,
    /// Pause after every schedule message before the next one is read
    pub schedule_settle_ms: u64,
}

impl Default for WateringConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            schedule_settle_ms: 2000,
        }
    }
}

impl WateringConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn schedule_settle(&self) -> Duration {
        Duration::from_millis(self.schedule_settle_ms)
    }
}

impl Config {
    /// Resolves the config file location from the environment or the user's config dir.
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// Loads the config at `path`, writing a default file first if none exists.
    pub async fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if !tokio::fs::try_exists(path).await.map_err(io_error)? {
            info!("No config found at {}, writing defaults", path.display());
            let config = Config::default();
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
            }
            tokio::fs::write(path, config.to_toml()?)
                .await
                .map_err(io_error)?;
            return Ok(config);
        }

        let content = tokio::fs::read_to_string(path).await.map_err(io_error)?;
        let config = Self::from_toml(&content)?;
        debug!("Loaded config from {}: {:?}", path.display(), config);
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let broker = &self.broker;
        if broker.host.is_empty() {
            return Err(ConfigError::Invalid("broker.host is empty".to_string()));
        }
        if broker.control_channel.is_empty() || broker.schedule_channel.is_empty() {
            return Err(ConfigError::Invalid(
                "channel names must not be empty".to_string(),
            ));
        }
        if broker.control_channel == broker.schedule_channel {
            return Err(ConfigError::Invalid(format!(
                "control and schedule channel are both '{}'",
                broker.control_channel
            )));
        }
        if self.session.poll_interval_ms == 0 || self.session.step_budget_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll interval and step budget must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
