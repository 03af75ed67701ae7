/*!
 * Configuration management for ArmCell.
 *
 * This module provides functionality to load, validate, and access
 * configuration settings for the cell controller and its board sessions.
 */
use std::path::Path;
use std::sync::Arc;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Core configuration for ArmCell
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Board session configuration
    #[serde(default)]
    pub board: BoardConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Application environment (development, production, etc.)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to log to stdout
    #[serde(default = "default_log_stdout")]
    pub stdout: bool,
}

/// Board session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardConfig {
    /// Serial port path; when absent the port is auto-detected
    #[serde(default)]
    pub port: Option<String>,

    /// Serial baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Settle delay after opening the port, in milliseconds.
    /// Most controllers reset when the serial connection opens.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// How long capability discovery may run before failing, in milliseconds
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,

    /// Device-side sampling interval for input reports, in milliseconds
    #[serde(default = "default_sampling_interval_ms")]
    pub sampling_interval_ms: u64,

    /// Named pin layout ("uno", "mega"); when absent the layout is
    /// auto-detected through the capability handshake
    #[serde(default)]
    pub layout: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            logging: LoggingConfig::default(),
            board: BoardConfig::default(),
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            environment: default_environment(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            stdout: default_log_stdout(),
        }
    }
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
            settle_delay_ms: default_settle_delay_ms(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            sampling_interval_ms: default_sampling_interval_ms(),
            layout: None,
        }
    }
}

fn default_app_name() -> String {
    "armcell".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_stdout() -> bool {
    true
}

fn default_baud_rate() -> u32 {
    57600
}

fn default_settle_delay_ms() -> u64 {
    5000
}

fn default_discovery_timeout_ms() -> u64 {
    3000
}

fn default_sampling_interval_ms() -> u64 {
    19
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        let mut config_builder = ConfigLib::builder();

        // Start with default values
        let default_config = Config::default();
        config_builder = config_builder.add_source(
            config::Config::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        // Add configuration from file if specified
        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!(
                    "Configuration file {} does not exist, using defaults",
                    config_file
                );
            }
        }

        // Add configuration from environment variables if prefix is specified
        if let Some(prefix) = self.environment_prefix {
            debug!(
                "Loading configuration from environment variables with prefix {}",
                prefix
            );
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        // Build the config
        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        // Convert to our config type
        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.app_name, "armcell");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.board.baud_rate, 57600);
        assert_eq!(config.board.sampling_interval_ms, 19);
        assert!(config.board.port.is_none());
        assert!(config.board.layout.is_none());
    }

    #[test]
    fn test_config_builder_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.general.app_name, "armcell");
        assert_eq!(config.board.settle_delay_ms, 5000);
    }

    #[test]
    fn test_config_builder_with_file() -> Result<()> {
        let dir = tempdir().map_err(|e| Error::other(e.to_string()))?;
        let file_path = dir.path().join("config.toml");

        {
            let mut file = File::create(&file_path).map_err(|e| Error::other(e.to_string()))?;
            file.write_all(
                br#"
                [general]
                app_name = "cell-a"
                environment = "testing"

                [board]
                port = "/dev/ttyACM0"
                baud_rate = 115200
                layout = "uno"
            "#,
            )
            .map_err(|e| Error::other(e.to_string()))?;
        }

        let config = ConfigBuilder::new().with_config_file(file_path).build()?;

        assert_eq!(config.general.app_name, "cell-a");
        assert_eq!(config.general.environment, "testing");
        assert_eq!(config.board.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.board.baud_rate, 115200);
        assert_eq!(config.board.layout.as_deref(), Some("uno"));

        Ok(())
    }

    #[test]
    fn test_config_builder_with_env() -> Result<()> {
        env::set_var("ARMCELL__GENERAL__APP_NAME", "env-cell");
        env::set_var("ARMCELL__BOARD__BAUD_RATE", "9600");

        let config = ConfigBuilder::new()
            .with_environment_prefix("armcell")
            .build()?;

        assert_eq!(config.general.app_name, "env-cell");
        assert_eq!(config.board.baud_rate, 9600);

        // Clean up
        env::remove_var("ARMCELL__GENERAL__APP_NAME");
        env::remove_var("ARMCELL__BOARD__BAUD_RATE");

        Ok(())
    }

    #[test]
    fn test_shared_config() {
        let config = Config::default();
        let shared = SharedConfig::new(config);

        assert_eq!(shared.get().general.app_name, "armcell");

        let shared2 = shared.clone();
        assert_eq!(shared2.get().general.app_name, "armcell");
    }
}
