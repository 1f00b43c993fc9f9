/*!
 * Configuration management for MapperFlow.
 *
 * A driver process reads two sections: `logging` and `driver`. The second
 * bounds reconnection and publishing and names the vendor library.
 */
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::utils::millis_to_duration;

/// Settings a MapperFlow driver process starts with
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Log filter and format
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Driver tunables
    #[serde(default)]
    pub driver: DriverConfig,
}

/// `[logging]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `mapperflow_driver=debug`
    pub level: String,

    /// Print the event target in front of each line
    pub show_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            show_target: true,
        }
    }
}

/// `[driver]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Pause before each reconnect attempt, in milliseconds
    pub reconnect_interval_ms: u64,

    /// Reconnect attempts before a device is left disconnected
    pub max_retry_times: u32,

    /// Deadline of one image upload, in milliseconds
    pub publish_timeout_ms: u64,

    /// Capture format of a freshly opened device
    pub default_image_format: String,

    /// Location of the vendor camera library
    pub library_path: PathBuf,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: 5_000,
            max_retry_times: 100,
            publish_timeout_ms: 30_000,
            default_image_format: "jpeg".into(),
            library_path: PathBuf::from("../bin/librcapi.so"),
        }
    }
}

impl DriverConfig {
    /// `reconnect_interval_ms` as a duration
    pub fn reconnect_interval(&self) -> Duration {
        millis_to_duration(self.reconnect_interval_ms)
    }

    /// `publish_timeout_ms` as a duration
    pub fn publish_timeout(&self) -> Duration {
        millis_to_duration(self.publish_timeout_ms)
    }

    /// Reject values the driver cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.reconnect_interval_ms == 0 {
            return Err(Error::config("driver.reconnect_interval_ms must be positive"));
        }
        if self.publish_timeout_ms == 0 {
            return Err(Error::config("driver.publish_timeout_ms must be positive"));
        }
        Ok(())
    }
}

/// Layers defaults, an optional file and prefixed environment variables
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    file: Option<PathBuf>,
    env_prefix: Option<String>,
}

impl ConfigBuilder {
    /// A builder that yields the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `path` on top of the defaults if it exists. The format follows
    /// the extension (toml, yaml, json).
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Read `PREFIX__SECTION__KEY` variables last
    pub fn env_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    /// Merge the layers and validate the result
    pub fn build(self) -> Result<Config> {
        let defaults = ConfigLib::try_from(&Config::default())?;
        let mut layers = ConfigLib::builder().add_source(defaults);

        match self.file {
            Some(path) if path.exists() => {
                debug!("Reading driver configuration from {}", path.display());
                layers = layers.add_source(File::from(path));
            }
            Some(path) => debug!("No configuration file at {}, keeping defaults", path.display()),
            None => {}
        }

        if let Some(prefix) = self.env_prefix {
            debug!("Overriding configuration from {}__* variables", prefix);
            layers = layers.add_source(
                Environment::with_prefix(&prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: Config = layers.build()?.try_deserialize()?;
        config.driver.validate()?;
        info!(
            "Driver configuration: reconnect every {} ms, {} retries, upload timeout {} ms",
            config.driver.reconnect_interval_ms,
            config.driver.max_retry_times,
            config.driver.publish_timeout_ms
        );
        Ok(config)
    }
}
