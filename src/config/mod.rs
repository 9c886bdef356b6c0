//! Daemon configuration: a TOML file with a `[logger]` and a `[proxy]`
//! section, loaded once at startup.
//!
//! ```toml
//! [logger]
//! level = "info"
//!
//! [proxy]
//! broker_uri = "tcp://broker.internal:1883"
//! port = 1883
//!
//! [proxy.reconnect]
//! base_reconnect_millis = 100
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
};

use relaymq_mqtt_v3::ProxyConfig;
use serde::{Deserialize, Serialize};
use time::{format_description::FormatItem, macros::format_description, OffsetDateTime};
use validator::Validate;

use self::logger::LoggerConfig;

pub mod logger;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "RELAYMQ_CONFIG";

pub const DEFAULT_CONFIG_PATH: &str = "/etc/relaymq/config.toml";

const CONSOLE_TIMESTAMP: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z");

#[doc(hidden)]
pub fn console_timestamp() -> String {
    OffsetDateTime::now_utc().format(CONSOLE_TIMESTAMP).unwrap_or_default()
}

/// Prints a timestamped line before the tracing subscriber exists.
#[doc(hidden)]
#[macro_export]
macro_rules! print_line {
    ($level:expr, $($arg:tt)*) => {
        println!(
            "{}  {} {}",
            ::console::style($crate::config::console_timestamp()).dim(),
            $level,
            format_args!($($arg)*)
        )
    };
}

#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => { $crate::print_line!(::console::style("INFO").green(), $($arg)*) };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => { $crate::print_line!(::console::style("WARN").yellow(), $($arg)*) };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => { $crate::print_line!(::console::style("ERROR").red(), $($arg)*) };
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    #[validate(nested)]
    pub proxy: ProxyConfig,
}

impl Config {
    /// Loads the file named by `RELAYMQ_CONFIG`, or the default path.
    pub fn new() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        Self::load(&path)
    }

    fn config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Ok(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config(format!(
            "no configuration file found; set {} or create {}",
            CONFIG_ENV, DEFAULT_CONFIG_PATH
        )))
    }

    /// Reads, parses and validates `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!("{} does not exist", path.display())));
        }

        let text = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&text).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(config)
    }
}
