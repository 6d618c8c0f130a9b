//! Application configuration: one TOML file with a section per concern.
//!
//! ```toml
//! [logger]
//! level = "info"
//!
//! [transport]
//! host = "mqtt.home.local"
//! client_id = "relaybee-01"
//!
//! [demo]
//! topic = "relaybee/demo"
//! ```
//!
//! Every section and field is optional. The file is loaded once at startup
//! and stays immutable afterwards.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use validator::Validate;

use self::{demo::DemoConfig, logger::LoggerConfig};

pub mod demo;
pub mod logger;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "RELAYBEE_CONFIG";

/// Used when [`CONFIG_ENV`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/relaybee/config.toml";

/// Timestamped console output for use before the tracing subscriber exists.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        $crate::config::early_print(console::style("INFO").green(), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        $crate::config::early_print(console::style("WARN").yellow(), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        $crate::config::early_print(console::style("ERROR").red(), format_args!($($arg)*))
    };
}

#[doc(hidden)]
pub fn early_print(level: console::StyledObject<&str>, message: std::fmt::Arguments<'_>) {
    let format = time::macros::format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
    );
    let now = time::OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_default();
    println!("{}  {} {}", console::style(now).dim(), level, message);
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("No configuration file found (set {CONFIG_ENV} or create {DEFAULT_CONFIG_PATH})")]
    NotFound,

    #[error("IO error while reading configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error while reading configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Top-level application configuration.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    /// MQTT session settings, passed to the session layer unchanged.
    #[validate(nested)]
    pub transport: relaybee_mqtt_session::Config,

    #[validate(nested)]
    pub demo: DemoConfig,
}

impl Config {
    /// Locates and loads the configuration file.
    pub fn new() -> Result<Self, ConfigError> {
        let path = Self::config_path(std::env::var(CONFIG_ENV).ok())?;
        Self::load(&path)
    }

    /// Picks the file named by the environment, else the default path if it
    /// exists.
    fn config_path(from_env: Option<String>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = from_env {
            let path = PathBuf::from(path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Ok(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::NotFound)
    }

    /// Reads, parses and validates the file at `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&text)?;
        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
}
