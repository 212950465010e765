//! Tracing subscriber setup.
//!
//! The library itself only emits `tracing` events. Applications that want to
//! see them call [`init`] (or [`init_from_config`]) once at startup.
//!
//! # Example
//! ```no_run
//! use async_gpib::logging::{self, LoggingConfig, OutputFormat};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LoggingConfig::new("debug").with_format(OutputFormat::Compact);
//! logging::init(&config)?;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use crate::config::{ConfigError, GpibConfig};

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line, human-friendly output
    #[default]
    Pretty,
    /// One line per event
    Compact,
    /// Newline-delimited JSON
    Json,
}

/// Logging settings, usually the `[logging]` table of the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is not set
    #[serde(default = "default_level")]
    pub level: String,
    /// Output format
    #[serde(default)]
    pub format: OutputFormat,
    /// Colored output (pretty format only)
    #[serde(default = "default_ansi")]
    pub ansi: bool,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_ansi() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: OutputFormat::default(),
            ansi: default_ansi(),
        }
    }
}

impl LoggingConfig {
    /// Settings with the given level and defaults otherwise.
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Default::default()
        }
    }

    /// Set the output format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable ANSI colors.
    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    /// The parsed level.
    pub fn level(&self) -> Result<Level, ConfigError> {
        parse_log_level(&self.level)
    }
}

/// Install the global subscriber described by the `[logging]` table.
pub fn init_from_config(config: &GpibConfig) -> Result<(), ConfigError> {
    init(&config.logging)
}

/// Install a global fmt subscriber.
///
/// `RUST_LOG` overrides the configured level. Calling this when a global
/// subscriber is already installed is not an error, so tests and embedding
/// applications can call it freely.
pub fn init(config: &LoggingConfig) -> Result<(), ConfigError> {
    let level = config.level()?;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_thread_names(true)
            .with_ansi(config.ansi)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_thread_names(true)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .or_else(|e| {
            let message = e.to_string();
            // Either the dispatcher or the `log` bridge was installed before
            if message.contains("already been set") || message.contains("already initialized") {
                Ok(())
            } else {
                Err(ConfigError::Logging(message))
            }
        })
}

fn parse_log_level(level: &str) -> Result<Level, ConfigError> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(ConfigError::Invalid(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert!(parse_log_level("verbose").is_err());
    }

    // `test_init_is_idempotent` lives in tests/logging_init.rs: it installs the
    // process-global subscriber, which conflicts with `#[traced_test]` tests
    // in this binary.

    #[test]
    fn test_init_rejects_bad_level() {
        assert!(init(&LoggingConfig::new("loud")).is_err());
    }

    #[test]
    fn test_format_names() {
        let config: LoggingConfig = toml::from_str("format = \"json\"").unwrap();
        assert_eq!(config.format, OutputFormat::Json);
        assert_eq!(config.level, "info");
        assert!(config.ansi);
    }
}
