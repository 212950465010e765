//! Configuration loading with figment.
//!
//! Sessions and logging can be described in a TOML file and overridden from
//! the environment (prefix `ASYNC_GPIB_`, nested keys separated by `__`,
//! e.g. `ASYNC_GPIB_LOGGING__LEVEL=debug`).
//!
//! ```toml
//! [logging]
//! level = "info"
//! format = "compact"
//!
//! [[sessions]]
//! name = "dmm"
//! board = 0
//! pad = 22
//! timeout = "3s"
//! eos_char = 0x0a
//! eos_mode = ["reos"]
//!
//! [[sessions]]
//! name = "controller"
//! board = 0
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::{MAX_ADDRESS, MAX_BOARDS};
use crate::error::GpibError;
use crate::logging::LoggingConfig;
use crate::session::{GpibSession, SessionBuilder};
use crate::termination::{EosMode, EosPolicy};
use crate::timeout::Timeout;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "ASYNC_GPIB_";

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file or environment could not be read or parsed
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    /// The configuration parsed but is not usable
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// The configuration could not be written out as TOML
    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The tracing subscriber could not be installed
    #[error("Failed to initialize logging: {0}")]
    Logging(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Load(Box::new(err))
    }
}

impl From<ConfigError> for GpibError {
    fn from(err: ConfigError) -> Self {
        GpibError::Config(err.to_string())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpibConfig {
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Named sessions
    #[serde(default)]
    pub sessions: Vec<SessionConfig>,
}

/// One board or device session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Unique name
    pub name: String,
    /// Board index
    #[serde(default)]
    pub board: u32,
    /// Primary address; absent for a board session
    #[serde(default)]
    pub pad: Option<u8>,
    /// Secondary address
    #[serde(default)]
    pub sad: Option<u8>,
    /// I/O timeout, e.g. "3s" or "100ms"; `"none"` disables it. Default 10 s
    #[serde(default = "default_timeout", with = "timeout_setting")]
    pub timeout: Option<Duration>,
    /// Assert EOI with the last byte of each write
    #[serde(default = "default_send_eoi")]
    pub send_eoi: bool,
    /// EOS byte
    #[serde(default)]
    pub eos_char: u8,
    /// EOS mode names: "reos", "xeos", "bin"
    #[serde(default)]
    pub eos_mode: Vec<String>,
}

fn default_send_eoi() -> bool {
    true
}

fn default_timeout() -> Option<Duration> {
    Timeout::default().duration()
}

/// Humantime durations plus the word `none` for "no timeout".
mod timeout_setting {
    use std::time::Duration;

    use serde::de::IntoDeserializer;
    use serde::{Deserialize, Deserializer, Serializer};

    const NONE: &str = "none";

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => humantime_serde::serialize(duration, serializer),
            None => serializer.serialize_str(NONE),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        let text = String::deserialize(deserializer)?;
        let text = text.trim();
        if text.eq_ignore_ascii_case(NONE) {
            return Ok(None);
        }
        let value: serde::de::value::StrDeserializer<'_, D::Error> = text.into_deserializer();
        humantime_serde::deserialize(value).map(Some)
    }
}

impl SessionConfig {
    /// The EOS policy described by `eos_char` and `eos_mode`.
    pub fn eos(&self) -> Result<EosPolicy, ConfigError> {
        let mut mode = EosMode::empty();
        for name in &self.eos_mode {
            mode |= EosMode::from_config_name(name).ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "session '{}': unknown eos_mode '{}'. Must be one of: reos, xeos, bin",
                    self.name, name
                ))
            })?;
        }
        Ok(EosPolicy {
            character: self.eos_char,
            mode,
        })
    }

    /// A session builder with these settings.
    pub fn builder(&self) -> Result<SessionBuilder, ConfigError> {
        let builder = match self.pad {
            Some(pad) => GpibSession::device(self.board, pad),
            None => GpibSession::board(self.board),
        };
        let builder = match self.sad {
            Some(sad) => builder.with_secondary_address(sad),
            None => builder,
        };
        Ok(builder
            .with_timeout(Timeout::from_duration(self.timeout))
            .with_send_eoi(self.send_eoi)
            .with_eos(self.eos()?))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| ConfigError::Invalid(format!("session '{}': {}", self.name, msg));
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("session name must not be empty".to_string()));
        }
        if self.board >= MAX_BOARDS {
            return Err(invalid(format!("board {} out of range 0..{}", self.board, MAX_BOARDS)));
        }
        if let Some(pad) = self.pad.filter(|pad| *pad > MAX_ADDRESS) {
            return Err(invalid(format!("pad {} out of range 0..={}", pad, MAX_ADDRESS)));
        }
        match self.sad {
            Some(sad) if sad > MAX_ADDRESS => {
                return Err(invalid(format!("sad {} out of range 0..={}", sad, MAX_ADDRESS)))
            }
            Some(_) if self.pad.is_none() => {
                return Err(invalid("sad requires pad".to_string()))
            }
            _ => {}
        }
        self.eos()?;
        Ok(())
    }
}

impl GpibConfig {
    /// Load `path`, apply environment overrides, and validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML string (no environment overrides) and validate.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::new().merge(Toml::string(toml)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Check log level, session names and address ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.logging.level()?;

        let mut names = HashSet::new();
        for session in &self.sessions {
            session.validate()?;
            if !names.insert(session.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "Duplicate session name: {}",
                    session.name
                )));
            }
        }
        Ok(())
    }

    /// Render as TOML, e.g. to write a starter configuration file.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Look up a session by name.
    pub fn session(&self, name: &str) -> Option<&SessionConfig> {
        self.sessions.iter().find(|s| s.name == name)
    }
}
