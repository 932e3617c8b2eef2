// src/config/model.rs

use crate::codes::ProtocolFormat;
use crate::engine::ProfileSpec;
use crate::notify::Context;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Top-level runtime config
#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub agent:   AgentConfig,
    pub engine:  EngineConfig,
}

/// Mirror of the `[logging]` table
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]            pub enable: bool,
    #[serde(default)]            pub file:   Option<String>,
    #[serde(default = "default_level")] pub level: String,
}
fn default_level() -> String { "INFO".into() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { enable: false, file: None, level: default_level() }
    }
}

/// Raw `[agent]` table
#[derive(Debug, Default, Deserialize)]
pub struct AgentStub {
    #[serde(default)] pub format:        ProtocolFormat,
    #[serde(default)] pub context:       Option<u64>,
    #[serde(default)] pub configuration: Option<String>,
    #[serde(default)] pub profile:       Option<String>,
}

/// Raw `[engine]` table
#[derive(Debug, Default, Deserialize)]
pub struct EngineStub {
    #[serde(default)] pub backend:      BackendKind,
    #[serde(default)] pub stop_timeout: Option<String>,
    #[serde(default)] pub profiles:     Vec<ProfileSpec>,
}

/// Whole file as it appears on disk
#[derive(Debug, Default, Deserialize)]
pub struct RawConfig {
    #[serde(default)] pub logging: LoggingConfig,
    #[serde(default)] pub agent:   AgentStub,
    #[serde(default)] pub engine:  EngineStub,
}

/// Agent settings with the context checked
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub format:        ProtocolFormat,
    /// `None` means "issue one from the registry".
    pub context:       Option<Context>,
    /// Applied to every profile (or `profile`) before `start`.
    pub configuration: Option<String>,
    pub profile:       Option<String>,
}

/// Engine settings with the timeout parsed
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub backend:      BackendKind,
    pub stop_timeout: Duration,
    pub profiles:     Vec<ProfileSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Simulated,
    Native,
}

/// All the ways config loading can go wrong
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid duration '{0}': {1}")]
    InvalidDuration(String, #[source] humantime::DurationError),

    #[error("notification context must be nonzero")]
    ZeroContext,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}
