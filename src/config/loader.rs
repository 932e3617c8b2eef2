// src/config/loader.rs

//! # Configuration Loader
//!
//! Reads `default.toml`, deserializes it into `RawConfig`, and converts
//! the raw tables into the runtime `Config`.

use crate::config::model::{AgentConfig, AgentStub, Config, ConfigError, EngineConfig, EngineStub, RawConfig};
use crate::engine::simulated::DEFAULT_STOP_TIMEOUT;
use crate::notify::Context;
use crate::tdt_log;
use log::Level;
use std::{fs, path::Path};

/// Load and validate the configuration at `path`.
/// Logs at DEBUG before reading and INFO on success.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    tdt_log!(Level::Debug, "config", "Reading config from {:?}", path);
    let txt = fs::read_to_string(path)?;
    let cfg = parse(&txt)?;
    tdt_log!(Level::Info, "config", "Loaded config from {:?}", path);
    Ok(cfg)
}

/// Parse configuration text. Missing tables fall back to defaults.
pub fn parse(txt: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(txt)?;
    Ok(Config {
        logging: raw.logging,
        agent:   convert_agent(raw.agent)?,
        engine:  convert_engine(raw.engine)?,
    })
}

fn convert_agent(stub: AgentStub) -> Result<AgentConfig, ConfigError> {
    let context = match stub.context {
        Some(raw) => Some(Context::new(raw).ok_or(ConfigError::ZeroContext)?),
        None => None,
    };
    Ok(AgentConfig {
        format: stub.format,
        context,
        configuration: stub.configuration.filter(|c| !c.trim().is_empty()),
        profile: stub.profile.filter(|p| !p.is_empty()),
    })
}

fn convert_engine(stub: EngineStub) -> Result<EngineConfig, ConfigError> {
    let stop_timeout = match stub.stop_timeout {
        Some(s) => humantime::parse_duration(&s).map_err(|e| ConfigError::InvalidDuration(s, e))?,
        None => DEFAULT_STOP_TIMEOUT,
    };
    tdt_log!(
        Level::Debug,
        "config",
        "Engine {:?}: {} profiles, stop_timeout={:?}",
        stub.backend,
        stub.profiles.len(),
        stop_timeout
    );
    Ok(EngineConfig {
        backend: stub.backend,
        stop_timeout,
        profiles: stub.profiles,
    })
}
