// src/logging.rs

//! Global logger setup on top of `fern`.
//!
//! Every line is `[rfc3339][LEVEL][component][pid=..][tid=..] message`, written
//! to stdout and, when enabled, appended to a file next to the executable.

use crate::config::LoggingConfig;
use chrono::Local;
use fern::Dispatch;
use log::LevelFilter;
use std::{fmt, path::Path, process, thread};

/// Default file name when logging to file is enabled without one.
pub const DEFAULT_LOG_FILE: &str = "tdt-agent.log";

/// Map a config level string to a filter; anything unknown is INFO.
pub fn level_filter(level: &str) -> LevelFilter {
    match level.to_uppercase().as_str() {
        "OFF" => LevelFilter::Off,
        "ERROR" => LevelFilter::Error,
        "WARN" => LevelFilter::Warn,
        "DEBUG" => LevelFilter::Debug,
        "TRACE" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// Component shown in the third field: `tdt_log!` components as given,
/// this crate's module targets without the crate prefix.
pub fn component(target: &str) -> &str {
    match target {
        "tdt_agent" => "main",
        t => t.strip_prefix("tdt_agent::").unwrap_or(t),
    }
}

fn format_line(out: fern::FormatCallback, msg: &fmt::Arguments, record: &log::Record) {
    out.finish(format_args!(
        "[{}][{:5}][{}][pid={}][tid={:?}] {}",
        Local::now().to_rfc3339(),
        record.level(),
        component(record.target()),
        process::id(),
        thread::current().id(),
        msg
    ))
}

/// Install the global logger. Fails if one is already installed or the log
/// file can't be opened.
pub fn setup(base_dir: &Path, cfg: &LoggingConfig) -> Result<(), fern::InitError> {
    let mut dispatch = Dispatch::new()
        .format(format_line)
        .level(level_filter(&cfg.level))
        .chain(std::io::stdout());

    if cfg.enable {
        let path = base_dir.join(cfg.file.as_deref().unwrap_or(DEFAULT_LOG_FILE));
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_case_insensitive_with_info_fallback() {
        assert_eq!(level_filter("debug"), LevelFilter::Debug);
        assert_eq!(level_filter("Warn"), LevelFilter::Warn);
        assert_eq!(level_filter("verbose"), LevelFilter::Info);
        assert_eq!(level_filter(""), LevelFilter::Info);
    }

    #[test]
    fn components_drop_the_crate_prefix() {
        assert_eq!(component("registry"), "registry");
        assert_eq!(component("tdt_agent::config::loader"), "config::loader");
        assert_eq!(component("tdt_agent"), "main");
        assert_eq!(component("tokio::runtime"), "tokio::runtime");
    }
}
