//! Tracing subscriber setup with a reloadable level filter

use crate::config::LoggingConfig;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

/// Level used by the `--verbose` command.
pub const VERBOSE_LEVEL: &str = "debug";

/// Level used by the `--silent` command.
pub const SILENT_LEVEL: &str = "off";

/// Changes the active filter of an installed subscriber.
pub struct LoggingHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    level: Mutex<String>,
}

impl LoggingHandle {
    pub fn level(&self) -> String {
        self.level.lock().clone()
    }

    /// Replaces the filter with a new `EnvFilter` directive.
    pub fn set_level(&self, level: &str) -> Result<()> {
        let filter = parse_filter(level)?;
        self.filter
            .reload(filter)
            .map_err(|err| Error::runtime("Failed to reload log filter", err))?;
        *self.level.lock() = level.to_string();
        tracing::info!(level, "Log level changed");
        Ok(())
    }

    pub fn verbose(&self) -> Result<()> {
        self.set_level(VERBOSE_LEVEL)
    }

    pub fn silent(&self) -> Result<()> {
        self.set_level(SILENT_LEVEL)
    }
}

fn parse_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(level).map_err(|err| {
        Error::configuration(
            format!("Invalid log filter '{level}': {err}"),
            Some("logging.level".to_string()),
        )
    })
}

/// Installs the global subscriber.
///
/// `RUST_LOG` wins over the configured level when set. Fails if a global
/// subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<LoggingHandle> {
    let level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.level.clone());
    let (filter, handle) = reload::Layer::new(parse_filter(&level)?);
    let output = fmt::layer()
        .with_target(true)
        .with_thread_names(config.thread_names)
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .try_init()
        .map_err(|err| Error::runtime("Failed to install tracing subscriber", err))?;

    Ok(LoggingHandle {
        filter: handle,
        level: Mutex::new(level),
    })
}
