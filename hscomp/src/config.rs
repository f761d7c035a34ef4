//! Configuration loaded from TOML files

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the logging configuration.
pub const DEFAULT_LOG_CONFIG: &str = "./config/log.init";

/// Default location of the router connection configuration.
pub const DEFAULT_ROUTER_CONFIG: &str = "./config/router.init";

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_ROUTER_PORT: u16 = 8181;
pub const DEFAULT_LOGGER_PORT: u16 = 8282;
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 500;
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Top-level process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    #[serde(deserialize_with = "router_section")]
    pub router: RemoteServiceConfig,
    #[serde(deserialize_with = "logger_section")]
    pub logger: RemoteServiceConfig,
    /// File holding persisted properties of the config manager.
    pub persistence: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            router: RemoteServiceConfig::router(),
            logger: RemoteServiceConfig::logger(),
            persistence: None,
        }
    }
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: AppConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path`, or returns the defaults when the file does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.router.validate("router")?;
        self.logger.validate("logger")?;
        Ok(())
    }

    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    pub fn with_router(mut self, router: RemoteServiceConfig) -> Self {
        self.router = router;
        self
    }

    pub fn with_logger(mut self, logger: RemoteServiceConfig) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_persistence(mut self, path: impl Into<PathBuf>) -> Self {
        self.persistence = Some(path.into());
        self
    }
}

/// Logging options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    /// `EnvFilter` directive, e.g. `info` or `hscomp=debug`
    pub level: String,
    pub file_info: bool,
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
            file_info: false,
            thread_names: true,
        }
    }
}

impl LoggingConfig {
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }
}

/// Connection settings of a router or log collector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteServiceConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub retry_interval_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Maximum simultaneous peers a server accepts; 0 means unlimited.
    pub max_connections: usize,
    pub max_frame_len: usize,
}

impl Default for RemoteServiceConfig {
    fn default() -> Self {
        Self::router()
    }
}

impl RemoteServiceConfig {
    pub fn router() -> Self {
        Self {
            enabled: false,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_ROUTER_PORT,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            handshake_timeout_ms: 5000,
            max_connections: 0,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn logger() -> Self {
        Self {
            port: DEFAULT_LOGGER_PORT,
            ..Self::router()
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    fn validate(&self, section: &str) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::configuration(
                "host must not be empty",
                Some(format!("{section}.host")),
            ));
        }
        if self.retry_interval_ms == 0 {
            return Err(Error::configuration(
                "retry interval must be positive",
                Some(format!("{section}.retry_interval_ms")),
            ));
        }
        if self.max_frame_len < 64 {
            return Err(Error::configuration(
                "frame limit too small",
                Some(format!("{section}.max_frame_len")),
            ));
        }
        Ok(())
    }
}

/// Section as written in a file; missing keys fall back to the defaults of
/// the section it appears in.
#[derive(Deserialize)]
struct RemoteServiceSection {
    enabled: Option<bool>,
    host: Option<String>,
    port: Option<u16>,
    retry_interval_ms: Option<u64>,
    handshake_timeout_ms: Option<u64>,
    max_connections: Option<usize>,
    max_frame_len: Option<usize>,
}

impl RemoteServiceSection {
    fn over(self, base: RemoteServiceConfig) -> RemoteServiceConfig {
        RemoteServiceConfig {
            enabled: self.enabled.unwrap_or(base.enabled),
            host: self.host.unwrap_or(base.host),
            port: self.port.unwrap_or(base.port),
            retry_interval_ms: self.retry_interval_ms.unwrap_or(base.retry_interval_ms),
            handshake_timeout_ms: self.handshake_timeout_ms.unwrap_or(base.handshake_timeout_ms),
            max_connections: self.max_connections.unwrap_or(base.max_connections),
            max_frame_len: self.max_frame_len.unwrap_or(base.max_frame_len),
        }
    }
}

fn router_section<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<RemoteServiceConfig, D::Error> {
    Ok(RemoteServiceSection::deserialize(deserializer)?.over(RemoteServiceConfig::router()))
}

fn logger_section<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<RemoteServiceConfig, D::Error> {
    Ok(RemoteServiceSection::deserialize(deserializer)?.over(RemoteServiceConfig::logger()))
}
