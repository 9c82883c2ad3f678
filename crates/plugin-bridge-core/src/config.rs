//! Bridge configuration.
//!
//! Every field has a default, so an empty TOML document (or no file at all)
//! yields a working configuration. Environment variables override the file.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

use crate::truncate::TruncationLimits;

/// Default number of buffered console entries.
pub const DEFAULT_BUFFER_SIZE: usize = 1000;

const ENV_DEBUG_HOST: &str = "PLUGIN_BRIDGE_DEBUG_HOST";
const ENV_DEBUG_PORT: &str = "PLUGIN_BRIDGE_DEBUG_PORT";
const ENV_RELAY_BIND: &str = "PLUGIN_BRIDGE_RELAY_BIND";
const ENV_BUFFER_SIZE: &str = "PLUGIN_BRIDGE_BUFFER_SIZE";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub console: ConsoleConfig,
    pub debug: DebugConfig,
    pub timeouts: TimeoutConfig,
    pub relay: RelayConfig,
}

/// Console capture settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub buffer_size: usize,
    pub truncation: TruncationLimits,
    /// Script/frame URL fragments identifying the plugin sandbox.
    pub plugin_markers: Vec<String>,
    /// Script/frame URL fragments identifying the host application.
    pub host_markers: Vec<String>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            truncation: TruncationLimits::default(),
            plugin_markers: vec!["plugin".to_string()],
            host_markers: vec!["figma.com".to_string()],
        }
    }
}

/// Remote-debugging transport settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub host: String,
    pub port: u16,
    /// URL fragments identifying a page with a concrete open document.
    pub document_markers: Vec<String>,
    /// Worker-count difference required before switching pages.
    pub hysteresis_margin: usize,
    /// How long to wait for workers to attach when probing a page.
    pub worker_settle_ms: u64,
    pub reevaluate_interval_ms: u64,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9222,
            document_markers: ["/file/", "/design/", "/board/", "/proto/"]
                .into_iter()
                .map(String::from)
                .collect(),
            hysteresis_margin: 1,
            worker_settle_ms: 300,
            reevaluate_interval_ms: 5000,
        }
    }
}

impl DebugConfig {
    /// Base URL of the loopback HTTP listing endpoint.
    #[must_use]
    pub fn http_base(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    #[must_use]
    pub const fn worker_settle(&self) -> Duration {
        Duration::from_millis(self.worker_settle_ms)
    }

    #[must_use]
    pub const fn reevaluate_interval(&self) -> Duration {
        Duration::from_millis(self.reevaluate_interval_ms)
    }
}

/// Upper bounds for every transport operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_ms: u64,
    pub navigate_ms: u64,
    pub reload_ms: u64,
    pub health_check_ms: u64,
    pub command_ms: u64,
    pub execute_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 10_000,
            navigate_ms: 15_000,
            reload_ms: 15_000,
            health_check_ms: 2_000,
            command_ms: 15_000,
            execute_ms: 5_000,
        }
    }
}

impl TimeoutConfig {
    #[must_use]
    pub const fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    #[must_use]
    pub const fn navigate(&self) -> Duration {
        Duration::from_millis(self.navigate_ms)
    }

    #[must_use]
    pub const fn reload(&self) -> Duration {
        Duration::from_millis(self.reload_ms)
    }

    #[must_use]
    pub const fn health_check(&self) -> Duration {
        Duration::from_millis(self.health_check_ms)
    }

    #[must_use]
    pub const fn command(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }

    #[must_use]
    pub const fn execute(&self) -> Duration {
        Duration::from_millis(self.execute_ms)
    }
}

/// Message-relay transport settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind: String,
    /// How long to wait for the plugin to reattach before retrying.
    pub reconnect_grace_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9223".to_string(),
            reconnect_grace_ms: 3_000,
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub const fn reconnect_grace(&self) -> Duration {
        Duration::from_millis(self.reconnect_grace_ms)
    }
}

impl BridgeConfig {
    /// Load from an optional TOML file, then apply environment overrides.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed, or an override is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_with(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse a TOML file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply overrides from a variable lookup.
    ///
    /// # Errors
    /// Returns error if a numeric override does not parse.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(ENV_DEBUG_HOST) {
            self.debug.host = host;
        }
        if let Some(port) = lookup(ENV_DEBUG_PORT) {
            self.debug.port = port.parse().map_err(|_| ConfigError::InvalidEnv {
                var: ENV_DEBUG_PORT,
                value: port,
            })?;
        }
        if let Some(bind) = lookup(ENV_RELAY_BIND) {
            self.relay.bind = bind;
        }
        if let Some(size) = lookup(ENV_BUFFER_SIZE) {
            self.console.buffer_size = size.parse().map_err(|_| ConfigError::InvalidEnv {
                var: ENV_BUFFER_SIZE,
                value: size,
            })?;
        }
        Ok(())
    }
}
