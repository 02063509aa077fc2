//! Client configuration

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Store ensemble address, e.g. `zk1:2181,zk2:2181/chroot`
    #[serde(default = "default_connect_string")]
    pub connect_string: String,

    /// Session timeout requested from the store
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,

    /// How long `start` waits for the first session
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Create missing parents when `create` is called without an explicit flag
    #[serde(default = "default_true")]
    pub auto_create_parents: bool,

    /// Name of the event executor
    #[serde(default = "default_event_thread_name")]
    pub event_thread_name: String,
}

impl ClientConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_string: default_connect_string(),
            session_timeout_ms: default_session_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            auto_create_parents: true,
            event_thread_name: default_event_thread_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

// Defaults
fn default_connect_string() -> String { "localhost:2181".to_string() }
fn default_session_timeout() -> u64 { 10_000 }
fn default_connect_timeout() -> u64 { 30_000 }
fn default_true() -> bool { true }
fn default_event_thread_name() -> String { "coord-event".to_string() }
fn default_log_filter() -> String { "elohim_coord=info".to_string() }

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Failed to load {}", path.display()))
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            info!(path = %path.display(), "Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.client.session_timeout_ms == 0 {
            bail!("client.session_timeout_ms must be greater than zero");
        }
        if self.client.connect_string.trim().is_empty() {
            bail!("client.connect_string must not be empty");
        }
        Ok(())
    }
}
