//! Configuration resolution for overmux.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Config file (JSON, path given by the caller)
//! 3. Environment variables
//! 4. CLI arguments (applied by the binary, highest priority)

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Complete overmux configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub smux: SmuxConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Mux transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Deadline for opening a stream on an existing session (milliseconds).
    pub open_timeout_ms: u64,
    /// Deadline for the first accept on a new inbound session (milliseconds).
    /// `None` waits as long as the multiplexer does.
    pub accept_timeout_ms: Option<u64>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            open_timeout_ms: 10_000,
            accept_timeout_ms: None,
        }
    }
}

impl TransportConfig {
    pub const fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn accept_timeout(&self) -> Option<Duration> {
        self.accept_timeout_ms.map(Duration::from_millis)
    }
}

/// Queue sizing for the smux multiplexer adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmuxConfig {
    pub max_tx_queue: usize,
    pub max_rx_queue: usize,
}

impl Default for SmuxConfig {
    fn default() -> Self {
        Self {
            max_tx_queue: 8192,
            max_rx_queue: 8192,
        }
    }
}

/// Logging configuration consumed by binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => {
            info!(path = %path.display(), "Loading config file");
            load_config_file(path)?
        }
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate(&config)?;
    debug!(
        open_timeout_ms = config.transport.open_timeout_ms,
        accept_timeout_ms = ?config.transport.accept_timeout_ms,
        log_level = %config.log.level,
        "Configuration resolved"
    );

    Ok(config)
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(n) = var("OVERMUX_OPEN_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        config.transport.open_timeout_ms = n;
    }
    if let Some(n) = var("OVERMUX_ACCEPT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        config.transport.accept_timeout_ms = Some(n);
    }
    if let Some(val) = var("OVERMUX_LOG_LEVEL") {
        config.log.level = val;
    }
    if let Some(val) = var("OVERMUX_LOG_JSON").and_then(|v| v.parse().ok()) {
        config.log.json = val;
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.transport.open_timeout_ms == 0 {
        return Err(Error::Config("transport.open_timeout_ms must be > 0".into()));
    }
    if config.smux.max_tx_queue == 0 || config.smux.max_rx_queue == 0 {
        return Err(Error::Config("smux queue sizes must be > 0".into()));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn default_config_has_10s_open_timeout() {
        let config = Config::default();
        assert_eq!(config.transport.open_timeout(), Duration::from_secs(10));
        assert!(config.transport.accept_timeout().is_none());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"transport": {{"accept_timeout_ms": 250}}}}"#).unwrap();

        let config = load_config_file(file.path()).unwrap();
        assert_eq!(config.transport.open_timeout_ms, 10_000);
        assert_eq!(
            config.transport.accept_timeout(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(config.smux.max_rx_queue, 8192);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn unparseable_file_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let err = load_config_file(file.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let env: HashMap<&str, &str> = [
            ("OVERMUX_OPEN_TIMEOUT_MS", "500"),
            ("OVERMUX_ACCEPT_TIMEOUT_MS", "soon"),
            ("OVERMUX_LOG_LEVEL", "debug"),
            ("OVERMUX_LOG_JSON", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_env_overrides(&mut config, |key| env.get(key).map(ToString::to_string));

        assert_eq!(config.transport.open_timeout_ms, 500);
        assert!(config.transport.accept_timeout_ms.is_none());
        assert_eq!(config.log.level, "debug");
        assert!(config.log.json);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut config = Config::default();
        config.transport.open_timeout_ms = 0;
        assert!(matches!(validate(&config), Err(Error::Config(_))));
    }
}
