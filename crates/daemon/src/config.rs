//! Configuration management for the Podterm daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/podterm/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::SessionOptions;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("max_viewers must be between 1 and 1000, got {0}")]
    InvalidMaxViewers(usize),

    #[error("viewer_queue_capacity must be greater than 0, got {0}")]
    InvalidQueueCapacity(usize),

    #[error("headless_grace_secs must be between 0 and 86400 seconds, got {0}")]
    InvalidHeadlessGrace(u64),

    #[error("listen_addr must be a socket address like 127.0.0.1:8080, got {0}")]
    InvalidListenAddr(String),

    #[error("docker_binary not found: {0}")]
    InvalidDockerBinary(String),

    #[error("command must not be empty")]
    EmptyCommand,

    #[error("terminal size must be non-zero, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u16, rows: u16 },

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Podterm daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Viewer endpoint configuration.
    pub server: ServerConfig,

    /// Container build and run configuration.
    pub container: ContainerConfig,

    /// Session management configuration.
    pub session: SessionConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for storing daemon data (run journal, ...).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Viewer endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket endpoint listens on.
    pub listen_addr: String,
}

/// Container build and run configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContainerConfig {
    /// Docker-compatible CLI used to build and run containers.
    pub docker_binary: String,

    /// Scratch directory for downloaded sources.
    pub work_dir: PathBuf,

    /// Command run inside each container.
    pub command: Vec<String>,

    /// Terminal width in columns.
    pub cols: u16,

    /// Terminal height in rows.
    pub rows: u16,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Maximum number of viewers per session.
    pub max_viewers: usize,

    /// Output chunks buffered per viewer before it is dropped as too slow.
    pub viewer_queue_capacity: usize,

    /// Seconds a session keeps running after its last viewer leaves
    /// (0 = stop immediately).
    pub headless_grace_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            work_dir: std::env::temp_dir().join("podterm"),
            command: vec!["/bin/bash".to_string()],
            cols: 80,
            rows: 24,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 32,
            max_viewers: 16,
            viewer_queue_capacity: 256,
            headless_grace_secs: 300, // 5 minutes
        }
    }
}

impl SessionConfig {
    /// Options applied to every session adapter.
    pub fn options(&self) -> SessionOptions {
        SessionOptions {
            max_viewers: self.max_viewers,
            queue_capacity: self.viewer_queue_capacity,
            headless_grace: Duration::from_secs(self.headless_grace_secs),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("podterm")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("podterm")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PODTERM_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - PODTERM_LISTEN_ADDR: Override the viewer endpoint address
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("PODTERM_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(addr) = std::env::var("PODTERM_LISTEN_ADDR") {
            if !addr.is_empty() {
                tracing::info!("Overriding listen_addr from environment: {}", addr);
                self.server.listen_addr = addr;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate max_sessions: 1-1000
        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        // Validate max_viewers: 1-1000
        if self.session.max_viewers < 1 || self.session.max_viewers > 1000 {
            return Err(ConfigError::InvalidMaxViewers(self.session.max_viewers));
        }

        if self.session.viewer_queue_capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity(
                self.session.viewer_queue_capacity,
            ));
        }

        // Validate headless_grace_secs: 0-86400
        if self.session.headless_grace_secs > 86400 {
            return Err(ConfigError::InvalidHeadlessGrace(
                self.session.headless_grace_secs,
            ));
        }

        if self.server.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddr(
                self.server.listen_addr.clone(),
            ));
        }

        // Validate docker_binary exists
        let docker = Path::new(&self.container.docker_binary);
        let found = if docker.is_absolute() {
            docker.exists()
        } else {
            which::which(&self.container.docker_binary).is_ok()
        };
        if !found {
            return Err(ConfigError::InvalidDockerBinary(
                self.container.docker_binary.clone(),
            ));
        }

        if self.container.command.is_empty() {
            return Err(ConfigError::EmptyCommand);
        }

        if self.container.cols == 0 || self.container.rows == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                cols: self.container.cols,
                rows: self.container.rows,
            });
        }

        // Validate log_level is a known value
        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    /// Parsed listen address. Call after [`Config::validate`].
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server
            .listen_addr
            .parse()
            .with_context(|| format!("Invalid listen_addr: {}", self.server.listen_addr))
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    /// A default config whose docker binary is guaranteed to exist.
    fn valid_config() -> Config {
        let mut config = Config::default();
        config.container.docker_binary = "/bin/sh".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.server.listen_addr, "127.0.0.1:8080");
        assert_eq!(config.container.docker_binary, "docker");
        assert_eq!(config.container.command, vec!["/bin/bash"]);
        assert_eq!((config.container.cols, config.container.rows), (80, 24));
        assert_eq!(config.session.max_sessions, 32);
        assert_eq!(config.session.max_viewers, 16);
        assert_eq!(config.session.viewer_queue_capacity, 256);
        assert_eq!(config.session.headless_grace_secs, 300);
    }

    #[test]
    fn test_default_daemon_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.log_level, "info");
        assert!(config.data_dir.to_string_lossy().contains("podterm"));
    }

    #[test]
    fn test_session_options() {
        let mut config = SessionConfig::default();
        config.max_viewers = 4;
        config.viewer_queue_capacity = 8;
        config.headless_grace_secs = 0;

        let options = config.options();
        assert_eq!(options.max_viewers, 4);
        assert_eq!(options.queue_capacity, 8);
        assert!(options.headless_grace.is_zero());
    }

    #[test]
    fn test_from_toml_empty() {
        // Empty TOML should use all defaults
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[daemon]
log_level = "debug"

[session]
max_sessions = 5
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.session.max_sessions, 5);
        // Other values should be defaults
        assert_eq!(config.session.headless_grace_secs, 300);
        assert_eq!(config.server.listen_addr, "127.0.0.1:8080");
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
data_dir = "/custom/data"
log_level = "trace"

[server]
listen_addr = "0.0.0.0:9000"

[container]
docker_binary = "podman"
work_dir = "/var/tmp/podterm"
command = ["/bin/zsh", "-l"]
cols = 120
rows = 40

[session]
max_sessions = 20
max_viewers = 3
viewer_queue_capacity = 64
headless_grace_secs = 0
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.daemon.log_level, "trace");
        assert_eq!(config.server.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.container.docker_binary, "podman");
        assert_eq!(config.container.work_dir, PathBuf::from("/var/tmp/podterm"));
        assert_eq!(config.container.command, vec!["/bin/zsh", "-l"]);
        assert_eq!((config.container.cols, config.container.rows), (120, 40));
        assert_eq!(config.session.max_sessions, 20);
        assert_eq!(config.session.max_viewers, 3);
        assert_eq!(config.session.viewer_queue_capacity, 64);
        assert_eq!(config.session.headless_grace_secs, 0);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[daemon
log_level = "debug"
"#;
        let result = Config::from_toml(toml);
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[session]
max_sessions = "not a number"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let toml = r#"
[daemon]
log_level = "warn"
retired_option = true

[plugins]
enabled = ["recorder"]
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.daemon.log_level, "warn");
    }

    #[test]
    fn test_to_toml() {
        let toml = Config::default().to_toml().unwrap();

        assert!(toml.contains("[daemon]"));
        assert!(toml.contains("[server]"));
        assert!(toml.contains("[container]"));
        assert!(toml.contains("[session]"));
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.daemon.log_level = "warn".to_string();
        original.container.command = vec!["/bin/sh".to_string()];
        original.session.headless_grace_secs = 30;

        let loaded = Config::from_toml(&original.to_toml().unwrap()).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.session.max_sessions = 15;
        original.save(&config_path).unwrap();

        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("podterm"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::remove_var("PODTERM_LISTEN_ADDR");
        std::env::set_var("PODTERM_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.daemon.log_level, "debug");

        std::env::remove_var("PODTERM_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_listen_addr() {
        std::env::remove_var("PODTERM_LOG_LEVEL");
        std::env::set_var("PODTERM_LISTEN_ADDR", "0.0.0.0:7000");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.server.listen_addr, "0.0.0.0:7000");

        std::env::remove_var("PODTERM_LISTEN_ADDR");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("PODTERM_LOG_LEVEL", "");
        std::env::set_var("PODTERM_LISTEN_ADDR", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());

        std::env::remove_var("PODTERM_LOG_LEVEL");
        std::env::remove_var("PODTERM_LISTEN_ADDR");
    }

    #[test]
    #[serial]
    fn test_env_override_unset_does_not_override() {
        std::env::remove_var("PODTERM_LOG_LEVEL");
        std::env::remove_var("PODTERM_LISTEN_ADDR");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_max_sessions_bounds() {
        let mut config = valid_config();
        config.session.max_sessions = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(0)));

        config.session.max_sessions = 1001;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(1001)));

        config.session.max_sessions = 1000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_max_viewers_bounds() {
        let mut config = valid_config();
        config.session.max_viewers = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxViewers(0)));

        config.session.max_viewers = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_queue_capacity_zero() {
        let mut config = valid_config();
        config.session.viewer_queue_capacity = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidQueueCapacity(0)));
    }

    #[test]
    fn test_validate_headless_grace_bounds() {
        let mut config = valid_config();
        config.session.headless_grace_secs = 0;
        assert!(config.validate().is_ok());

        config.session.headless_grace_secs = 86400;
        assert!(config.validate().is_ok());

        config.session.headless_grace_secs = 86401;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidHeadlessGrace(86401))
        );
    }

    #[test]
    fn test_validate_listen_addr() {
        let mut config = valid_config();
        config.server.listen_addr = "localhost".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidListenAddr(_))
        ));

        config.server.listen_addr = "[::1]:8080".to_string();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_addr().unwrap().port(), 8080);
    }

    #[test]
    fn test_validate_docker_binary() {
        let mut config = valid_config();
        config.container.docker_binary = "/nonexistent/docker".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDockerBinary(_))
        ));

        config.container.docker_binary = "definitely-not-a-real-binary-12345".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDockerBinary(_))
        ));

        config.container.docker_binary = "sh".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_command() {
        let mut config = valid_config();
        config.container.command.clear();
        assert_eq!(config.validate(), Err(ConfigError::EmptyCommand));
    }

    #[test]
    fn test_validate_terminal_size() {
        let mut config = valid_config();
        config.container.rows = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTerminalSize { cols: 80, rows: 0 })
        );
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = valid_config();
        for level in ["trace", "debug", "info", "warn", "error", "INFO"] {
            config.daemon.log_level = level.to_string();
            assert!(config.validate().is_ok(), "{} should be valid", level);
        }

        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }
}
