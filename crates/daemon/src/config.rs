//! Configuration management for the ptyrelay daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/ptyrelay/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::Framing;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default WebSocket listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8001";

/// Default terminal type exported to spawned shells.
pub const DEFAULT_TERM_NAME: &str = "xterm-color";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("listen_addr must be a socket address like 127.0.0.1:8001, got {0}")]
    InvalidListenAddr(String),

    #[error("public_url must start with ws:// or wss://, got {0}")]
    InvalidPublicUrl(String),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("term_name must not be empty")]
    EmptyTermName,

    #[error("login_shell is enabled but ssh_host is empty")]
    MissingSshHost,

    #[error("heartbeat_timeout_secs must be greater than 0 when heartbeats are enabled")]
    InvalidHeartbeatTimeout,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the ptyrelay daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Listener configuration.
    pub server: ServerConfig,

    /// Shell invocation configuration.
    pub shell: ShellConfig,

    /// Session lifecycle configuration.
    pub session: SessionConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Optional log directory; when set, logs roll daily into it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket transport listens on.
    pub listen_addr: String,

    /// Unix socket the control endpoint listens on.
    pub control_socket: PathBuf,

    /// WebSocket URI handed to clients in `Created` responses.
    pub public_url: String,

    /// Framing used on every transport after the handshake.
    pub framing: Framing,
}

/// Shell invocation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShellConfig {
    /// Interactive shell spawned for local sessions.
    pub default_shell: String,

    /// Value of `TERM` in the spawned process.
    pub term_name: String,

    /// Spawn an outbound SSH session instead of a local shell.
    pub login_shell: bool,

    /// SSH target host used in login-shell mode.
    pub ssh_host: String,

    /// Extra arguments passed to `ssh` before the destination.
    pub ssh_args: Vec<String>,
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of pending plus live sessions.
    pub max_sessions: usize,

    /// Seconds an unbound token stays valid (0 = never expires).
    pub pending_ttl_secs: u64,

    /// Seconds a new transport has to present its token (0 = unlimited).
    pub bind_timeout_secs: u64,

    /// Seconds between keep-alive pings (0 = disabled).
    pub heartbeat_interval_secs: u64,

    /// Extra seconds of silence tolerated after a missed ping.
    pub heartbeat_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            control_socket: default_control_socket(),
            public_url: format!("ws://{}", DEFAULT_LISTEN_ADDR),
            framing: Framing::Raw,
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            term_name: DEFAULT_TERM_NAME.to_string(),
            login_shell: false,
            ssh_host: "localhost".to_string(),
            ssh_args: Vec::new(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 32,
            pending_ttl_secs: 60,
            bind_timeout_secs: 30,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 10,
        }
    }
}

impl SessionConfig {
    /// Lifetime of an unbound token, `None` when tokens never expire.
    pub fn pending_ttl(&self) -> Option<Duration> {
        (self.pending_ttl_secs > 0).then(|| Duration::from_secs(self.pending_ttl_secs))
    }

    /// Time a transport has to present its token, `None` when unlimited.
    pub fn bind_timeout(&self) -> Option<Duration> {
        (self.bind_timeout_secs > 0).then(|| Duration::from_secs(self.bind_timeout_secs))
    }

    /// Keep-alive interval, `None` when heartbeats are disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0)
            .then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }

    /// Silence tolerated after the last ping before a connection is half-open.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ptyrelay")
        .join("config.toml")
}

/// Returns the default control socket path.
///
/// Prefers `$XDG_RUNTIME_DIR/ptyrelay/control.sock`, falling back to
/// `/tmp/ptyrelay-$UID/control.sock`.
#[cfg(unix)]
pub fn default_control_socket() -> PathBuf {
    use std::os::unix::fs::MetadataExt;

    if let Some(runtime_dir) = dirs::runtime_dir() {
        runtime_dir.join("ptyrelay").join("control.sock")
    } else {
        let uid = std::fs::metadata("/proc/self")
            .map(|m| m.uid())
            .unwrap_or(0);

        PathBuf::from(format!("/tmp/ptyrelay-{}", uid)).join("control.sock")
    }
}

#[cfg(not(unix))]
pub fn default_control_socket() -> PathBuf {
    PathBuf::from("ptyrelay-control.sock")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    if cfg!(windows) {
        "powershell.exe".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PTYRELAY_LISTEN_ADDR: Override the WebSocket listen address
    /// - PTYRELAY_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - PTYRELAY_SSH_HOST: Override the login-shell SSH host
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("PTYRELAY_LISTEN_ADDR") {
            if !addr.is_empty() {
                tracing::info!("Overriding listen_addr from environment: {}", addr);
                self.server.listen_addr = addr;
            }
        }

        if let Ok(level) = std::env::var("PTYRELAY_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(host) = std::env::var("PTYRELAY_SSH_HOST") {
            if !host.is_empty() {
                tracing::info!("Overriding ssh_host from environment: {}", host);
                self.shell.ssh_host = host;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.server.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddr(
                self.server.listen_addr.clone(),
            ));
        }

        let url = &self.server.public_url;
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(ConfigError::InvalidPublicUrl(url.clone()));
        }

        if self.shell.term_name.trim().is_empty() {
            return Err(ConfigError::EmptyTermName);
        }

        if self.shell.login_shell {
            if self.shell.ssh_host.trim().is_empty() {
                return Err(ConfigError::MissingSshHost);
            }
        } else {
            // The default shell is only spawned outside login-shell mode
            let shell_path = Path::new(&self.shell.default_shell);
            let found = if shell_path.is_absolute() {
                shell_path.exists()
            } else {
                which::which(&self.shell.default_shell).is_ok()
            };
            if !found {
                return Err(ConfigError::InvalidShellPath(
                    self.shell.default_shell.clone(),
                ));
            }
        }

        if self.session.heartbeat_interval_secs > 0 && self.session.heartbeat_timeout_secs == 0 {
            return Err(ConfigError::InvalidHeartbeatTimeout);
        }

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
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
