//! # Configuration Management
//!
//! Centralized configuration for datagram servers and clients.
//!
//! Covers the bind/peer addresses, liveness and retransmission timing, session
//! limits, encryption and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Environment variables prefixed with `DATAGRAM_PROTOCOL_`
//! - Direct instantiation with defaults
//!
//! Durations are written in TOML as integer milliseconds.

use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Largest UDP payload over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Whether to encrypt messages once a peer key is known
pub const ENABLE_ENCRYPTION: bool = true;

/// Main network configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("DATAGRAM_PROTOCOL_SERVER_ADDRESS") {
            config.client.address = addr.clone();
            config.server.address = addr;
        }

        if let Ok(addr) = std::env::var("DATAGRAM_PROTOCOL_CLIENT_BIND_ADDRESS") {
            config.client.bind_address = addr;
        }

        if let Ok(name) = std::env::var("DATAGRAM_PROTOCOL_CLIENT_NAME") {
            config.client.name = name;
        }

        if let Ok(max) = std::env::var("DATAGRAM_PROTOCOL_MAX_CONNECTIONS") {
            if let Ok(val) = max.parse::<usize>() {
                config.server.max_connections = val;
            }
        }

        if let Ok(timeout) = std::env::var("DATAGRAM_PROTOCOL_CONNECTION_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.server.connection_timeout = Duration::from_millis(val);
                config.client.connection_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(ping) = std::env::var("DATAGRAM_PROTOCOL_PING_INTERVAL_MS") {
            if let Ok(val) = ping.parse::<u64>() {
                config.client.ping_interval = Duration::from_millis(val);
            }
        }

        if let Ok(confirm) = std::env::var("DATAGRAM_PROTOCOL_CONFIRMATION_TIMEOUT_MS") {
            if let Ok(val) = confirm.parse::<u64>() {
                config.transport.confirmation_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(enc) = std::env::var("DATAGRAM_PROTOCOL_ENCRYPTION") {
            if let Ok(val) = enc.parse::<bool>() {
                config.transport.encryption_enabled = val;
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0:7777")
    pub address: String,

    /// Liveness countdown for each connected client
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Maximum number of concurrent sessions; further connects are rejected
    pub max_connections: usize,

    /// Bounded wait of each client handler's queue pop
    #[serde(with = "duration_serde")]
    pub poll_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("0.0.0.0:7777"),
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            max_connections: 1000,
            poll_interval: timeout::POLL_INTERVAL,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:7777')",
                self.address
            ));
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        } else if self.connection_timeout.as_secs() > 300 {
            errors.push("Connection timeout too long (maximum: 300s)".to_string());
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > i32::MAX as usize {
            errors.push(format!(
                "Max connections too high: {} (client ids are 32-bit)",
                self.max_connections
            ));
        }

        if self.poll_interval.is_zero() {
            errors.push("Poll interval must be greater than 0".to_string());
        } else if self.poll_interval >= self.connection_timeout {
            errors.push("Poll interval must be shorter than the connection timeout".to_string());
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Local socket address; port 0 picks an ephemeral port
    pub bind_address: String,

    /// Target server address
    pub address: String,

    /// Display name sent with Connect
    pub name: String,

    /// Liveness countdown, reset by every message from the server
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Ping cadence while connected
    #[serde(with = "duration_serde")]
    pub ping_interval: Duration,

    /// Send Connect as soon as the server's key arrives
    pub connect_on_receive_key: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bind_address: String::from("0.0.0.0:0"),
            address: String::from("127.0.0.1:7777"),
            name: String::from("player"),
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            ping_interval: timeout::PING_INTERVAL,
            connect_on_receive_key: true,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for (label, addr) in [("bind", &self.bind_address), ("server", &self.address)] {
            if addr.is_empty() {
                errors.push(format!("Client {label} address cannot be empty"));
            } else if addr.parse::<std::net::SocketAddr>().is_err() {
                errors.push(format!(
                    "Invalid client {label} address format: '{addr}' (expected format: '127.0.0.1:7777')"
                ));
            }
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        }

        if self.ping_interval.as_millis() < 10 {
            errors.push("Ping interval too short (minimum: 10ms)".to_string());
        } else if self.ping_interval >= self.connection_timeout {
            errors.push(
                "Ping interval must be shorter than the connection timeout or sessions time out"
                    .to_string(),
            );
        }

        errors
    }
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Encrypt messages when a peer key is known
    pub encryption_enabled: bool,

    /// Bounded wait of the receive loop, so it rechecks its running flag
    #[serde(with = "duration_serde")]
    pub receive_timeout: Duration,

    /// Receive buffer size; larger datagrams are truncated by the OS
    pub max_datagram_size: usize,

    /// Age after which an unconfirmed event is retransmitted
    #[serde(with = "duration_serde")]
    pub confirmation_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            encryption_enabled: ENABLE_ENCRYPTION,
            receive_timeout: timeout::POLL_INTERVAL,
            max_datagram_size: MAX_DATAGRAM_SIZE,
            confirmation_timeout: timeout::CONFIRMATION_TIMEOUT,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_datagram_size < 512 {
            errors.push("Max datagram size too small (minimum: 512 bytes)".to_string());
        } else if self.max_datagram_size > MAX_DATAGRAM_SIZE {
            errors.push(format!(
                "Max datagram size too large: {} bytes (maximum: {MAX_DATAGRAM_SIZE})",
                self.max_datagram_size
            ));
        }

        if self.receive_timeout.is_zero() {
            errors.push("Receive timeout must be greater than 0".to_string());
        } else if self.receive_timeout.as_secs() > 5 {
            errors.push("Receive timeout too long (maximum: 5s)".to_string());
        }

        if self.confirmation_timeout.as_millis() < 10 {
            errors.push("Confirmation timeout too short (minimum: 10ms)".to_string());
        }

        if !self.encryption_enabled {
            errors.push(
                "WARNING: Encryption is disabled - not recommended for production".to_string(),
            );
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    pub log_to_console: bool,

    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("datagram-protocol"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Duration as integer milliseconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
