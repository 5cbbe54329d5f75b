use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{WsError, WsResult};
use crate::transport::timeout_from_millis;
use crate::ws::connection::ConnectionOptions;

/// Server settings, usually read from a `ripple.toml` file.
///
/// Every field has a default, so an empty file is a valid configuration.
/// Millisecond timeouts of `0` mean "no timeout".
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: String,
    pub handshake_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub close_timeout_ms: u64,
    pub max_frame_size: u64,
    pub max_message_size: usize,
    pub strict_utf8: bool,
    pub heartbeat: Option<HeartbeatConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "0.0.0.0:8080".to_string(),
            handshake_timeout_ms: 5_000,
            read_timeout_ms: 0,
            close_timeout_ms: 5_000,
            max_frame_size: 64 * 1024 * 1024,
            max_message_size: 16 * 1024 * 1024,
            strict_utf8: false,
            heartbeat: None,
        }
    }
}

/// Periodic ping settings from the `[heartbeat]` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub pong_timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            interval_ms: 30_000,
            pong_timeout_ms: 10_000,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }
}

impl ServerConfig {
    /// Read and parse a TOML config file.
    pub fn load(path: &Path) -> WsResult<ServerConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| WsError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML config document.
    pub fn from_toml_str(content: &str) -> WsResult<ServerConfig> {
        let config: ServerConfig = toml::from_str(content)
            .map_err(|e| WsError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> WsResult<()> {
        self.bind_addr()?;
        if self.max_frame_size == 0 || self.max_message_size == 0 {
            return Err(WsError::Config("size limits must be greater than zero".to_string()));
        }
        if let Some(hb) = &self.heartbeat {
            if hb.interval_ms == 0 {
                return Err(WsError::Config(
                    "heartbeat.interval_ms must be greater than zero".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> WsResult<SocketAddr> {
        self.bind
            .parse()
            .map_err(|_| WsError::Config(format!("invalid bind address: {:?}", self.bind)))
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        timeout_from_millis(self.handshake_timeout_ms)
    }

    /// Limits and timeouts handed to every accepted connection.
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            max_frame_size: self.max_frame_size,
            max_message_size: self.max_message_size,
            strict_utf8: self.strict_utf8,
            read_timeout: timeout_from_millis(self.read_timeout_ms),
            close_timeout: timeout_from_millis(self.close_timeout_ms),
        }
    }
}
