//! Server configuration
//!
//! Loaded from an optional JSON file; any field left out takes its default.
//! The binary layers command line flags on top.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;
use crate::message::DEFAULT_MAX_LINE_BYTES;
use crate::session::SessionOptions;

/// Default listening port
pub const DEFAULT_PORT: u16 = 12345;

/// Wire protocol spoken on the listening socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Raw newline-delimited text over TCP
    #[default]
    Tcp,
    /// One line per WebSocket frame
    Websocket,
}

/// Server settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Interface to bind
    pub host: String,
    /// Port to bind
    pub port: u16,
    /// Transport protocol for accepted connections
    pub protocol: Protocol,
    /// Bytes requested per transport read
    pub read_buffer_bytes: usize,
    /// Longest accepted line
    pub max_line_bytes: usize,
    /// Per-recipient write limit during broadcast; 0 disables it
    pub delivery_timeout_ms: u64,
    /// Pause after a failed accept
    pub accept_backoff_ms: u64,
    /// How long `stop` waits for a session to close, and then for the
    /// session tasks, before aborting them
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            protocol: Protocol::Tcp,
            read_buffer_bytes: 4096,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            delivery_timeout_ms: 5000,
            accept_backoff_ms: 100,
            shutdown_grace_ms: 1000,
        }
    }
}

impl ServerConfig {
    /// Parse a JSON configuration document
    pub fn from_json_str(json: &str) -> Result<Self, AppError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<(), AppError> {
        if self.host.trim().is_empty() {
            return Err(AppError::Config("host must not be empty".to_string()));
        }
        if self.read_buffer_bytes == 0 {
            return Err(AppError::Config(
                "read_buffer_bytes must be greater than zero".to_string(),
            ));
        }
        if self.max_line_bytes == 0 {
            return Err(AppError::Config(
                "max_line_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Session settings derived from this configuration
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            read_buffer_bytes: self.read_buffer_bytes,
            max_line_bytes: self.max_line_bytes,
            delivery_timeout: (self.delivery_timeout_ms > 0)
                .then(|| Duration::from_millis(self.delivery_timeout_ms)),
        }
    }

    pub(crate) fn accept_backoff(&self) -> Duration {
        Duration::from_millis(self.accept_backoff_ms)
    }

    pub(crate) fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
