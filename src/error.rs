//! Error types for the chat server
//!
//! Defines server-level errors, transport errors and admission queue errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

use crate::server::ServerState;

/// Server-level errors
///
/// Only these ever reach the caller of `ChatServer::start`. Everything that
/// happens inside a session is handled where it occurs.
#[derive(Debug, Error)]
pub enum AppError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Could not bind the listening socket
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid server state: {0:?}")]
    InvalidState(ServerState),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// JSON deserialization error (configuration file)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Transport errors
///
/// Reported by `Transport` implementations and by `Session::deliver`.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The transport has been closed locally
    #[error("Transport closed")]
    Closed,

    /// A write did not complete within the delivery timeout
    #[error("Delivery timed out")]
    Timeout,
}

/// Admission queue send errors
///
/// Occurs when pushing onto a queue that has been closed.
#[derive(Debug, Error)]
pub enum SendError {
    /// The consuming end of the queue has been closed
    #[error("Channel closed")]
    ChannelClosed,
}

/// Format a bind address for error reporting
pub(crate) fn bind_error(host: &str, port: u16, source: std::io::Error) -> AppError {
    AppError::Bind {
        addr: format!("{}:{}", host, port),
        source,
    }
}

