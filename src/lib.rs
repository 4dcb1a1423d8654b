//! Multi-client line chat server library
//!
//! Clients connect over TCP (or WebSocket), send newline-terminated text and
//! receive every other client's lines in near real time.
//!
//! # Architecture
//! - Each connection is a `Session` whose receive loop pushes lines onto a
//!   shared `AdmissionQueue`
//! - A single consumer task pops messages in arrival order and asks the
//!   `Room` to broadcast them to every member except the sender
//! - The `Room` keeps weak references only, so a departed session is freed
//!   as soon as its receive loop ends
//!
//! # Example
//! ```no_run
//! use line_chat::{ChatServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), line_chat::AppError> {
//!     let mut server = ChatServer::new(ServerConfig::default());
//!     server
//!         .run_until(12345, async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await
//! }
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod queue;
pub mod room;
pub mod server;
pub mod session;
pub mod transport;
pub mod types;
pub mod websocket;

// Re-export main types for convenience
pub use config::{Protocol, ServerConfig};
pub use error::{AppError, SendError, TransportError};
pub use message::{LineDecoder, Message};
pub use queue::AdmissionQueue;
pub use room::Room;
pub use server::{ChatServer, ServerState};
pub use session::{Session, SessionOptions};
pub use transport::{memory_pair, MemoryTransport, StreamTransport, TcpTransport, Transport};
pub use types::SessionId;
pub use websocket::WebSocketTransport;
