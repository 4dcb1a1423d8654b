//! Byte-stream transports
//!
//! A `Transport` is the session's only view of its client: send bytes,
//! receive bytes, close. `StreamTransport` adapts any pair of tokio IO halves,
//! which covers both real TCP connections and the in-memory duplex pipes used
//! by tests.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

use crate::error::TransportError;

/// Bidirectional byte stream with explicit close
///
/// `receive` returning `Ok(0)` means end-of-stream. `close` must be
/// idempotent and must wake a `receive` that is currently waiting, which then
/// reports end-of-stream.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write `bytes` to the peer, returning the number of bytes written
    async fn send(&self, bytes: &[u8]) -> Result<usize, TransportError>;

    /// Read up to `buf.len()` bytes from the peer
    async fn receive(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Close the transport
    async fn close(&self);

    /// Human-readable description of the remote end
    fn peer(&self) -> String;
}

/// Upper bound on the orderly part of `close` (write shutdown, close frame)
pub(crate) const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Close signal shared by the transports in this crate
///
/// Flipped once; receivers waiting on it are woken.
#[derive(Debug)]
pub(crate) struct CloseSignal(watch::Sender<bool>);

impl CloseSignal {
    pub(crate) fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self(sender)
    }

    /// Mark closed. Returns true only for the call that did the transition.
    pub(crate) fn trigger(&self) -> bool {
        !self.0.send_replace(true)
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once the signal has been triggered
    pub(crate) async fn closed(&self) {
        let mut rx = self.0.subscribe();
        // The sender lives in `self`, so this only errors if it was dropped.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

async fn write_flushed<W>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Transport over a tokio read half and write half
pub struct StreamTransport<R, W> {
    peer: String,
    reader: Mutex<R>,
    writer: Mutex<Option<W>>,
    closed: CloseSignal,
}

/// TCP connection transport
pub type TcpTransport = StreamTransport<OwnedReadHalf, OwnedWriteHalf>;

/// In-memory transport backed by `tokio::io::duplex`
pub type MemoryTransport = StreamTransport<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Wrap an already split stream
    pub fn new(reader: R, writer: W, peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            reader: Mutex::new(reader),
            writer: Mutex::new(Some(writer)),
            closed: CloseSignal::new(),
        }
    }
}

impl TcpTransport {
    /// Wrap an accepted TCP connection
    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer, peer)
    }
}

/// Create a connected in-memory pair
///
/// Returns the server-side transport and the client end of the pipe.
/// `capacity` bounds the bytes buffered in each direction.
pub fn memory_pair(capacity: usize) -> (MemoryTransport, DuplexStream) {
    let (server_end, client_end) = tokio::io::duplex(capacity);
    let (reader, writer) = tokio::io::split(server_end);
    (StreamTransport::new(reader, writer, "memory"), client_end)
}

#[async_trait]
impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, bytes: &[u8]) -> Result<usize, TransportError> {
        if self.closed.is_closed() {
            return Err(TransportError::Closed);
        }
        // A write to a peer that stopped reading may never finish; close
        // cancels it and releases the writer.
        let mut writer = tokio::select! {
            writer = self.writer.lock() => writer,
            _ = self.closed.closed() => return Err(TransportError::Closed),
        };
        let Some(writer) = writer.as_mut() else {
            return Err(TransportError::Closed);
        };
        tokio::select! {
            written = write_flushed(writer, bytes) => written?,
            _ = self.closed.closed() => return Err(TransportError::Closed),
        }
        Ok(bytes.len())
    }

    async fn receive(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.closed.is_closed() {
            return Ok(0);
        }
        let mut reader = self.reader.lock().await;
        tokio::select! {
            read = reader.read(buf) => Ok(read?),
            _ = self.closed.closed() => Ok(0),
        }
    }

    async fn close(&self) {
        if !self.closed.trigger() {
            return;
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            // Peer may already be gone, or may never drain its buffer
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, writer.shutdown()).await;
        }
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

impl<R, W> fmt::Debug for StreamTransport<R, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTransport")
            .field("peer", &self.peer)
            .field("closed", &self.closed.is_closed())
            .finish()
    }
}
