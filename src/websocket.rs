//! WebSocket transport
//!
//! Lets browser-style clients join the same room as raw TCP clients. Each
//! inbound text or binary frame is one chat line; each delivered line goes
//! out as one text frame.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::error::TransportError;
use crate::transport::{CloseSignal, Transport, CLOSE_TIMEOUT};

struct Inbound {
    stream: SplitStream<WebSocketStream<TcpStream>>,
    /// Bytes of the current frame not yet handed to the caller
    pending: Vec<u8>,
}

/// Transport over an accepted WebSocket connection
pub struct WebSocketTransport {
    peer: String,
    sink: Mutex<SplitSink<WebSocketStream<TcpStream>, Message>>,
    inbound: Mutex<Inbound>,
    closed: CloseSignal,
}

impl WebSocketTransport {
    /// Perform the server side handshake on an accepted TCP connection
    pub async fn accept(stream: TcpStream) -> Result<Self, TransportError> {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (sink, stream) = ws_stream.split();
        debug!("WebSocket handshake completed with {}", peer);

        Ok(Self {
            peer,
            sink: Mutex::new(sink),
            inbound: Mutex::new(Inbound {
                stream,
                pending: Vec::new(),
            }),
            closed: CloseSignal::new(),
        })
    }

    /// Wait for the next data frame, returning its payload as one line
    async fn next_frame(inbound: &mut Inbound) -> Result<Option<Vec<u8>>, TransportError> {
        while let Some(frame) = inbound.stream.next().await {
            let mut line = match frame? {
                Message::Text(text) => text.as_bytes().to_vec(),
                Message::Binary(data) => data.to_vec(),
                Message::Close(_) => return Ok(None),
                // Pong is handled automatically by tungstenite
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };
            if line.last() != Some(&b'\n') {
                line.push(b'\n');
            }
            return Ok(Some(line));
        }
        Ok(None)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, bytes: &[u8]) -> Result<usize, TransportError> {
        if self.closed.is_closed() {
            return Err(TransportError::Closed);
        }
        let text = String::from_utf8_lossy(bytes);
        let text = text.strip_suffix('\n').unwrap_or(&text).to_string();
        // Cancelled by close, so a peer that stopped reading cannot hold the sink
        let mut sink = tokio::select! {
            sink = self.sink.lock() => sink,
            _ = self.closed.closed() => return Err(TransportError::Closed),
        };
        tokio::select! {
            sent = sink.send(Message::Text(text)) => sent?,
            _ = self.closed.closed() => return Err(TransportError::Closed),
        }
        Ok(bytes.len())
    }

    async fn receive(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.closed.is_closed() {
            return Ok(0);
        }
        let mut inbound = self.inbound.lock().await;

        if inbound.pending.is_empty() {
            let frame = tokio::select! {
                frame = Self::next_frame(&mut inbound) => frame?,
                _ = self.closed.closed() => None,
            };
            match frame {
                Some(line) => inbound.pending = line,
                None => return Ok(0),
            }
        }

        let n = buf.len().min(inbound.pending.len());
        buf[..n].copy_from_slice(&inbound.pending[..n]);
        inbound.pending.drain(..n);
        Ok(n)
    }

    async fn close(&self) {
        if !self.closed.trigger() {
            return;
        }
        // Sends a close frame; the peer may already be gone or never read it
        let mut sink = self.sink.lock().await;
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}
