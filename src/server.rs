//! Chat server
//!
//! Owns the listening socket, the room and the admission queue. Two kinds of
//! background task run while the server is listening:
//! - the accept loop, which creates a `Session` per connection and supervises
//!   the session tasks
//! - the consumer loop, which pops messages off the admission queue and asks
//!   the room to broadcast them, one at a time

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::{Protocol, ServerConfig};
use crate::error::{bind_error, AppError};
use crate::message::Message;
use crate::queue::AdmissionQueue;
use crate::room::Room;
use crate::session::{Session, SessionOptions};
use crate::transport::TcpTransport;
use crate::websocket::WebSocketTransport;

/// Server lifecycle: `Idle -> Listening -> Stopped`, never back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Created, not yet bound
    Idle,
    /// Accepting connections and broadcasting
    Listening,
    /// Shut down; cannot be restarted
    Stopped,
}

/// The chat server
pub struct ChatServer {
    config: ServerConfig,
    room: Arc<Room>,
    queue: Arc<AdmissionQueue<Message>>,
    state: ServerState,
    local_addr: Option<SocketAddr>,
    /// Flipped to true to stop the accept loop
    shutdown: watch::Sender<bool>,
    acceptor: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
}

impl ChatServer {
    /// Create an idle server
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            room: Arc::new(Room::new()),
            queue: Arc::new(AdmissionQueue::new()),
            state: ServerState::Idle,
            local_addr: None,
            shutdown,
            acceptor: None,
            consumer: None,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ServerState {
        self.state
    }

    /// The shared room
    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    /// Address actually bound, once listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Active configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind `port` on the configured host and start serving
    ///
    /// Spawns the consumer loop and the accept loop, then returns the bound
    /// address. Port 0 picks an ephemeral port. Fails if the server is not
    /// idle or the socket cannot be bound.
    pub async fn start(&mut self, port: u16) -> Result<SocketAddr, AppError> {
        if self.state != ServerState::Idle {
            return Err(AppError::InvalidState(self.state));
        }

        let listener = TcpListener::bind((self.config.host.as_str(), port))
            .await
            .map_err(|e| bind_error(&self.config.host, port, e))?;
        let local_addr = listener.local_addr()?;

        self.consumer = Some(tokio::spawn(consume(
            self.room.clone(),
            self.queue.clone(),
        )));

        let acceptor = Acceptor {
            listener,
            room: self.room.clone(),
            queue: self.queue.clone(),
            protocol: self.config.protocol,
            options: self.config.session_options(),
            accept_backoff: self.config.accept_backoff(),
            shutdown_grace: self.config.shutdown_grace(),
        };
        self.acceptor = Some(tokio::spawn(acceptor.run(self.shutdown.subscribe())));

        self.local_addr = Some(local_addr);
        self.state = ServerState::Listening;
        info!(
            "Chat server listening on {} ({:?})",
            local_addr, self.config.protocol
        );

        Ok(local_addr)
    }

    /// Stop serving
    ///
    /// Stops accepting, force-closes every connected session and waits for
    /// their tasks, then closes the admission queue and joins the consumer.
    pub async fn stop(&mut self) {
        match self.state {
            ServerState::Stopped => return,
            ServerState::Idle => {
                self.state = ServerState::Stopped;
                return;
            }
            ServerState::Listening => {}
        }

        info!("Chat server shutting down");
        self.shutdown.send_replace(true);

        if let Some(acceptor) = self.acceptor.take() {
            if let Err(e) = acceptor.await {
                error!("Accept loop task failed: {}", e);
            }
        }

        self.queue.close();
        if let Some(consumer) = self.consumer.take() {
            join_or_abort(consumer, self.config.shutdown_grace(), "consumer").await;
        }

        self.state = ServerState::Stopped;
        info!("Chat server stopped");
    }

    /// Start, serve until `signal` resolves, then stop
    pub async fn run_until<F>(&mut self, port: u16, signal: F) -> Result<(), AppError>
    where
        F: Future<Output = ()>,
    {
        self.start(port).await?;
        signal.await;
        self.stop().await;
        Ok(())
    }
}

impl Drop for ChatServer {
    fn drop(&mut self) {
        if self.state == ServerState::Listening {
            self.shutdown.send_replace(true);
            self.queue.close();
        }
    }
}

/// Consumer loop: broadcast admitted messages in arrival order
///
/// Exits once the queue is closed and drained.
async fn consume(room: Arc<Room>, queue: Arc<AdmissionQueue<Message>>) {
    debug!("Broadcast consumer started");
    while let Some(message) = queue.wait_and_pop().await {
        room.broadcast(&message).await;
    }
    debug!("Broadcast consumer finished");
}

/// State owned by the accept loop task
struct Acceptor {
    listener: TcpListener,
    room: Arc<Room>,
    queue: Arc<AdmissionQueue<Message>>,
    protocol: Protocol,
    options: SessionOptions,
    accept_backoff: Duration,
    shutdown_grace: Duration,
}

impl Acceptor {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = stop_requested(&mut shutdown) => break,
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        error!("Session task failed: {}", e);
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        info!("New connection from {}", addr);
                        self.spawn_session(&mut sessions, stream, addr);
                        debug!("Tracking {} session tasks", sessions.len());
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(self.accept_backoff).await;
                    }
                },
            }
        }

        let Self {
            listener,
            room,
            shutdown_grace,
            ..
        } = self;
        drop(listener);

        let members = room.sessions();
        info!("Closing {} connected sessions", members.len());
        for session in members {
            if tokio::time::timeout(shutdown_grace, session.shutdown())
                .await
                .is_err()
            {
                warn!(
                    "Session {} did not close within {:?}",
                    session.id(),
                    shutdown_grace
                );
            }
        }
        drain_sessions(sessions, shutdown_grace).await;
    }

    fn spawn_session(&self, sessions: &mut JoinSet<()>, stream: TcpStream, addr: SocketAddr) {
        let room = self.room.clone();
        let queue = self.queue.clone();
        let options = self.options.clone();

        match self.protocol {
            Protocol::Tcp => {
                let session = Session::new(TcpTransport::from_tcp(stream), room, queue, options);
                session.join_room();
                sessions.spawn(session.run());
            }
            // Handshake inside the session task so a slow client never
            // holds up the accept loop
            Protocol::Websocket => {
                sessions.spawn(async move {
                    match WebSocketTransport::accept(stream).await {
                        Ok(transport) => {
                            let session = Session::new(transport, room, queue, options);
                            session.join_room();
                            session.run().await;
                        }
                        Err(e) => warn!("WebSocket handshake with {} failed: {}", addr, e),
                    }
                });
            }
        }
    }
}

/// Wait up to `grace` for every session task, then abort the rest
async fn drain_sessions(mut sessions: JoinSet<()>, grace: Duration) {
    let drained = tokio::time::timeout(grace, async {
        while let Some(finished) = sessions.join_next().await {
            if let Err(e) = finished {
                error!("Session task failed: {}", e);
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            "{} session tasks did not finish within {:?}, aborting",
            sessions.len(),
            grace
        );
        sessions.shutdown().await;
    }
}

/// Resolve once the shutdown flag is set or its sender is gone
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn join_or_abort(mut handle: JoinHandle<()>, grace: Duration, what: &str) {
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("{} task failed: {}", what, e),
        Err(_) => {
            warn!("{} task did not finish within {:?}, aborting", what, grace);
            handle.abort();
        }
    }
}
