//! Client session
//!
//! One `Session` per accepted connection. Its receive loop turns incoming
//! bytes into `Message`s on the admission queue; other sessions' broadcasts
//! reach its client through `deliver`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::TransportError;
use crate::message::{encode_line, LineDecoder, Message, DEFAULT_MAX_LINE_BYTES};
use crate::queue::AdmissionQueue;
use crate::room::Room;
use crate::transport::Transport;
use crate::types::SessionId;

/// Per-session tuning
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Size of the buffer handed to each `receive` call
    pub read_buffer_bytes: usize,
    /// Longest line accepted before it is split
    pub max_line_bytes: usize,
    /// Upper bound on a single delivery write (None = wait forever)
    pub delivery_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            read_buffer_bytes: 4096,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            delivery_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// A connected client
///
/// The room only keeps weak references to sessions; the task running the
/// receive loop holds the strong one, so a session is dropped once its loop
/// has finished and no broadcast is still delivering to it.
pub struct Session {
    id: SessionId,
    peer: String,
    transport: Box<dyn Transport>,
    room: Arc<Room>,
    queue: Arc<AdmissionQueue<Message>>,
    options: SessionOptions,
    /// Cleared by `stop`, never set again
    running: AtomicBool,
    /// Set when leave + close has run
    torn_down: AtomicBool,
}

impl Session {
    /// Create a session bound to a transport, a room and the admission queue
    pub fn new<T>(
        transport: T,
        room: Arc<Room>,
        queue: Arc<AdmissionQueue<Message>>,
        options: SessionOptions,
    ) -> Arc<Self>
    where
        T: Transport + 'static,
    {
        let peer = transport.peer();
        Arc::new(Self {
            id: SessionId::new(),
            peer,
            transport: Box::new(transport),
            room,
            queue,
            options,
            running: AtomicBool::new(true),
            torn_down: AtomicBool::new(false),
        })
    }

    /// This session's identity
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Remote address (or transport description)
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Whether the receive loop may still admit messages
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Join the room and spawn the receive loop
    ///
    /// Must be called at most once per session.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.join_room();
        tokio::spawn(Arc::clone(self).run())
    }

    /// Write one line of text to this session's client
    ///
    /// Fails with `TransportError::Closed` once the session has been torn
    /// down. Callers broadcasting to many sessions should log and move on.
    pub async fn deliver(&self, text: &str) -> Result<(), TransportError> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let line = encode_line(text);
        let write = self.transport.send(&line);
        match self.options.delivery_timeout {
            Some(limit) => {
                tokio::time::timeout(limit, write)
                    .await
                    .map_err(|_| TransportError::Timeout)??;
            }
            None => {
                write.await?;
            }
        }
        Ok(())
    }

    /// Ask the receive loop to exit at its next check
    ///
    /// Does not interrupt a read that is already waiting for data.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            debug!("Session {} stop requested", self.id);
        }
    }

    /// Stop and close the transport, waking a blocked receive loop
    pub async fn shutdown(&self) {
        self.stop();
        self.transport.close().await;
    }

    pub(crate) fn join_room(self: &Arc<Self>) {
        self.room.join(self);
    }

    /// Receive loop. Runs until end-of-stream, a read error, `stop`, or the
    /// admission queue closing; then leaves the room and closes the transport.
    pub(crate) async fn run(self: Arc<Self>) {
        info!("Session {} connected from {}", self.id, self.peer);

        let mut buf = vec![0u8; self.options.read_buffer_bytes.max(1)];
        let mut decoder = LineDecoder::new(self.options.max_line_bytes);

        while self.is_running() {
            let n = match self.transport.receive(&mut buf).await {
                Ok(0) => {
                    debug!("Session {} reached end of stream", self.id);
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!("Session {} read error: {}", self.id, e);
                    break;
                }
            };

            if !self.is_running() {
                break;
            }
            let lines = decoder.decode(&buf[..n]);
            if !self.admit_all(lines) {
                break;
            }
        }

        if self.is_running() {
            if let Some(partial) = decoder.finish() {
                self.admit_all(vec![partial]);
            }
        }

        self.teardown().await;
    }

    /// Push lines onto the admission queue; false once the queue is closed
    fn admit_all(&self, lines: Vec<String>) -> bool {
        for line in lines {
            debug!("Session {} admitted {} bytes", self.id, line.len());
            if self.queue.push(Message::new(line, self.id)).is_err() {
                debug!("Admission queue closed, ending session {}", self.id);
                return false;
            }
        }
        true
    }

    async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.running.store(false, Ordering::Release);
        self.room.leave(self.id);
        self.transport.close().await;
        info!("Session {} disconnected ({})", self.id, self.peer);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::{mpsc, Barrier, Mutex};

    use super::*;
    use crate::transport::{memory_pair, CloseSignal};

    /// Scripted transport that counts closes and records writes
    struct RecordingTransport {
        reads: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
        sent: Arc<StdMutex<Vec<Vec<u8>>>>,
        closes: Arc<AtomicUsize>,
        closed: CloseSignal,
        stall_sends: bool,
    }

    struct Script {
        reads: mpsc::UnboundedSender<Vec<u8>>,
        sent: Arc<StdMutex<Vec<Vec<u8>>>>,
        closes: Arc<AtomicUsize>,
    }

    fn recording_transport(stall_sends: bool) -> (RecordingTransport, Script) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let closes = Arc::new(AtomicUsize::new(0));
        let transport = RecordingTransport {
            reads: Mutex::new(rx),
            sent: sent.clone(),
            closes: closes.clone(),
            closed: CloseSignal::new(),
            stall_sends,
        };
        (
            transport,
            Script {
                reads: tx,
                sent,
                closes,
            },
        )
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, bytes: &[u8]) -> Result<usize, TransportError> {
            if self.stall_sends {
                std::future::pending::<()>().await;
            }
            self.sent.lock().unwrap().push(bytes.to_vec());
            Ok(bytes.len())
        }

        async fn receive(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
            let mut reads = self.reads.lock().await;
            tokio::select! {
                chunk = reads.recv() => match chunk {
                    Some(chunk) => {
                        buf[..chunk.len()].copy_from_slice(&chunk);
                        Ok(chunk.len())
                    }
                    None => Ok(0),
                },
                _ = self.closed.closed() => Ok(0),
            }
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.closed.trigger();
        }

        fn peer(&self) -> String {
            "recording".to_string()
        }
    }

    fn shared() -> (Arc<Room>, Arc<AdmissionQueue<Message>>) {
        (Arc::new(Room::new()), Arc::new(AdmissionQueue::new()))
    }

    async fn wait_for_exit(handle: JoinHandle<()>) {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("receive loop should exit")
            .unwrap();
    }

    #[tokio::test]
    async fn test_received_lines_are_admitted_with_sender_identity() {
        let (room, queue) = shared();
        let (transport, mut client) = memory_pair(1024);
        let session = Session::new(transport, room.clone(), queue.clone(), SessionOptions::default());
        let handle = session.start();

        assert_eq!(room.member_count(), 1);

        client.write_all(b"first\nsec").await.unwrap();
        client.write_all(b"ond\n").await.unwrap();

        let first = queue.wait_and_pop().await.unwrap();
        let second = queue.wait_and_pop().await.unwrap();
        assert_eq!(first, Message::new("first", session.id()));
        assert_eq!(second, Message::new("second", session.id()));

        drop(client);
        wait_for_exit(handle).await;
        assert_eq!(room.member_count(), 0);
    }

    #[tokio::test]
    async fn test_partial_line_flushed_on_disconnect() {
        let (room, queue) = shared();
        let (transport, mut client) = memory_pair(1024);
        let session = Session::new(transport, room, queue.clone(), SessionOptions::default());
        let handle = session.start();

        client.write_all(b"unterminated").await.unwrap();
        drop(client);
        wait_for_exit(handle).await;

        let msg = queue.wait_and_pop().await.unwrap();
        assert_eq!(msg.text(), "unterminated");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_racing_remote_close_tears_down_once() {
        for _ in 0..50 {
            let (room, queue) = shared();
            let (transport, script) = recording_transport(false);
            let Script { reads, closes, .. } = script;
            let session = Session::new(transport, room.clone(), queue, SessionOptions::default());
            let handle = session.start();

            // Explicit stop, remote disconnect and a direct teardown all at once
            let barrier = Arc::new(Barrier::new(3));
            let stopper = {
                let (session, barrier) = (session.clone(), barrier.clone());
                tokio::spawn(async move {
                    barrier.wait().await;
                    session.stop();
                })
            };
            let remote = {
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    drop(reads);
                })
            };
            let closer = {
                let (session, barrier) = (session.clone(), barrier.clone());
                tokio::spawn(async move {
                    barrier.wait().await;
                    session.teardown().await;
                })
            };
            for task in [stopper, remote, closer] {
                task.await.unwrap();
            }
            wait_for_exit(handle).await;

            assert!(!session.is_running());
            assert_eq!(room.departures(), 1);
            assert_eq!(closes.load(Ordering::SeqCst), 1);
            assert_eq!(room.member_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_data_after_stop_is_not_admitted() {
        let (room, queue) = shared();
        let (transport, script) = recording_transport(false);
        let session = Session::new(transport, room, queue.clone(), SessionOptions::default());
        let handle = session.start();

        script.reads.send(b"before\n".to_vec()).unwrap();
        assert_eq!(queue.wait_and_pop().await.unwrap().text(), "before");

        session.stop();
        script.reads.send(b"after\n".to_vec()).unwrap();
        wait_for_exit(handle).await;

        queue.close();
        assert_eq!(queue.wait_and_pop().await, None);
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_pending_receive() {
        let (room, queue) = shared();
        let (transport, _client) = memory_pair(64);
        let session = Session::new(transport, room.clone(), queue, SessionOptions::default());
        let handle = session.start();

        tokio::time::sleep(Duration::from_millis(20)).await;
        session.shutdown().await;
        wait_for_exit(handle).await;

        assert_eq!(room.member_count(), 0);
    }

    #[tokio::test]
    async fn test_deliver_writes_line() {
        let (room, queue) = shared();
        let (transport, mut client) = memory_pair(1024);
        let session = Session::new(transport, room, queue, SessionOptions::default());

        session.deliver("A : hi").await.unwrap();

        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"A : hi\n");
        // Never started, so finish the lifecycle by hand
        session.teardown().await;
    }

    #[tokio::test]
    async fn test_deliver_after_teardown_fails_quietly() {
        let (room, queue) = shared();
        let (transport, script) = recording_transport(false);
        let session = Session::new(transport, room, queue, SessionOptions::default());
        let handle = session.start();

        drop(script.reads);
        wait_for_exit(handle).await;

        assert!(matches!(
            session.deliver("late").await,
            Err(TransportError::Closed)
        ));
        assert!(script.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deliver_times_out_on_stalled_peer() {
        let (room, queue) = shared();
        let (transport, _script) = recording_transport(true);
        let options = SessionOptions {
            delivery_timeout: Some(Duration::from_millis(20)),
            ..SessionOptions::default()
        };
        let session = Session::new(transport, room, queue, options);

        assert!(matches!(
            session.deliver("stuck").await,
            Err(TransportError::Timeout)
        ));
        session.teardown().await;
    }

    #[tokio::test]
    async fn test_closed_queue_ends_session() {
        let (room, queue) = shared();
        let (transport, script) = recording_transport(false);
        let session = Session::new(transport, room.clone(), queue.clone(), SessionOptions::default());
        let handle = session.start();

        queue.close();
        script.reads.send(b"dropped\n".to_vec()).unwrap();
        wait_for_exit(handle).await;

        assert_eq!(script.closes.load(Ordering::SeqCst), 1);
        assert_eq!(room.member_count(), 0);
    }
}
