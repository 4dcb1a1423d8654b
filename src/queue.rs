//! Admission queue
//!
//! Multi-producer FIFO between the session receive loops and the single
//! broadcasting consumer. Built on an unbounded tokio mpsc channel: pushes
//! never suspend, and global arrival order is the pop order.

use std::sync::{Mutex, PoisonError};

use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::error::SendError;

/// FIFO queue shared by every session (producers) and the server (consumer)
///
/// The queue holds the only sender of its channel. Closing drops it, which
/// lets the consumer drain what was admitted and then observe the end.
#[derive(Debug)]
pub struct AdmissionQueue<T> {
    sender: Mutex<Option<mpsc::UnboundedSender<T>>>,
    receiver: AsyncMutex<mpsc::UnboundedReceiver<T>>,
}

impl<T> AdmissionQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: AsyncMutex::new(receiver),
        }
    }

    /// Append an item and wake the waiting consumer
    ///
    /// Fails once the queue has been closed.
    pub fn push(&self, item: T) -> Result<(), SendError> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => sender.send(item).map_err(|_| SendError::ChannelClosed),
            None => Err(SendError::ChannelClosed),
        }
    }

    /// Suspend until an item is available, then remove and return it
    ///
    /// Returns `None` only after `close` has been called and every item
    /// admitted before it has been popped.
    pub async fn wait_and_pop(&self) -> Option<T> {
        self.receiver.lock().await.recv().await
    }

    /// Stop admitting new items
    ///
    /// Items already queued remain poppable.
    pub fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl<T> Default for AdmissionQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
