//! Shared chat room
//!
//! Tracks live membership and fans each message out to every member except
//! its sender. Members are held as weak references: the room can notice a
//! session has gone away but never keeps one alive.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::message::Message;
use crate::session::Session;
use crate::types::SessionId;

/// A membership entry, possibly stale
#[derive(Debug)]
struct Member {
    id: SessionId,
    session: Weak<Session>,
}

/// The room every connected session joins
#[derive(Debug, Default)]
pub struct Room {
    members: Mutex<Vec<Member>>,
    /// Total `leave` calls
    departures: AtomicUsize,
}

impl Room {
    /// Create an empty room
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to the room
    ///
    /// Returns false if it was already a member.
    pub fn join(&self, session: &Arc<Session>) -> bool {
        let id = session.id();
        let mut members = self.lock();
        if members.iter().any(|m| m.id == id) {
            return false;
        }
        members.push(Member {
            id,
            session: Arc::downgrade(session),
        });
        debug!("Session {} joined, {} members", id, members.len());
        true
    }

    /// Remove a session, pruning stale entries on the way
    ///
    /// Safe to call for sessions that never joined or already left.
    /// Returns true if an entry for `id` was removed.
    pub fn leave(&self, id: SessionId) -> bool {
        let departures = self.departures.fetch_add(1, Ordering::Relaxed) + 1;
        let mut members = self.lock();
        let before = members.len();
        let mut removed = false;
        members.retain(|m| {
            if m.id == id {
                removed = true;
                return false;
            }
            m.session.strong_count() > 0
        });
        debug!(
            "Session {} left, {} entries removed, {} members, {} departures",
            id,
            before - members.len(),
            members.len(),
            departures
        );
        removed
    }

    /// Deliver a message to every live member except its sender
    ///
    /// Recipients are collected under the lock and written to after it is
    /// released, so a slow peer never blocks `join`/`leave`. A failed
    /// delivery is logged and does not affect the others.
    /// Returns the number of successful deliveries.
    pub async fn broadcast(&self, message: &Message) -> usize {
        let sender = message.sender();
        let recipients = {
            let mut members = self.lock();
            let mut recipients = Vec::with_capacity(members.len());
            members.retain(|m| match m.session.upgrade() {
                Some(session) => {
                    if m.id != sender {
                        recipients.push(session);
                    }
                    true
                }
                None => {
                    debug!("Pruning stale member {}", m.id);
                    false
                }
            });
            recipients
        };

        let results = join_all(recipients.iter().map(|session| async move {
            let result = session.deliver(message.text()).await;
            if let Err(e) = &result {
                warn!("Delivery to session {} failed: {}", session.id(), e);
            }
            result.is_ok()
        }))
        .await;

        let delivered = results.into_iter().filter(|ok| *ok).count();
        debug!(
            "Broadcast from {} delivered to {}/{} members",
            sender,
            delivered,
            recipients.len()
        );
        delivered
    }

    /// Number of live members, after pruning stale entries
    pub fn member_count(&self) -> usize {
        let mut members = self.lock();
        members.retain(|m| m.session.strong_count() > 0);
        members.len()
    }

    /// Number of `leave` calls so far, whether or not they removed an entry
    pub fn departures(&self) -> usize {
        self.departures.load(Ordering::Relaxed)
    }

    /// Strong handles to every live member
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.lock()
            .iter()
            .filter_map(|m| m.session.upgrade())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Member>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
