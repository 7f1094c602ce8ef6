//! # Session Correlator
//!
//! Bridges the fire-and-forget transport and the request/reply protocol
//! drivers. Every outbound request mints a fresh [`Session`] token; the reply
//! carries the token back and is routed to the single waiter registered for
//! it.
//!
//! ## Rules
//!
//! - A session is waited on at most once: [`SessionCorrelator::wait_reply`]
//!   consumes it and unregisters it whatever the outcome (reply, null,
//!   timeout or cancellation).
//! - A delivery is accepted only while the session is registered **and** the
//!   observed source is the peer the session was opened against.
//!   SECURITY: this rejects reply injection from third parties.
//! - Exactly one delivery succeeds; later deliveries return `false`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::identity::Identity;

pub type SessionId = u64;

struct Waiter<R> {
    destination: Identity,
    tx: oneshot::Sender<Option<R>>,
}

/// An open request awaiting its reply.
pub struct Session<R> {
    id: SessionId,
    destination: Identity,
    rx: oneshot::Receiver<Option<R>>,
}

impl<R> Session<R> {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn destination(&self) -> Identity {
        self.destination
    }
}

pub struct SessionCorrelator<R> {
    next_id: AtomicU64,
    waiters: DashMap<SessionId, Waiter<R>>,
}

impl<R> Default for SessionCorrelator<R> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            waiters: DashMap::new(),
        }
    }
}

/// Unregisters a session when the wait ends, including on cancellation.
struct Unregister<'a, R> {
    sessions: &'a SessionCorrelator<R>,
    id: SessionId,
}

impl<R> Drop for Unregister<'_, R> {
    fn drop(&mut self) {
        self.sessions.waiters.remove(&self.id);
    }
}

impl<R> SessionCorrelator<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh token bound to `destination`.
    pub fn new_session(&self, destination: Identity) -> Session<R> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, Waiter { destination, tx });
        trace!(session = id, peer = %destination.short(), "session opened");
        Session { id, destination, rx }
    }

    /// Wait up to `timeout` for the outcome of `session`.
    ///
    /// Returns `None` on timeout or when the session was explicitly nulled.
    pub async fn wait_reply(&self, session: Session<R>, timeout: Duration) -> Option<R> {
        let _unregister = Unregister {
            sessions: self,
            id: session.id,
        };
        match tokio::time::timeout(timeout, session.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => None,
            Err(_) => {
                debug!(
                    session = session.id,
                    peer = %session.destination.short(),
                    timeout_ms = timeout.as_millis() as u64,
                    "session timed out"
                );
                None
            }
        }
    }

    /// Deliver a reply observed from `source`.
    pub fn set_reply(&self, id: SessionId, source: &Identity, reply: R) -> bool {
        self.deliver(id, source, Some(reply))
    }

    /// Release a session early without a reply (e.g. the request was never sent).
    pub fn set_null(&self, id: SessionId, source: &Identity) -> bool {
        self.deliver(id, source, None)
    }

    fn deliver(&self, id: SessionId, source: &Identity, outcome: Option<R>) -> bool {
        match self.waiters.remove_if(&id, |_, waiter| waiter.destination == *source) {
            Some((_, waiter)) => waiter.tx.send(outcome).is_ok(),
            None => {
                if self.waiters.contains_key(&id) {
                    debug!(
                        session = id,
                        source = %source.short(),
                        "dropping reply from unexpected source"
                    );
                }
                false
            }
        }
    }

    /// Null every session open against `destination`. Returns how many were released.
    pub fn release_all(&self, destination: &Identity) -> usize {
        let ids: Vec<SessionId> = self
            .waiters
            .iter()
            .filter(|entry| entry.value().destination == *destination)
            .map(|entry| *entry.key())
            .collect();
        ids.into_iter()
            .filter(|id| self.set_null(*id, destination))
            .count()
    }

    /// Number of sessions currently awaiting a reply.
    pub fn pending(&self) -> usize {
        self.waiters.len()
    }
}
