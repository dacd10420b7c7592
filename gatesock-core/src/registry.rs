//! Session registry.
//!
//! One [`SessionRegistry`] exists per module. It is the only structure shared
//! between connection tasks, so it is backed by a [`DashMap`]: inserts,
//! removals and broadcasts may run concurrently from any task.
//!
//! Registry inconsistencies are never errors. Inserting an existing id
//! replaces the entry and removing an absent id does nothing.
//!
//! # Broadcasting
//!
//! [`broadcast`](SessionRegistry::broadcast) takes a snapshot of the current
//! sessions and then sends to each one independently. A failing session is
//! logged and counted in the returned [`BroadcastReport`]; it never stops
//! delivery to the others.
//!
//! ```
//! use gatesock_core::registry::SessionRegistry;
//! use gatesock_core::message::Message;
//!
//! let registry = SessionRegistry::new();
//! let report = registry.broadcast(Message::text("shutdown in 5 minutes"));
//! assert_eq!(report.delivered, 0);
//! assert!(report.failed.is_empty());
//! ```

use crate::error::{Error, Result};
use crate::message::Message;
use crate::session::{Session, SessionId};
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of a fan-out send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sessions the message was queued for
    pub delivered: usize,
    /// Sessions that refused the message
    pub failed: Vec<SessionId>,
}

impl BroadcastReport {
    /// Whether every targeted session accepted the message.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Concurrent map from session id to live session.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionId, Session>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session, replacing any entry with the same id.
    ///
    /// Returns the number of registered sessions.
    pub fn insert(&self, session: Session) -> usize {
        let id = session.id().clone();
        if self.sessions.insert(id.clone(), session).is_some() {
            debug!("Replaced session: {}", id);
        }
        let count = self.sessions.len();
        info!("Added session: {} (Total: {})", id, count);
        count
    }

    /// Removes a session. Removing an unknown id is a no-op.
    pub fn remove(&self, id: &SessionId) -> Option<Session> {
        let removed = self.sessions.remove(id).map(|(_, session)| session);
        if removed.is_some() {
            info!("Removed session: {} (Total: {})", id, self.sessions.len());
        }
        removed
    }

    /// Looks up a session.
    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Whether a session with this id is registered.
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Number of registered sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ids of all registered sessions.
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Point-in-time copy of all sessions.
    ///
    /// No shard lock is held once this returns.
    pub fn snapshot(&self) -> Vec<Session> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Sends to one session.
    pub fn send_to(&self, id: &SessionId, message: Message) -> Result<()> {
        self.get(id)
            .ok_or_else(|| Error::SessionNotFound(id.clone()))?
            .send(message)
    }

    /// Sends to every session present at call time.
    pub fn broadcast(&self, message: Message) -> BroadcastReport {
        self.fan_out(self.snapshot(), message)
    }

    /// Broadcasts a text message.
    pub fn broadcast_text(&self, text: impl Into<String>) -> BroadcastReport {
        self.broadcast(Message::text(text))
    }

    /// Broadcasts a binary message.
    pub fn broadcast_binary(&self, data: impl Into<Bytes>) -> BroadcastReport {
        self.broadcast(Message::binary(data))
    }

    /// Sends to every session except `except_id`.
    pub fn broadcast_except(&self, except_id: &SessionId, message: Message) -> BroadcastReport {
        let targets = self
            .snapshot()
            .into_iter()
            .filter(|session| session.id() != except_id)
            .collect();
        self.fan_out(targets, message)
    }

    fn fan_out(&self, targets: Vec<Session>, message: Message) -> BroadcastReport {
        debug!("Broadcasting message to {} sessions", targets.len());
        let mut report = BroadcastReport::default();
        for session in targets {
            match session.send(message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Failed to broadcast to {}: {}", session.id(), e);
                    report.failed.push(session.id().clone());
                }
            }
        }
        debug!(
            "Broadcast complete: {} delivered, {} failed",
            report.delivered,
            report.failed.len()
        );
        report
    }
}
