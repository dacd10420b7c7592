//! Live sessions.
//!
//! A [`Session`] is the handle modules use to talk to one peer, whatever the
//! transport. Outbound messages go through an unbounded channel to the
//! connection's writer task, which preserves per-session FIFO order. Sends
//! are refused as soon as the connection state leaves `Open`.
//!
//! # Examples
//!
//! ```
//! use gatesock_core::session::{Session, SessionInfo};
//! use gatesock_core::state::{ConnectionStateMachine, TransportKind};
//! use std::sync::Arc;
//!
//! # fn example() -> gatesock_core::Result<()> {
//! let state = Arc::new(ConnectionStateMachine::new(TransportKind::Tcp));
//! state.begin_connect()?;
//! state.mark_connected()?;
//!
//! let info = SessionInfo::new("tcp_1", "127.0.0.1:5020".parse().unwrap(), TransportKind::Tcp);
//! let (session, mut outbound) = Session::new(info, state);
//!
//! session.send_text("PING")?;
//! assert_eq!(outbound.try_recv().unwrap().as_text(), Some("PING"));
//!
//! session.close();
//! assert!(session.send_text("late").is_err());
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use crate::message::Message;
use crate::state::{ConnectionState, ConnectionStateMachine, TransportKind};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Unique identifier of a session.
pub type SessionId = String;

/// Generates a process-unique id such as `websocket_12`.
pub fn next_session_id(transport: TransportKind) -> SessionId {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!("{}_{}", transport, COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Metadata about a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session id
    pub id: SessionId,
    /// Peer address
    pub addr: SocketAddr,
    /// Transport the session runs over
    pub transport: TransportKind,
    /// Unix timestamp (seconds) of session start
    pub connected_at: u64,
    /// Negotiated `Sec-WebSocket-Extensions` value, WebSocket only
    pub extensions: Option<String>,
}

impl SessionInfo {
    /// Metadata stamped with the current time.
    pub fn new(id: impl Into<SessionId>, addr: SocketAddr, transport: TransportKind) -> Self {
        Self {
            id: id.into(),
            addr,
            transport,
            connected_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            extensions: None,
        }
    }

    /// Records the negotiated extensions.
    pub fn with_extensions(mut self, extensions: Option<String>) -> Self {
        self.extensions = extensions;
        self
    }
}

/// Handle to one live session.
///
/// Cloning is cheap; all clones share the same channel, state machine and
/// cancellation token.
#[derive(Debug, Clone)]
pub struct Session {
    info: Arc<SessionInfo>,
    sender: mpsc::UnboundedSender<Message>,
    state: Arc<ConnectionStateMachine>,
    cancel: CancellationToken,
}

impl Session {
    /// Creates a session and the receiving end of its outbound queue.
    pub fn new(
        info: SessionInfo,
        state: Arc<ConnectionStateMachine>,
    ) -> (Self, mpsc::UnboundedReceiver<Message>) {
        Self::with_cancellation(info, state, CancellationToken::new())
    }

    /// Creates a session that also closes when `parent` is cancelled.
    pub(crate) fn child_of(
        info: SessionInfo,
        state: Arc<ConnectionStateMachine>,
        parent: &CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<Message>) {
        Self::with_cancellation(info, state, parent.child_token())
    }

    fn with_cancellation(
        info: SessionInfo,
        state: Arc<ConnectionStateMachine>,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let session = Self {
            info: Arc::new(info),
            sender,
            state,
            cancel,
        };
        (session, receiver)
    }

    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.info.id
    }

    /// Session metadata.
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.state()
    }

    /// Whether the session accepts sends.
    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }

    /// Observes connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Queues a message for delivery.
    ///
    /// Fails with [`Error::SessionClosed`] once the session left `Open` or
    /// its writer is gone.
    pub fn send(&self, message: Message) -> Result<()> {
        if !self.state.is_open() {
            return Err(Error::SessionClosed(self.id().clone()));
        }
        self.sender
            .send(message)
            .map_err(|_| Error::SessionClosed(self.id().clone()))
    }

    /// Queues a text message.
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Message::text(text))
    }

    /// Queues a binary message.
    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(Message::binary(data))
    }

    /// Serializes `data` as JSON and queues it as text.
    pub fn send_json<T: Serialize>(&self, data: &T) -> Result<()> {
        let json = serde_json::to_string(data)?;
        self.send_text(json)
    }

    /// Requests the session to close.
    ///
    /// Unblocks the reader and writer tasks; the connection then runs its
    /// close path once. Sends fail from this point on. Repeated calls are
    /// harmless.
    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        if self.state.transport().has_closing_handshake() {
            // Already closing or closed is fine.
            let _ = self.state.begin_closing();
        } else {
            self.state.mark_closed();
        }
        self.cancel.cancel();
    }

    /// Whether [`close`](Session::close) was requested.
    pub fn is_close_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token cancelled when the session is asked to close.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn state_machine(&self) -> &Arc<ConnectionStateMachine> {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_session(transport: TransportKind) -> (Session, mpsc::UnboundedReceiver<Message>) {
        let state = Arc::new(ConnectionStateMachine::new(transport));
        state.begin_connect().unwrap();
        state.mark_connected().unwrap();
        let info = SessionInfo::new(next_session_id(transport), "10.0.0.7:502".parse().unwrap(), transport);
        Session::new(info, state)
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = next_session_id(TransportKind::Udp);
        let b = next_session_id(TransportKind::Udp);
        assert_ne!(a, b);
        assert!(a.starts_with("udp_"));
    }

    #[test]
    fn test_messages_keep_fifo_order() {
        let (session, mut rx) = open_session(TransportKind::WebSocket);
        for i in 0..10 {
            session.send_text(i.to_string()).unwrap();
        }
        for i in 0..10 {
            assert_eq!(rx.try_recv().unwrap().as_text(), Some(i.to_string().as_str()));
        }
    }

    #[test]
    fn test_send_json() {
        let (session, mut rx) = open_session(TransportKind::Tcp);
        session
            .send_json(&serde_json::json!({"register": 40001, "value": 7}))
            .unwrap();
        let msg = rx.try_recv().unwrap();
        let value: serde_json::Value = msg.json().unwrap();
        assert_eq!(value["register"], 40001);
    }

    #[test]
    fn test_sends_rejected_after_close() {
        let (session, _rx) = open_session(TransportKind::WebSocket);
        session.close();
        assert_eq!(session.state(), ConnectionState::Closing);
        assert!(matches!(
            session.send_binary(vec![1u8]),
            Err(Error::SessionClosed(_))
        ));

        let (session, _rx) = open_session(TransportKind::Udp);
        session.close();
        session.close();
        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(session.is_close_requested());
    }

    #[test]
    fn test_send_fails_when_writer_is_gone() {
        let (session, rx) = open_session(TransportKind::Tcp);
        drop(rx);
        assert!(session.send_text("lost").is_err());
    }

    #[tokio::test]
    async fn test_close_unblocks_waiters() {
        let (session, _rx) = open_session(TransportKind::Tcp);
        let waiter = {
            let token = session.cancellation().clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        session.close();
        waiter.await.unwrap();
    }
}
