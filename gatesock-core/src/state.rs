//! Connection lifecycle state machine.
//!
//! Every TCP, UDP and WebSocket connection owns one [`ConnectionStateMachine`].
//! Transitions only move forward:
//!
//! ```text
//! None -> Connecting -> Open -> Closing -> Closed
//!              \          \________________/^
//!               \______________________/
//! ```
//!
//! `Connecting -> Closed` and `Open -> Closed` are always legal (abrupt
//! failure). `Closing` exists only for WebSocket connections; TCP and UDP go
//! straight from `Open` to `Closed`. Nothing leaves `Closed`.
//!
//! State changes are published through a [`tokio::sync::watch`] channel so
//! higher layers can gate send availability on them.
//!
//! # Examples
//!
//! ```
//! use gatesock_core::state::{ConnectionState, ConnectionStateMachine, TransportKind};
//!
//! let machine = ConnectionStateMachine::new(TransportKind::WebSocket);
//! machine.begin_connect().unwrap();
//! machine.mark_connected().unwrap();
//! assert!(machine.is_open());
//!
//! // Concurrent close requests collapse into one observable close.
//! assert!(machine.mark_closed());
//! assert!(!machine.mark_closed());
//! assert_eq!(machine.state(), ConnectionState::Closed);
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

/// Transport a connection runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Raw TCP stream
    Tcp,
    /// UDP datagrams from a single peer
    Udp,
    /// WebSocket over TCP
    WebSocket,
}

impl TransportKind {
    /// Whether the transport has a closing handshake.
    pub fn has_closing_handshake(self) -> bool {
        matches!(self, TransportKind::WebSocket)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => f.write_str("tcp"),
            TransportKind::Udp => f.write_str("udp"),
            TransportKind::WebSocket => f.write_str("websocket"),
        }
    }
}

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Created, nothing attempted yet
    None,
    /// Accept or connect in progress (includes the WebSocket handshake)
    Connecting,
    /// Ready to send and receive
    Open,
    /// Close frame sent or received, waiting for the peer
    Closing,
    /// Resources released
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Forward-only state machine shared by a connection's reader and writer tasks.
#[derive(Debug)]
pub struct ConnectionStateMachine {
    transport: TransportKind,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionStateMachine {
    /// Creates a machine in [`ConnectionState::None`].
    pub fn new(transport: TransportKind) -> Self {
        let (state, _) = watch::channel(ConnectionState::None);
        Self { transport, state }
    }

    /// Transport this machine belongs to.
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether sends and receives are currently allowed.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Whether the connection reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// `None -> Connecting`.
    pub fn begin_connect(&self) -> Result<()> {
        self.transition(ConnectionState::Connecting, |from| {
            from == ConnectionState::None
        })
    }

    /// `Connecting -> Open`.
    pub fn mark_connected(&self) -> Result<()> {
        self.transition(ConnectionState::Open, |from| {
            from == ConnectionState::Connecting
        })
    }

    /// `Open -> Closing`. WebSocket only.
    pub fn begin_closing(&self) -> Result<()> {
        let websocket = self.transport.has_closing_handshake();
        self.transition(ConnectionState::Closing, |from| {
            websocket && from == ConnectionState::Open
        })
    }

    /// Moves to `Closed` from any state.
    ///
    /// Returns `true` for the call that performed the transition and `false`
    /// when the machine was already closed.
    pub fn mark_closed(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                false
            } else {
                *state = ConnectionState::Closed;
                true
            }
        })
    }

    fn transition(
        &self,
        to: ConnectionState,
        allowed: impl FnOnce(ConnectionState) -> bool,
    ) -> Result<()> {
        let mut rejected = None;
        self.state.send_if_modified(|state| {
            if allowed(*state) {
                *state = to;
                true
            } else {
                rejected = Some(*state);
                false
            }
        });

        match rejected {
            Some(from) => Err(Error::IllegalTransition { from, to }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(transport: TransportKind) -> ConnectionStateMachine {
        let machine = ConnectionStateMachine::new(transport);
        machine.begin_connect().unwrap();
        machine.mark_connected().unwrap();
        machine
    }

    #[test]
    fn test_websocket_full_lifecycle() {
        let machine = open(TransportKind::WebSocket);
        assert!(machine.is_open());
        machine.begin_closing().unwrap();
        assert_eq!(machine.state(), ConnectionState::Closing);
        assert!(!machine.is_open());
        assert!(machine.mark_closed());
        assert!(machine.is_closed());
    }

    #[test]
    fn test_tcp_and_udp_have_no_closing_state() {
        for transport in [TransportKind::Tcp, TransportKind::Udp] {
            let machine = open(transport);
            let err = machine.begin_closing().unwrap_err();
            assert!(matches!(
                err,
                Error::IllegalTransition {
                    from: ConnectionState::Open,
                    to: ConnectionState::Closing
                }
            ));
            assert!(machine.is_open());
        }
    }

    #[test]
    fn test_abrupt_failure_is_always_legal() {
        let machine = ConnectionStateMachine::new(TransportKind::Tcp);
        machine.begin_connect().unwrap();
        assert!(machine.mark_closed());

        let machine = open(TransportKind::Udp);
        assert!(machine.mark_closed());
    }

    #[test]
    fn test_nothing_leaves_closed() {
        let machine = open(TransportKind::WebSocket);
        machine.mark_closed();

        assert!(machine.begin_connect().is_err());
        assert!(machine.mark_connected().is_err());
        assert!(machine.begin_closing().is_err());
        assert_eq!(machine.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_no_backward_or_skipping_transitions() {
        let machine = ConnectionStateMachine::new(TransportKind::WebSocket);
        assert!(machine.mark_connected().is_err());
        assert!(machine.begin_closing().is_err());

        let machine = open(TransportKind::WebSocket);
        assert!(machine.begin_connect().is_err());
        assert!(machine.mark_connected().is_err());
    }

    #[test]
    fn test_close_is_idempotent() {
        let machine = open(TransportKind::WebSocket);
        assert!(machine.mark_closed());
        assert!(!machine.mark_closed());
        assert!(!machine.mark_closed());
    }

    #[tokio::test]
    async fn test_listeners_observe_changes() {
        let machine = ConnectionStateMachine::new(TransportKind::WebSocket);
        let mut rx = machine.subscribe();
        assert_eq!(*rx.borrow(), ConnectionState::None);

        machine.begin_connect().unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connecting);

        machine.mark_connected().unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Open);

        // A rejected transition publishes nothing.
        assert!(machine.begin_connect().is_err());
        assert!(!rx.has_changed().unwrap());
    }
}
