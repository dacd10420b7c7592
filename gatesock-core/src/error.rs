//! Error types and result handling for gatesock.
//!
//! This module provides a unified error type covering every failure the
//! gateway can report, from transport faults to WebSocket protocol violations.
//!
//! # Error Categories
//!
//! - **Transport faults**: [`Error::Io`]. Reported to the owning session's close
//!   path and never retried by the core.
//! - **Protocol violations**: [`Error::Protocol`] wrapping a [`ProtocolError`].
//!   The offending connection is closed with [`ProtocolError::close_code`].
//! - **Handshake failures**: [`Error::Handshake`].
//! - **Lifecycle misuse**: [`Error::IllegalTransition`], [`Error::SessionClosed`].
//!
//! Extension negotiation failures and heartbeat mismatches are *not* errors:
//! the former is a [`Negotiation::Rejected`](crate::extension::Negotiation)
//! value, the latter simply means "not a heartbeat".
//!
//! # Examples
//!
//! ```
//! use gatesock_core::error::{Error, ProtocolError};
//! use gatesock_core::frame::CloseCode;
//!
//! let err = Error::from(ProtocolError::UnexpectedContinuation);
//! match err {
//!     Error::Protocol(violation) => {
//!         assert_eq!(violation.close_code(), CloseCode::Protocol);
//!     }
//!     other => panic!("unexpected: {}", other),
//! }
//! ```

use crate::frame::CloseCode;
use crate::session::SessionId;
use crate::state::ConnectionState;
use std::fmt;
use thiserror::Error;

/// The main error type for gatesock operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level IO failure (reset, broken pipe, bind failure).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or configuration parsing failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The peer violated the WebSocket wire protocol.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The HTTP upgrade handshake could not be completed.
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// A connection lifecycle method was called in a state that forbids it.
    #[error("Illegal state transition: {from} -> {to}")]
    IllegalTransition {
        /// State the machine was in
        from: ConnectionState,
        /// State that was requested
        to: ConnectionState,
    },

    /// The session is no longer open for sending.
    #[error("Session closed: {0}")]
    SessionClosed(SessionId),

    /// No session with the given id is registered.
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// Gateway configuration is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Message payload was not in the expected format.
    #[error("Invalid message format")]
    InvalidMessage,

    /// Application-defined failure.
    #[error("Custom error: {0}")]
    Custom(String),
}

/// A specialized `Result` type for gatesock operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a custom error from any displayable value.
    pub fn custom<T: fmt::Display>(msg: T) -> Self {
        Error::Custom(msg.to_string())
    }

    /// Creates a handshake error from any displayable value.
    pub fn handshake<T: fmt::Display>(msg: T) -> Self {
        Error::Handshake(msg.to_string())
    }

    /// Creates a configuration error from any displayable value.
    pub fn config<T: fmt::Display>(msg: T) -> Self {
        Error::Config(msg.to_string())
    }

    /// Close code to send when this error terminates a WebSocket session.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Error::Protocol(violation) => violation.close_code(),
            Error::InvalidMessage => CloseCode::InvalidPayload,
            _ => CloseCode::Internal,
        }
    }
}

/// WebSocket wire protocol violations detected while decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Opcode is reserved or undefined.
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),

    /// RSV bits are set that no negotiated extension owns.
    #[error("reserved bits {0:#05b} set without a negotiated extension")]
    ReservedBits(u8),

    /// Control frames must have FIN set.
    #[error("fragmented control frame")]
    FragmentedControlFrame,

    /// Control frame payloads are limited to 125 bytes.
    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlFrameTooLarge(u64),

    /// 64-bit payload length with the most significant bit set.
    #[error("64-bit payload length {0:#x} has its most significant bit set")]
    InvalidPayloadLength(u64),

    /// Declared payload length exceeds the configured maximum.
    #[error("payload of {len} bytes exceeds limit of {max}")]
    PayloadTooLarge {
        /// Declared length
        len: u64,
        /// Configured maximum
        max: u64,
    },

    /// Continuation frame without an open fragmentation stream.
    #[error("continuation frame without an open fragment stream")]
    UnexpectedContinuation,

    /// New data frame while a fragmentation stream is still open.
    #[error("data frame interrupts an open fragment stream")]
    InterruptedFragmentStream,

    /// Mask bit does not match the peer's role.
    #[error("mask bit must be {expected}")]
    MaskMismatch {
        /// Whether the frame was required to be masked
        expected: bool,
    },

    /// Text payload is not valid UTF-8.
    #[error("text payload is not valid UTF-8")]
    InvalidUtf8,

    /// Close frame payload is malformed.
    #[error("malformed close payload")]
    InvalidClosePayload,

    /// A negotiated extension failed to transform a payload.
    #[error("extension {name} failed: {reason}")]
    Extension {
        /// Extension name
        name: String,
        /// Failure description
        reason: String,
    },
}

impl ProtocolError {
    /// Maps the violation to the close code sent to the peer.
    pub fn close_code(&self) -> CloseCode {
        match self {
            ProtocolError::PayloadTooLarge { .. } => CloseCode::TooBig,
            ProtocolError::InvalidUtf8 => CloseCode::InvalidPayload,
            _ => CloseCode::Protocol,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_error() {
        let err = Error::custom("test error");
        assert!(matches!(err, Error::Custom(_)));
        assert_eq!(err.to_string(), "Custom error: test error");
    }

    #[test]
    fn test_handshake_error() {
        let err = Error::handshake("missing Sec-WebSocket-Key");
        assert_eq!(err.to_string(), "Handshake error: missing Sec-WebSocket-Key");
    }

    #[test]
    fn test_session_not_found() {
        let err = Error::SessionNotFound("session_7".to_string());
        assert_eq!(err.to_string(), "Session not found: session_7");
    }

    #[test]
    fn test_illegal_transition_display() {
        let err = Error::IllegalTransition {
            from: ConnectionState::Closed,
            to: ConnectionState::Open,
        };
        assert_eq!(err.to_string(), "Illegal state transition: Closed -> Open");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.close_code(), CloseCode::Internal);
    }

    #[test]
    fn test_protocol_close_codes() {
        assert_eq!(
            ProtocolError::PayloadTooLarge { len: 10, max: 5 }.close_code(),
            CloseCode::TooBig
        );
        assert_eq!(ProtocolError::InvalidUtf8.close_code(), CloseCode::InvalidPayload);
        assert_eq!(ProtocolError::ReservedBits(0b100).close_code(), CloseCode::Protocol);
        assert_eq!(
            Error::from(ProtocolError::UnexpectedContinuation).close_code(),
            CloseCode::Protocol
        );
    }

    #[test]
    fn test_reserved_bits_display() {
        let err = ProtocolError::ReservedBits(0b010);
        assert_eq!(
            err.to_string(),
            "reserved bits 0b010 set without a negotiated extension"
        );
    }
}
