//! Gateway configuration.
//!
//! [`GatewayConfig`] is plain data: it is deserialized from JSON (or built in
//! code), validated once, and handed to a [`Server`](crate::server::Server).
//! Missing fields take their defaults.
//!
//! ```
//! use gatesock_core::config::GatewayConfig;
//! use gatesock_core::state::TransportKind;
//!
//! let config = GatewayConfig::from_json_str(
//!     r#"{ "listen": "0.0.0.0:9502", "transport": "tcp", "idle_timeout_ms": 0 }"#,
//! )
//! .unwrap();
//! assert_eq!(config.transport, TransportKind::Tcp);
//! assert!(config.auto_start);
//! assert_eq!(config.idle_timeout(), None);
//! ```

use crate::error::{Error, Result};
use crate::frame::DEFAULT_MAX_PAYLOAD_LEN;
use crate::handshake::DEFAULT_MAX_HANDSHAKE_LEN;
use crate::heartbeat::HEARTBEAT_LEN;
use crate::state::TransportKind;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Settings for one listening endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    /// Address to bind
    pub listen: SocketAddr,
    /// Transport served on `listen`
    pub transport: TransportKind,
    /// Whether [`Gateway::launch`](crate::server::Gateway::launch) starts listening
    pub auto_start: bool,
    /// Largest accepted WebSocket frame payload
    pub max_payload_len: u64,
    /// Largest accepted upgrade request head
    pub max_handshake_len: usize,
    /// Interval between outgoing heartbeats; 0 disables them
    pub heartbeat_interval_ms: u64,
    /// Close sessions silent for this long; 0 disables the check
    pub idle_timeout_ms: u64,
    /// Offer `permessage-deflate` to WebSocket clients
    pub per_message_deflate: bool,
    /// Read buffer size for TCP reads and UDP datagrams
    pub read_buffer_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            transport: TransportKind::WebSocket,
            auto_start: true,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            max_handshake_len: DEFAULT_MAX_HANDSHAKE_LEN,
            heartbeat_interval_ms: 30_000,
            idle_timeout_ms: 90_000,
            per_message_deflate: false,
            read_buffer_size: 8 * 1024,
        }
    }
}

impl GatewayConfig {
    /// Default settings for `transport` on `listen`.
    pub fn new(listen: SocketAddr, transport: TransportKind) -> Self {
        Self {
            listen,
            transport,
            ..Self::default()
        }
    }

    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Rejects inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        if self.max_payload_len == 0 {
            return Err(Error::config("max_payload_len must be positive"));
        }
        if self.max_payload_len > i64::MAX as u64 {
            return Err(Error::config("max_payload_len must fit in 63 bits"));
        }
        if self.max_handshake_len < 64 {
            return Err(Error::config("max_handshake_len must be at least 64 bytes"));
        }
        if self.read_buffer_size < HEARTBEAT_LEN {
            return Err(Error::config(format!(
                "read_buffer_size must hold a heartbeat ({} bytes)",
                HEARTBEAT_LEN
            )));
        }
        if self.per_message_deflate && self.transport != TransportKind::WebSocket {
            return Err(Error::config(format!(
                "per_message_deflate requires the websocket transport, not {}",
                self.transport
            )));
        }
        if self.heartbeat_interval_ms > 0
            && self.idle_timeout_ms > 0
            && self.idle_timeout_ms <= self.heartbeat_interval_ms
        {
            return Err(Error::config(
                "idle_timeout_ms must exceed heartbeat_interval_ms",
            ));
        }
        Ok(())
    }

    /// Heartbeat period, if enabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    /// Idle timeout, if enabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }
}
