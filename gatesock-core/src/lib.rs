//! # gatesock-core
//!
//! Socket communication substrate for industrial gateways. One process hosts
//! several listening endpoints (TCP, UDP or WebSocket); every accepted peer
//! becomes a [`Session`](session::Session) routed to a
//! [`SessionModule`](module::SessionModule) that implements the gateway logic.
//!
//! ## Overview
//!
//! The crate provides:
//!
//! - a per-connection [state machine](state) that publishes every transition
//! - an RFC 6455 [frame codec](frame) with an [extension chain](extension),
//!   including `permessage-deflate`
//! - an application-level [heartbeat](heartbeat) packet, recognized and
//!   consumed before data reaches modules
//! - a concurrent [session registry](registry) with broadcast
//! - servers, a WebSocket client and a JSON [configuration](config) layer
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Gateway modules                           │
//! │        SessionModule callbacks, Session::send, broadcast     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Dispatcher ── SessionRegistry ── heartbeat interception     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │  WebSocket: handshake ─ FrameCodec ─ ExtensionChain          │
//! │  TCP: byte stream        UDP: datagrams                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                            tokio
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use gatesock_core::prelude::*;
//! use std::sync::Arc;
//!
//! struct Telemetry;
//!
//! #[async_trait]
//! impl SessionModule for Telemetry {
//!     fn name(&self) -> &str {
//!         "telemetry"
//!     }
//!
//!     async fn on_session_binary_received(&self, session: &Session, data: Bytes) {
//!         tracing::info!("{} bytes from {}", data.len(), session.id());
//!     }
//!
//!     async fn on_heartbeat(&self, session: &Session, timestamp_ms: i64) {
//!         tracing::debug!("{} alive at {}", session.id(), timestamp_ms);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let handles = Gateway::new()
//!         .endpoint(GatewayConfig::from_json_file("ws.json")?, Arc::new(Telemetry))
//!         .endpoint(GatewayConfig::from_json_file("udp.json")?, Arc::new(Telemetry))
//!         .launch()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     for handle in handles {
//!         handle.shutdown().await;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Structure
//!
//! - [`state`]: connection lifecycle and transport kinds
//! - [`heartbeat`]: heartbeat packet format and keep-alive tracking
//! - [`frame`], [`codec`]: WebSocket framing
//! - [`extension`]: extension negotiation and `permessage-deflate`
//! - [`handshake`]: HTTP upgrade on both sides
//! - [`message`]: messages exchanged with modules
//! - [`session`], [`registry`], [`module`]: sessions and dispatch
//! - [`config`], [`server`], [`client`]: endpoints

// Enable documentation features for docs.rs
#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod extension;
pub mod frame;
pub mod handshake;
pub mod heartbeat;
pub mod message;
pub mod module;
pub mod registry;
pub mod server;
pub mod session;
pub mod state;
mod transport;

pub use client::{Client, ClientSession};
pub use config::GatewayConfig;
pub use error::{Error, ProtocolError, Result};
pub use message::{Message, MessageType};
pub use module::{Dispatcher, SessionModule};
pub use registry::{BroadcastReport, SessionRegistry};
pub use server::{Gateway, Server, ServerHandle};
pub use session::{Session, SessionId, SessionInfo};
pub use state::{ConnectionState, TransportKind};
pub use transport::SessionSettings;

/// Commonly used types for writing gateway modules.
///
/// ```
/// use gatesock_core::prelude::*;
///
/// struct Silent;
///
/// #[async_trait]
/// impl SessionModule for Silent {
///     fn name(&self) -> &str {
///         "silent"
///     }
/// }
/// ```
pub mod prelude {
    pub use crate::client::{Client, ClientSession};
    pub use crate::config::GatewayConfig;
    pub use crate::error::{Error, Result};
    pub use crate::message::{Message, MessageType};
    pub use crate::module::SessionModule;
    pub use crate::registry::{BroadcastReport, SessionRegistry};
    pub use crate::server::{Gateway, Server, ServerHandle};
    pub use crate::session::{Session, SessionId, SessionInfo};
    pub use crate::state::{ConnectionState, TransportKind};
    pub use async_trait::async_trait;
    pub use bytes::Bytes;
}
