//! Application modules and event dispatch.
//!
//! A [`SessionModule`] is the application's view of the gateway: it is told
//! when sessions start and stop and receives their decoded payloads. Every
//! callback has a no-op default, so a module only overrides what it needs.
//!
//! The [`Dispatcher`] pairs one module with its [`SessionRegistry`] and is
//! what the transports drive. It keeps registry bookkeeping and callbacks in
//! step (insert before `on_session_started`, remove before
//! `on_session_closed`) and diverts heartbeat packets away from the module's
//! data callbacks.
//!
//! # Examples
//!
//! ```
//! use async_trait::async_trait;
//! use bytes::Bytes;
//! use gatesock_core::module::SessionModule;
//! use gatesock_core::session::Session;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl SessionModule for Echo {
//!     fn name(&self) -> &str {
//!         "echo"
//!     }
//!
//!     async fn on_session_text_received(&self, session: &Session, text: &str) {
//!         let _ = session.send_text(text);
//!     }
//!
//!     async fn on_session_binary_received(&self, session: &Session, data: Bytes) {
//!         let _ = session.send_binary(data);
//!     }
//! }
//! ```

use crate::frame::FragmentPosition;
use crate::heartbeat::{self, HEARTBEAT_LEN, KeepAlive};
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionId};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info};

/// Callbacks an application module implements.
#[async_trait]
pub trait SessionModule: Send + Sync + 'static {
    /// Display name used in logs.
    fn name(&self) -> &str;

    /// A session was opened and registered.
    async fn on_session_started(&self, _session: &Session) {}

    /// A complete text message arrived.
    async fn on_session_text_received(&self, _session: &Session, _text: &str) {}

    /// A complete binary message (or raw TCP/UDP payload) arrived.
    async fn on_session_binary_received(&self, _session: &Session, _data: Bytes) {}

    /// The session closed and was removed from the registry.
    ///
    /// Called exactly once per session.
    async fn on_session_closed(&self, _session: &Session) {}

    /// First frame of a fragmented message.
    async fn on_fragment_stream_opened(&self, _session: &Session, _payload: Bytes) {}

    /// Intermediate frame of a fragmented message.
    async fn on_fragment_stream_continued(&self, _session: &Session, _payload: Bytes) {}

    /// Final frame of a fragmented message.
    async fn on_fragment_stream_closed(&self, _session: &Session, _payload: Bytes) {}

    /// A heartbeat packet arrived carrying the peer's epoch milliseconds.
    async fn on_heartbeat(&self, _session: &Session, _timestamp_ms: i64) {}
}

/// A decoded inbound payload, ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Complete text message, valid UTF-8
    Text(Bytes),
    /// Complete binary message or raw datagram/stream chunk
    Binary(Bytes),
    /// One frame of a fragmented message
    Fragment(FragmentPosition, Bytes),
}

/// Routes one module's session events.
#[derive(Clone)]
pub struct Dispatcher {
    module: Arc<dyn SessionModule>,
    registry: SessionRegistry,
}

impl Dispatcher {
    /// Dispatcher with a fresh registry.
    pub fn new(module: Arc<dyn SessionModule>) -> Self {
        Self::with_registry(module, SessionRegistry::new())
    }

    /// Dispatcher sharing an existing registry.
    pub fn with_registry(module: Arc<dyn SessionModule>, registry: SessionRegistry) -> Self {
        Self { module, registry }
    }

    /// The module events are routed to.
    pub fn module(&self) -> &Arc<dyn SessionModule> {
        &self.module
    }

    /// Sessions of this module.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Registers the session, then notifies the module.
    pub async fn session_started(&self, session: &Session) {
        self.registry.insert(session.clone());
        info!("[{}] Session started: {}", self.module.name(), session.id());
        self.module.on_session_started(session).await;
    }

    /// Unregisters the session, then notifies the module.
    ///
    /// Returns `false` and calls nothing when the session was already
    /// removed, so duplicate close events collapse into one callback.
    pub async fn session_closed(&self, id: &SessionId) -> bool {
        let Some(session) = self.registry.remove(id) else {
            debug!("[{}] Duplicate close for {}", self.module.name(), id);
            return false;
        };
        info!("[{}] Session closed: {}", self.module.name(), id);
        self.module.on_session_closed(&session).await;
        true
    }

    /// Delivers one inbound payload.
    ///
    /// Binary and fragment payloads that start with a valid heartbeat packet
    /// go to keep-alive bookkeeping and [`SessionModule::on_heartbeat`]; any
    /// bytes following the packet are dispatched as ordinary data. A fragment
    /// that was nothing but a heartbeat reaches its stream callback empty.
    pub async fn dispatch(&self, session: &Session, keep_alive: &mut KeepAlive, inbound: Inbound) {
        match inbound {
            Inbound::Text(data) => {
                keep_alive.touch();
                match std::str::from_utf8(&data) {
                    Ok(text) => self.module.on_session_text_received(session, text).await,
                    Err(_) => self.module.on_session_binary_received(session, data).await,
                }
            }
            Inbound::Binary(data) => {
                let Some(rest) = self.intercept_heartbeat(session, keep_alive, data).await else {
                    return;
                };
                self.module.on_session_binary_received(session, rest).await;
            }
            Inbound::Fragment(position, payload) => {
                // The stream callbacks still fire so opened/closed stay paired.
                let payload = self
                    .intercept_heartbeat(session, keep_alive, payload)
                    .await
                    .unwrap_or_default();
                match position {
                    FragmentPosition::First => {
                        self.module.on_fragment_stream_opened(session, payload).await
                    }
                    FragmentPosition::Middle => {
                        self.module.on_fragment_stream_continued(session, payload).await
                    }
                    FragmentPosition::Last => {
                        self.module.on_fragment_stream_closed(session, payload).await
                    }
                }
            }
        }
    }

    /// Returns the payload left for the module, if any.
    async fn intercept_heartbeat(
        &self,
        session: &Session,
        keep_alive: &mut KeepAlive,
        data: Bytes,
    ) -> Option<Bytes> {
        if data.len() < HEARTBEAT_LEN || !heartbeat::is_heartbeat_packet(&data) {
            keep_alive.touch();
            return Some(data);
        }

        if let Some(timestamp) = keep_alive.record_heartbeat(&data) {
            debug!("[{}] Heartbeat from {} ({})", self.module.name(), session.id(), timestamp);
            self.module.on_heartbeat(session, timestamp).await;
        }
        let rest = data.slice(HEARTBEAT_LEN..);
        (!rest.is_empty()).then_some(rest)
    }
}
