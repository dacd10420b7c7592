//! WebSocket client.
//!
//! A [`Client`] connects out to a gateway endpoint and runs the resulting
//! session through the same module callbacks and heartbeat handling as
//! server-side sessions. Client frames are masked.

use crate::error::{Error, Result};
use crate::extension::{ExtensionFactory, ExtensionNegotiator, PerMessageDeflateFactory};
use crate::frame::{Codec, DEFAULT_MAX_PAYLOAD_LEN, Role};
use crate::handshake::{self, ClientHandshake, DEFAULT_MAX_HANDSHAKE_LEN};
use crate::module::{Dispatcher, SessionModule};
use crate::session::{Session, SessionInfo, next_session_id};
use crate::state::{ConnectionStateMachine, TransportKind};
use crate::transport::{SessionSettings, websocket};
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Outbound WebSocket connector.
pub struct Client {
    negotiator: ExtensionNegotiator,
    settings: SessionSettings,
    max_payload_len: u64,
    max_handshake_len: usize,
}

impl Default for Client {
    fn default() -> Self {
        Self {
            negotiator: ExtensionNegotiator::new(),
            settings: SessionSettings::default(),
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            max_handshake_len: DEFAULT_MAX_HANDSHAKE_LEN,
        }
    }
}

impl Client {
    /// Client with default limits and timers and no extensions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers `permessage-deflate`.
    pub fn with_per_message_deflate(self) -> Self {
        let max = usize::try_from(self.max_payload_len).unwrap_or(usize::MAX);
        self.with_extension(Arc::new(PerMessageDeflateFactory::new(6, max)))
    }

    /// Offers an extension.
    pub fn with_extension(mut self, factory: Arc<dyn ExtensionFactory>) -> Self {
        self.negotiator = self.negotiator.with_factory(factory);
        self
    }

    /// Replaces heartbeat and idle timers.
    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Sets the heartbeat period; `None` disables heartbeats.
    pub fn with_heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.settings.heartbeat_interval = interval;
        self
    }

    /// Sets the idle timeout; `None` disables the check.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.settings.idle_timeout = timeout;
        self
    }

    /// Largest accepted inbound frame payload.
    pub fn with_max_payload_len(mut self, max_payload_len: u64) -> Self {
        self.max_payload_len = max_payload_len;
        self
    }

    /// Connects to `host` (for example `"10.0.0.5:9001"`), upgrades on
    /// `path` and starts routing the session to `module`.
    pub async fn connect(
        &self,
        host: &str,
        path: &str,
        module: Arc<dyn SessionModule>,
    ) -> Result<ClientSession> {
        let state = Arc::new(ConnectionStateMachine::new(TransportKind::WebSocket));
        state.begin_connect()?;

        let (stream, codec, leftover, extensions) = match self.handshake(host, path).await {
            Ok(established) => established,
            Err(e) => {
                state.mark_closed();
                return Err(e);
            }
        };
        state.mark_connected()?;

        let peer_addr = stream.peer_addr()?;
        let info = SessionInfo::new(next_session_id(TransportKind::WebSocket), peer_addr, TransportKind::WebSocket)
            .with_extensions(extensions);
        info!("Connected to {}{} as {}", host, path, info.id);

        let (session, outbound) = Session::new(info, state);
        let dispatcher = Dispatcher::new(module);
        let task = tokio::spawn(websocket::run(
            websocket::framed(stream, codec, leftover),
            session.clone(),
            outbound,
            dispatcher.clone(),
            self.settings,
        ));

        Ok(ClientSession {
            session,
            dispatcher,
            task,
        })
    }

    async fn handshake(
        &self,
        host: &str,
        path: &str,
    ) -> Result<(TcpStream, Codec, BytesMut, Option<String>)> {
        let mut stream = TcpStream::connect(host).await?;
        stream.set_nodelay(true)?;

        let offer = self.negotiator.offer_header();
        let request = ClientHandshake::new(host, path, offer.as_deref())?;
        stream.write_all(&request.request_bytes()).await?;
        debug!("Sent upgrade request to {}", host);

        let mut buf = BytesMut::with_capacity(1024);
        let head_len = handshake::read_head(&mut stream, &mut buf, self.max_handshake_len)
            .await?
            .ok_or_else(|| Error::handshake("response head too large"))?;
        let head = buf.split_to(head_len);

        let extensions = request.verify_response(&head)?;
        let chain = self.negotiator.negotiate_client(extensions.as_deref())?;
        let codec = Codec::new(Role::Client)
            .with_extensions(chain)
            .with_max_payload_len(self.max_payload_len);
        Ok((stream, codec, buf, extensions))
    }
}

/// A connected client session.
pub struct ClientSession {
    session: Session,
    dispatcher: Dispatcher,
    task: JoinHandle<()>,
}

impl ClientSession {
    /// Handle for sending and state inspection.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Module this session is routed to.
    pub fn module(&self) -> &Arc<dyn SessionModule> {
        self.dispatcher.module()
    }

    /// Starts the closing handshake.
    pub fn close(&self) {
        self.session.close();
    }

    /// Waits until the connection is fully closed and the module notified.
    pub async fn closed(self) {
        if let Err(e) = self.task.await {
            debug!("Client session task ended abnormally: {}", e);
        }
    }
}
