//! Listening endpoints.
//!
//! A [`Server`] binds one [`GatewayConfig`] endpoint and feeds every session it
//! accepts to one [`SessionModule`]. [`Gateway`] groups several servers and
//! starts the ones marked `auto_start`.
//!
//! # Examples
//!
//! ```no_run
//! use gatesock_core::prelude::*;
//! use std::sync::Arc;
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
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = GatewayConfig::from_json_str(r#"{ "listen": "0.0.0.0:9001" }"#)?;
//!     Server::new(config, Arc::new(Echo)).listen().await
//! }
//! ```

use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::extension::{ExtensionFactory, ExtensionNegotiator, PerMessageDeflateFactory};
use crate::module::{Dispatcher, SessionModule};
use crate::registry::SessionRegistry;
use crate::state::TransportKind;
use crate::transport::websocket::Acceptor;
use crate::transport::{SessionSettings, tcp, udp, websocket};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// One listening endpoint bound to one module.
pub struct Server {
    config: GatewayConfig,
    dispatcher: Dispatcher,
    negotiator: ExtensionNegotiator,
}

impl Server {
    /// Creates a server for `config`, routing sessions to `module`.
    ///
    /// When `per_message_deflate` is set the deflate extension is offered
    /// to WebSocket clients.
    pub fn new(config: GatewayConfig, module: Arc<dyn SessionModule>) -> Self {
        let mut negotiator = ExtensionNegotiator::new();
        if config.per_message_deflate {
            negotiator = negotiator.with_factory(Arc::new(PerMessageDeflateFactory::new(
                6,
                usize::try_from(config.max_payload_len).unwrap_or(usize::MAX),
            )));
        }
        Self {
            config,
            dispatcher: Dispatcher::new(module),
            negotiator,
        }
    }

    /// Adds an extension WebSocket clients may negotiate.
    pub fn with_extension(mut self, factory: Arc<dyn ExtensionFactory>) -> Self {
        self.negotiator = self.negotiator.with_factory(factory);
        self
    }

    /// Registers sessions in `registry` instead of a private one.
    ///
    /// Modules that broadcast keep a clone of the registry; endpoints that
    /// share one registry broadcast across transports.
    pub fn with_registry(mut self, registry: SessionRegistry) -> Self {
        self.dispatcher = Dispatcher::with_registry(self.dispatcher.module().clone(), registry);
        self
    }

    /// Endpoint settings.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Sessions of this server's module.
    pub fn registry(&self) -> &SessionRegistry {
        self.dispatcher.registry()
    }

    /// Binds the endpoint and starts accepting in the background.
    pub async fn start(self) -> Result<ServerHandle> {
        self.config.validate()?;
        let settings = SessionSettings::from(&self.config);
        let shutdown = CancellationToken::new();
        let registry = self.dispatcher.registry().clone();

        let (local_addr, task) = match self.config.transport {
            TransportKind::WebSocket => {
                let listener = TcpListener::bind(self.config.listen).await?;
                let local_addr = listener.local_addr()?;
                let acceptor = Arc::new(Acceptor {
                    negotiator: self.negotiator,
                    max_payload_len: self.config.max_payload_len,
                    max_handshake_len: self.config.max_handshake_len,
                    settings,
                });
                let task = tokio::spawn(accept_websocket(listener, acceptor, self.dispatcher, shutdown.clone()));
                (local_addr, task)
            }
            TransportKind::Tcp => {
                let listener = TcpListener::bind(self.config.listen).await?;
                let local_addr = listener.local_addr()?;
                let task = tokio::spawn(accept_tcp(listener, self.dispatcher, settings, shutdown.clone()));
                (local_addr, task)
            }
            TransportKind::Udp => {
                let socket = Arc::new(UdpSocket::bind(self.config.listen).await?);
                let local_addr = socket.local_addr()?;
                let task = tokio::spawn(udp::serve(socket, self.dispatcher, settings, shutdown.clone()));
                (local_addr, task)
            }
        };

        info!("{} server listening on {}", self.config.transport, local_addr);
        Ok(ServerHandle {
            local_addr,
            transport: self.config.transport,
            registry,
            shutdown,
            task,
        })
    }

    /// Binds the endpoint and serves until the listener fails.
    pub async fn listen(self) -> Result<()> {
        let handle = self.start().await?;
        handle
            .task
            .await
            .map_err(|e| Error::custom(format!("accept loop panicked: {}", e)))
    }
}

async fn accept_websocket(
    listener: TcpListener,
    acceptor: Arc<Acceptor>,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
) {
    let mut failures: u32 = 0;
    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = accept_backoff(failures);
                    error!("Failed to accept connection: {} (retrying in {:?})", e, delay);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            },
        };
        failures = 0;
        let acceptor = acceptor.clone();
        let dispatcher = dispatcher.clone();
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            if let Err(e) = websocket::accept(stream, peer_addr, acceptor, dispatcher, shutdown).await {
                error!("Connection error from {}: {}", peer_addr, e);
            }
        });
    }
    debug!("WebSocket accept loop stopped");
}

async fn accept_tcp(
    listener: TcpListener,
    dispatcher: Dispatcher,
    settings: SessionSettings,
    shutdown: CancellationToken,
) {
    let mut failures: u32 = 0;
    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = accept_backoff(failures);
                    error!("Failed to accept connection: {} (retrying in {:?})", e, delay);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            },
        };
        failures = 0;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }
        tokio::spawn(tcp::accept(stream, peer_addr, dispatcher.clone(), settings, shutdown.clone()));
    }
    debug!("TCP accept loop stopped");
}

/// Pause after the `failures`-th consecutive accept error.
///
/// Errors such as EMFILE persist until descriptors are released, so the
/// delay doubles from 10ms up to one second.
fn accept_backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(7);
    Duration::from_millis(10 << exponent).min(Duration::from_secs(1))
}

/// A running endpoint.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    transport: TransportKind,
    registry: SessionRegistry,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Address actually bound, useful when listening on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Transport served.
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Sessions of this endpoint's module.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Stops accepting and closes every session this endpoint opened.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            error!("Accept loop for {} ended abnormally: {}", self.local_addr, e);
        }
        info!("{} server on {} stopped", self.transport, self.local_addr);
    }
}

/// A set of endpoints started together.
#[derive(Default)]
pub struct Gateway {
    servers: Vec<Server>,
}

impl Gateway {
    /// Creates an empty gateway.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an endpoint.
    pub fn endpoint(mut self, config: GatewayConfig, module: Arc<dyn SessionModule>) -> Self {
        self.servers.push(Server::new(config, module));
        self
    }

    /// Adds a preconfigured server.
    pub fn server(mut self, server: Server) -> Self {
        self.servers.push(server);
        self
    }

    /// Validates every endpoint, then starts those marked `auto_start`.
    ///
    /// Nothing is bound if any configuration is invalid. Endpoints started
    /// before a bind failure are shut down again.
    pub async fn launch(self) -> Result<Vec<ServerHandle>> {
        for server in &self.servers {
            server.config().validate()?;
        }

        let mut handles = Vec::new();
        for server in self.servers {
            if !server.config().auto_start {
                info!("Skipping {} endpoint {} (auto_start disabled)", server.config().transport, server.config().listen);
                continue;
            }
            match server.start().await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in handles {
                        handle.shutdown().await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Nop;

    #[async_trait]
    impl SessionModule for Nop {
        fn name(&self) -> &str {
            "nop"
        }
    }

    fn local(transport: TransportKind) -> GatewayConfig {
        GatewayConfig::new("127.0.0.1:0".parse().unwrap(), transport)
    }

    #[test]
    fn test_accept_backoff_grows_and_caps() {
        assert_eq!(accept_backoff(1), Duration::from_millis(10));
        assert_eq!(accept_backoff(2), Duration::from_millis(20));
        assert_eq!(accept_backoff(5), Duration::from_millis(160));
        assert_eq!(accept_backoff(8), Duration::from_secs(1));
        assert_eq!(accept_backoff(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_start_binds_each_transport() {
        for transport in [TransportKind::WebSocket, TransportKind::Tcp, TransportKind::Udp] {
            let handle = Server::new(local(transport), Arc::new(Nop)).start().await.unwrap();
            assert_ne!(handle.local_addr().port(), 0);
            assert_eq!(handle.transport(), transport);
            handle.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_invalid_config_is_refused() {
        let mut config = local(TransportKind::Tcp);
        config.per_message_deflate = true;
        let err = Server::new(config, Arc::new(Nop)).start().await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_gateway_skips_manual_endpoints() {
        let mut manual = local(TransportKind::Udp);
        manual.auto_start = false;
        let handles = Gateway::new()
            .endpoint(local(TransportKind::WebSocket), Arc::new(Nop))
            .endpoint(manual, Arc::new(Nop))
            .launch()
            .await
            .unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].transport(), TransportKind::WebSocket);
        for handle in handles {
            handle.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_gateway_validates_before_binding() {
        let mut bad = local(TransportKind::Tcp);
        bad.max_payload_len = 0;
        let err = Gateway::new()
            .endpoint(local(TransportKind::WebSocket), Arc::new(Nop))
            .endpoint(bad, Arc::new(Nop))
            .launch()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
