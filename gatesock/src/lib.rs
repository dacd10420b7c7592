//! # gatesock
//!
//! Socket communication substrate for industrial gateways: TCP, UDP and
//! WebSocket endpoints, heartbeat keep-alive, extension-aware WebSocket
//! framing and broadcast to live sessions.
//!
//! This crate re-exports [`gatesock_core`]. Depend on it and import the
//! prelude:
//!
//! ```no_run
//! use gatesock::prelude::*;
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
//!     let config = GatewayConfig::new("0.0.0.0:9001".parse().unwrap(), TransportKind::WebSocket);
//!     Server::new(config, Arc::new(Echo)).listen().await
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export everything from gatesock-core
pub use gatesock_core::*;

/// Prelude module for convenient imports.
///
/// - **Endpoints**: `Gateway`, `Server`, `ServerHandle`, `Client`, `GatewayConfig`
/// - **Sessions**: `Session`, `SessionModule`, `SessionRegistry`, `BroadcastReport`
/// - **Messages**: `Message`, `MessageType`, `Bytes`
/// - **Errors**: `Error`, `Result`
pub mod prelude {
    pub use gatesock_core::prelude::*;
}
