//! Echo gateway serving WebSocket, TCP and UDP at once.
//!
//! Text starting with `/all ` is broadcast to every session on any transport;
//! everything else is echoed back to the sender. Pass a JSON file holding an
//! array of endpoint configurations to override the defaults.

use gatesock::prelude::*;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

struct Echo {
    sessions: SessionRegistry,
}

#[async_trait]
impl SessionModule for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    async fn on_session_started(&self, session: &Session) {
        tracing::info!(
            "✅ {} connected over {} from {}",
            session.id(),
            session.info().transport,
            session.info().addr
        );
    }

    async fn on_session_text_received(&self, session: &Session, text: &str) {
        if let Some(announcement) = text.strip_prefix("/all ") {
            let report = self
                .sessions
                .broadcast_text(format!("{}: {}", session.id(), announcement));
            tracing::info!("Broadcast reached {} sessions", report.delivered);
            return;
        }
        if let Err(e) = session.send_text(text) {
            tracing::warn!("Echo to {} failed: {}", session.id(), e);
        }
    }

    async fn on_session_binary_received(&self, session: &Session, data: Bytes) {
        if let Err(e) = session.send_binary(data) {
            tracing::warn!("Echo to {} failed: {}", session.id(), e);
        }
    }

    async fn on_heartbeat(&self, session: &Session, timestamp_ms: i64) {
        tracing::debug!("💓 {} at {}", session.id(), timestamp_ms);
    }

    async fn on_session_closed(&self, session: &Session) {
        tracing::info!("❌ {} disconnected", session.id());
    }
}

fn default_endpoints() -> Vec<GatewayConfig> {
    let mut websocket = GatewayConfig::new(([127, 0, 0, 1], 8080).into(), TransportKind::WebSocket);
    websocket.per_message_deflate = true;
    vec![
        websocket,
        GatewayConfig::new(([127, 0, 0, 1], 8081).into(), TransportKind::Tcp),
        GatewayConfig::new(([127, 0, 0, 1], 8082).into(), TransportKind::Udp),
    ]
}

fn load_endpoints() -> Result<Vec<GatewayConfig>> {
    let Some(path) = std::env::args().nth(1) else {
        return Ok(default_endpoints());
    };
    let json = std::fs::read_to_string(&path)?;
    let endpoints: Vec<GatewayConfig> = serde_json::from_str(&json)?;
    Ok(endpoints)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let sessions = SessionRegistry::new();
    let module = Arc::new(Echo {
        sessions: sessions.clone(),
    });

    let mut gateway = Gateway::new();
    for config in load_endpoints()? {
        gateway = gateway.server(Server::new(config, module.clone()).with_registry(sessions.clone()));
    }
    let handles = gateway.launch().await?;
    for handle in &handles {
        println!("🚀 {} endpoint on {}", handle.transport(), handle.local_addr());
    }

    tokio::signal::ctrl_c().await?;
    println!("Shutting down gracefully...");
    for handle in handles {
        handle.shutdown().await;
    }
    Ok(())
}
