//! UDP sessions.
//!
//! One socket serves every peer. The first datagram from an unknown address
//! opens a session for it; each datagram is dispatched as one binary payload.
//! A session ends on a local close, on idle timeout or when the socket shuts
//! down. Nothing is sent to the peer on close.

use super::{RawOutbound, SessionSettings, next_tick, sleep_or_pending};
use crate::heartbeat::{self, KeepAlive};
use crate::module::{Dispatcher, Inbound};
use crate::session::{Session, SessionInfo, next_session_id};
use crate::state::{ConnectionStateMachine, TransportKind};
use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type Peers = Arc<DashMap<SocketAddr, mpsc::UnboundedSender<Bytes>>>;

/// Receives datagrams until `shutdown` fires, routing them to per-peer sessions.
pub(crate) async fn serve(
    socket: Arc<UdpSocket>,
    dispatcher: Dispatcher,
    settings: SessionSettings,
    shutdown: CancellationToken,
) {
    let peers: Peers = Arc::new(DashMap::new());
    let mut buf = vec![0u8; settings.read_buffer_size];

    loop {
        let (len, peer_addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    // ICMP errors surface here on some platforms; keep serving.
                    warn!("UDP receive error: {}", e);
                    continue;
                }
            },
        };
        let datagram = Bytes::copy_from_slice(&buf[..len]);

        if let Some(inbound) = peers.get(&peer_addr) {
            if inbound.send(datagram.clone()).is_ok() {
                continue;
            }
        }
        // Unknown peer, or its session just ended.
        peers.remove(&peer_addr);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        if inbound_tx.send(datagram).is_err() {
            continue;
        }
        peers.insert(peer_addr, inbound_tx);
        tokio::spawn(run_peer(
            socket.clone(),
            peer_addr,
            inbound_rx,
            peers.clone(),
            dispatcher.clone(),
            settings,
            shutdown.clone(),
        ));
    }

    // Dropping the senders ends every peer task.
    peers.clear();
    debug!("UDP receive loop stopped");
}

async fn run_peer(
    socket: Arc<UdpSocket>,
    peer_addr: SocketAddr,
    mut inbound: mpsc::UnboundedReceiver<Bytes>,
    peers: Peers,
    dispatcher: Dispatcher,
    settings: SessionSettings,
    shutdown: CancellationToken,
) {
    let state = Arc::new(ConnectionStateMachine::new(TransportKind::Udp));
    if state.begin_connect().and_then(|_| state.mark_connected()).is_err() {
        return;
    }
    let info = SessionInfo::new(next_session_id(TransportKind::Udp), peer_addr, TransportKind::Udp);
    info!("UDP session established: {} from {}", info.id, peer_addr);

    let (session, mut outbound) = Session::child_of(info, state, &shutdown);
    dispatcher.session_started(&session).await;

    let mut keep_alive = KeepAlive::new();
    let mut ticker = settings.heartbeat_ticker();

    loop {
        tokio::select! {
            biased;
            _ = session.cancellation().cancelled() => break,
            datagram = inbound.recv() => {
                let Some(datagram) = datagram else { break };
                dispatcher
                    .dispatch(&session, &mut keep_alive, Inbound::Binary(datagram))
                    .await;
            }
            message = outbound.recv() => {
                let Some(message) = message else { break };
                match RawOutbound::from(message) {
                    RawOutbound::Write(data) => send(&socket, &data, &session).await,
                    RawOutbound::Skip => {}
                    RawOutbound::Close => break,
                }
            }
            _ = next_tick(&mut ticker) => {
                send(&socket, &heartbeat::create_heartbeat_packet(), &session).await;
            }
            _ = sleep_or_pending(settings.idle_remaining(&keep_alive)) => {
                warn!("Session {} idle for {:?}, closing", session.id(), keep_alive.idle_for());
                break;
            }
        }
    }

    // Leave a newer session for the same address in place.
    inbound.close();
    peers.remove_if(&peer_addr, |_, tx| tx.is_closed());
    session.close();
    session.state_machine().mark_closed();
    dispatcher.session_closed(session.id()).await;
}

async fn send(socket: &UdpSocket, data: &[u8], session: &Session) {
    if let Err(e) = socket.send_to(data, session.info().addr).await {
        error!("Failed to send datagram to {}: {}", session.id(), e);
    }
}
