//! Raw TCP sessions.
//!
//! TCP has no framing of its own, so every read is dispatched as one binary
//! chunk. There is no closing handshake: a local close shuts the socket down
//! immediately.

use super::{CLOSE_TIMEOUT, RawOutbound, SessionSettings, next_tick, sleep_or_pending};
use crate::heartbeat::{self, KeepAlive};
use crate::message::Message;
use crate::module::{Dispatcher, Inbound};
use crate::session::{Session, SessionInfo, next_session_id};
use crate::state::{ConnectionStateMachine, TransportKind};
use bytes::{Bytes, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{BytesCodec, Framed};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type ChunkSink<S> = SplitSink<Framed<S, BytesCodec>, Bytes>;
type ChunkStream<S> = SplitStream<Framed<S, BytesCodec>>;

/// Opens a session on an accepted stream and runs it to completion.
pub(crate) async fn accept<S>(
    stream: S,
    peer_addr: SocketAddr,
    dispatcher: Dispatcher,
    settings: SessionSettings,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let state = Arc::new(ConnectionStateMachine::new(TransportKind::Tcp));
    if state.begin_connect().and_then(|_| state.mark_connected()).is_err() {
        return;
    }
    let info = SessionInfo::new(next_session_id(TransportKind::Tcp), peer_addr, TransportKind::Tcp);
    info!("TCP connection established: {} from {}", info.id, peer_addr);

    let (session, outbound) = Session::child_of(info, state, &shutdown);
    let framed = Framed::with_capacity(stream, BytesCodec::new(), settings.read_buffer_size);
    let (sink, chunks) = framed.split();

    dispatcher.session_started(&session).await;

    let mut write_task = tokio::spawn(write_loop(sink, outbound, session.clone(), settings));
    let mut read_task = tokio::spawn(read_loop(chunks, session.clone(), dispatcher.clone(), settings));

    tokio::select! {
        _ = &mut write_task => {
            // The peer gets no more data, so stop reading too.
            read_task.abort();
        }
        _ = &mut read_task => {
            session.cancellation().cancel();
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut write_task).await.is_err() {
                write_task.abort();
            }
        }
    }

    session.cancellation().cancel();
    session.state_machine().mark_closed();
    dispatcher.session_closed(session.id()).await;
}

async fn write_loop<S>(
    mut sink: ChunkSink<S>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    session: Session,
    settings: SessionSettings,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ticker = settings.heartbeat_ticker();

    let result: std::io::Result<()> = async {
        loop {
            tokio::select! {
                biased;
                _ = session.cancellation().cancelled() => break,
                message = outbound.recv() => {
                    let Some(message) = message else { break };
                    match RawOutbound::from(message) {
                        RawOutbound::Write(data) => sink.send(data).await?,
                        RawOutbound::Skip => {}
                        RawOutbound::Close => {
                            session.close();
                            break;
                        }
                    }
                }
                _ = next_tick(&mut ticker) => {
                    let packet = heartbeat::create_heartbeat_packet();
                    sink.send(Bytes::copy_from_slice(&packet)).await?;
                }
            }
        }
        sink.close().await
    }
    .await;

    if let Err(e) = result {
        warn!("Failed to write to {}: {}", session.id(), e);
    }
    debug!("Write task ended for {}", session.id());
}

async fn read_loop<S>(mut chunks: ChunkStream<S>, session: Session, dispatcher: Dispatcher, settings: SessionSettings)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut keep_alive = KeepAlive::new();

    loop {
        let chunk: BytesMut = tokio::select! {
            chunk = chunks.next() => match chunk {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    warn!("TCP read error for {}: {}", session.id(), e);
                    break;
                }
                None => {
                    debug!("Connection closed by {}", session.id());
                    break;
                }
            },
            _ = session.cancellation().cancelled() => break,
            _ = sleep_or_pending(settings.idle_remaining(&keep_alive)) => {
                warn!("Session {} idle for {:?}, closing", session.id(), keep_alive.idle_for());
                session.close();
                break;
            }
        };

        dispatcher
            .dispatch(&session, &mut keep_alive, Inbound::Binary(chunk.freeze()))
            .await;
    }
}
