//! WebSocket session loop, shared by the server and client roles.

use super::{CLOSE_TIMEOUT, SessionSettings, next_tick, sleep_or_pending};
use crate::codec::FrameCodec;
use crate::error::{Error, Result};
use crate::extension::ExtensionNegotiator;
use crate::frame::{CloseCode, CloseFrame, Codec, Frame, Role};
use crate::handshake::{self, UpgradeRequest};
use crate::heartbeat::{self, KeepAlive};
use crate::message::Message;
use crate::module::{Dispatcher, Inbound};
use crate::session::{Session, SessionInfo, next_session_id};
use crate::state::{ConnectionState, ConnectionStateMachine, TransportKind};
use bytes::{Bytes, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::StatusCode;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::{Framed, FramedParts};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Longest close reason that fits a control frame.
const MAX_CLOSE_REASON: usize = 123;

type FrameSink<S> = SplitSink<Framed<S, FrameCodec>, Frame>;
type FrameStream<S> = SplitStream<Framed<S, FrameCodec>>;

/// Server-side parameters for accepting upgrades.
pub(crate) struct Acceptor {
    pub negotiator: ExtensionNegotiator,
    pub max_payload_len: u64,
    pub max_handshake_len: usize,
    pub settings: SessionSettings,
}

/// Performs the server handshake on an accepted TCP stream, then runs the
/// session until it closes.
pub(crate) async fn accept(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    acceptor: Arc<Acceptor>,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
) -> Result<()> {
    let state = Arc::new(ConnectionStateMachine::new(TransportKind::WebSocket));
    state.begin_connect()?;

    let mut buf = BytesMut::with_capacity(1024);
    let head_len = match tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        handshake::read_head(&mut stream, &mut buf, acceptor.max_handshake_len),
    )
    .await
    {
        Ok(Ok(Some(len))) => len,
        Ok(Ok(None)) => {
            state.mark_closed();
            let response = handshake::reject_bytes(
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                "request head too large",
            );
            stream.write_all(&response).await?;
            return Err(Error::handshake(format!(
                "request head from {} exceeds {} bytes",
                peer_addr, acceptor.max_handshake_len
            )));
        }
        Ok(Err(e)) => {
            state.mark_closed();
            return Err(e);
        }
        Err(_) => {
            state.mark_closed();
            return Err(Error::handshake(format!("handshake with {} timed out", peer_addr)));
        }
    };

    let head = buf.split_to(head_len);
    let upgrade = UpgradeRequest::parse(&head).and_then(|request| {
        let negotiation = acceptor
            .negotiator
            .negotiate_server(request.extensions().as_deref())?;
        Ok((request, negotiation))
    });
    let (request, negotiation) = match upgrade {
        Ok(upgrade) => upgrade,
        Err(e) => {
            state.mark_closed();
            let response = handshake::reject_bytes(StatusCode::BAD_REQUEST, &e.to_string());
            stream.write_all(&response).await?;
            return Err(e);
        }
    };

    stream
        .write_all(&request.response_bytes(negotiation.response.as_deref())?)
        .await?;
    state.mark_connected()?;

    let codec = Codec::new(Role::Server)
        .with_extensions(negotiation.chain)
        .with_max_payload_len(acceptor.max_payload_len);
    let info = SessionInfo::new(next_session_id(TransportKind::WebSocket), peer_addr, TransportKind::WebSocket)
        .with_extensions(negotiation.response);
    info!(
        "WebSocket connection established: {} from {} (path {})",
        info.id,
        peer_addr,
        request.path()
    );

    let (session, outbound) = Session::child_of(info, state, &shutdown);
    run(framed(stream, codec, buf), session, outbound, dispatcher, acceptor.settings).await;
    Ok(())
}

/// Builds the frame stream, keeping bytes that arrived with the handshake.
pub(crate) fn framed<S>(io: S, codec: Codec, leftover: BytesMut) -> Framed<S, FrameCodec>
where
    S: AsyncRead + AsyncWrite,
{
    let mut parts = FramedParts::new::<Frame>(io, FrameCodec::new(codec));
    parts.read_buf = leftover;
    Framed::from_parts(parts)
}

/// Runs an established session until either side closes it.
pub(crate) async fn run<S>(
    framed: Framed<S, FrameCodec>,
    session: Session,
    outbound: mpsc::UnboundedReceiver<Message>,
    dispatcher: Dispatcher,
    settings: SessionSettings,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = framed.split();
    let (control_tx, control_rx) = mpsc::unbounded_channel::<Frame>();

    dispatcher.session_started(&session).await;

    let mut write_task = tokio::spawn(write_loop(sink, outbound, control_rx, session.clone(), settings));
    let mut read_task = tokio::spawn(read_loop(stream, control_tx, session.clone(), dispatcher.clone(), settings));

    // Wait for either task to complete, then give the other one a bounded
    // grace period to flush or receive the closing frames.
    tokio::select! {
        _ = &mut write_task => {
            debug!("Write task finished first for {}", session.id());
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut read_task).await.is_err() {
                read_task.abort();
            }
        }
        _ = &mut read_task => {
            debug!("Read task finished first for {}", session.id());
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
    mut sink: FrameSink<S>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    mut control: mpsc::UnboundedReceiver<Frame>,
    session: Session,
    settings: SessionSettings,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("Write task started for {}", session.id());
    let mut ticker = settings.heartbeat_ticker();

    let result: Result<()> = async {
        loop {
            tokio::select! {
                biased;
                frame = control.recv() => match frame {
                    Some(frame) => {
                        let closing = matches!(frame, Frame::Close(_));
                        sink.send(frame).await?;
                        if closing {
                            break;
                        }
                    }
                    // The reader is gone and left nothing to flush.
                    None => break,
                },
                _ = session.cancellation().cancelled() => {
                    // Server shutdown cancels without going through close().
                    let _ = session.state_machine().begin_closing();
                    sink.send(Frame::close(CloseCode::Normal, "")).await?;
                    break;
                }
                message = outbound.recv() => match message {
                    Some(message) => {
                        let closing = message.is_close();
                        sink.send(message.into_frame()).await?;
                        if closing {
                            session.close();
                            break;
                        }
                    }
                    None => break,
                },
                _ = next_tick(&mut ticker) => {
                    let packet = heartbeat::create_heartbeat_packet();
                    debug!("Sending heartbeat to {}", session.id());
                    sink.send(Frame::Binary(Bytes::copy_from_slice(&packet))).await?;
                }
            }
        }
        sink.flush().await
    }
    .await;

    if let Err(e) = result {
        warn!("Failed to write to {}: {}", session.id(), e);
    }
    debug!("Write task ended for {}", session.id());
}

async fn read_loop<S>(
    mut stream: FrameStream<S>,
    control: mpsc::UnboundedSender<Frame>,
    session: Session,
    dispatcher: Dispatcher,
    settings: SessionSettings,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("Read task started for {}", session.id());
    let state = session.state_machine().clone();
    let mut keep_alive = KeepAlive::new();
    let mut close_deadline: Option<Instant> = None;

    loop {
        let wait = match close_deadline {
            Some(deadline) => Some(deadline.saturating_duration_since(Instant::now())),
            None => settings.idle_remaining(&keep_alive),
        };

        let next = tokio::select! {
            next = stream.next() => next,
            _ = session.cancellation().cancelled(), if close_deadline.is_none() => {
                // Keep reading until the peer answers our close frame.
                close_deadline = Some(Instant::now() + CLOSE_TIMEOUT);
                continue;
            }
            _ = sleep_or_pending(wait) => {
                if close_deadline.is_some() {
                    debug!("Close handshake with {} timed out", session.id());
                    break;
                }
                warn!("Session {} idle for {:?}, closing", session.id(), keep_alive.idle_for());
                let _ = state.begin_closing();
                let _ = control.send(Frame::close(CloseCode::Away, "idle timeout"));
                close_deadline = Some(Instant::now() + CLOSE_TIMEOUT);
                continue;
            }
        };

        let frame = match next {
            None => {
                debug!("Connection closed by {}", session.id());
                break;
            }
            Some(Err(Error::Protocol(violation))) => {
                warn!("Protocol violation from {}: {}", session.id(), violation);
                let _ = state.begin_closing();
                let reason = violation.to_string();
                let _ = control.send(Frame::close(violation.close_code(), truncate_reason(&reason)));
                break;
            }
            Some(Err(e)) => {
                warn!("WebSocket error for {}: {}", session.id(), e);
                break;
            }
            Some(Ok(frame)) => frame,
        };

        match frame {
            Frame::Ping(data) => {
                keep_alive.touch();
                let _ = control.send(Frame::Pong(data));
            }
            Frame::Pong(_) => keep_alive.touch(),
            Frame::Close(close) => {
                info!("Close frame received from {}: {:?}", session.id(), close);
                if state.state() == ConnectionState::Open {
                    let _ = state.begin_closing();
                    let reply = close.map(|close| CloseFrame::new(close.code, ""));
                    let _ = control.send(Frame::Close(reply));
                }
                break;
            }
            _ if !state.is_open() => debug!("Dropping data from closing session {}", session.id()),
            Frame::Text(data) => dispatcher.dispatch(&session, &mut keep_alive, Inbound::Text(data)).await,
            Frame::Binary(data) => {
                dispatcher
                    .dispatch(&session, &mut keep_alive, Inbound::Binary(data))
                    .await
            }
            Frame::BinaryFragment { position, payload } => {
                dispatcher
                    .dispatch(&session, &mut keep_alive, Inbound::Fragment(position, payload))
                    .await
            }
        }
    }

    debug!("Read task ended for {}", session.id());
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
