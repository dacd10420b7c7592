//! End-to-end tests over real sockets.

use futures_util::{SinkExt, StreamExt};
use gatesock_core::heartbeat;
use gatesock_core::prelude::*;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Echoes data, broadcasts `/all ...` and reports heartbeats.
struct Echo {
    sessions: SessionRegistry,
    heartbeats: mpsc::UnboundedSender<i64>,
}

#[async_trait]
impl SessionModule for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    async fn on_session_text_received(&self, session: &Session, text: &str) {
        match text.strip_prefix("/all ") {
            Some(rest) => {
                self.sessions.broadcast_text(rest);
            }
            None => {
                let _ = session.send_text(text);
            }
        }
    }

    async fn on_session_binary_received(&self, session: &Session, data: Bytes) {
        let _ = session.send_binary(data);
    }

    async fn on_heartbeat(&self, _session: &Session, timestamp_ms: i64) {
        let _ = self.heartbeats.send(timestamp_ms);
    }
}

/// Forwards everything a client session receives.
struct Inbox {
    received: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl SessionModule for Inbox {
    fn name(&self) -> &str {
        "inbox"
    }

    async fn on_session_text_received(&self, _session: &Session, text: &str) {
        let _ = self.received.send(Message::text(text));
    }

    async fn on_session_binary_received(&self, _session: &Session, data: Bytes) {
        let _ = self.received.send(Message::binary(data));
    }
}

struct Fixture {
    handle: ServerHandle,
    heartbeats: mpsc::UnboundedReceiver<i64>,
}

impl Fixture {
    fn addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    fn registry(&self) -> &SessionRegistry {
        self.handle.registry()
    }
}

fn config(transport: TransportKind) -> GatewayConfig {
    let mut config = GatewayConfig::new("127.0.0.1:0".parse().unwrap(), transport);
    config.heartbeat_interval_ms = 0;
    config.idle_timeout_ms = 0;
    config
}

async fn start(config: GatewayConfig) -> Fixture {
    let sessions = SessionRegistry::new();
    let (tx, heartbeats) = mpsc::unbounded_channel();
    let module = Arc::new(Echo {
        sessions: sessions.clone(),
        heartbeats: tx,
    });
    let handle = Server::new(config, module)
        .with_registry(sessions)
        .start()
        .await
        .unwrap();
    Fixture { handle, heartbeats }
}

async fn wait_for_count(registry: &SessionRegistry, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while registry.count() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("expected {} sessions, have {}", expected, registry.count()));
}

async fn raw_upgrade(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"GET /raw HTTP/1.1\r\n\
              Host: localhost\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap();

    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        head.push(stream.read_u8().await.unwrap());
    }
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("HTTP/1.1 101"), "{}", head);
    assert!(head.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    stream
}

#[tokio::test]
async fn test_tungstenite_client_echo() {
    let fixture = start(config(TransportKind::WebSocket)).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/echo", fixture.addr()))
        .await
        .unwrap();
    wait_for_count(fixture.registry(), 1).await;

    ws.send(WsMessage::Text("hello".into())).await.unwrap();
    assert_eq!(ws.next().await.unwrap().unwrap(), WsMessage::Text("hello".into()));

    ws.send(WsMessage::Binary(vec![1, 2, 3])).await.unwrap();
    assert_eq!(ws.next().await.unwrap().unwrap(), WsMessage::Binary(vec![1, 2, 3]));

    // Large enough for the 64-bit length form.
    let big = vec![7u8; 70_000];
    ws.send(WsMessage::Binary(big.clone())).await.unwrap();
    assert_eq!(ws.next().await.unwrap().unwrap(), WsMessage::Binary(big));

    ws.close(None).await.unwrap();
    wait_for_count(fixture.registry(), 0).await;
    fixture.handle.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_is_consumed_by_gateway() {
    let mut fixture = start(config(TransportKind::WebSocket)).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/", fixture.addr()))
        .await
        .unwrap();

    let packet = heartbeat::create_heartbeat_packet_at(1_700_000_000_000);
    ws.send(WsMessage::Binary(packet.to_vec())).await.unwrap();
    ws.send(WsMessage::Text("after".into())).await.unwrap();

    // Only the text comes back; the heartbeat never reached the echo.
    assert_eq!(ws.next().await.unwrap().unwrap(), WsMessage::Text("after".into()));
    assert_eq!(fixture.heartbeats.recv().await, Some(1_700_000_000_000));

    ws.close(None).await.unwrap();
    fixture.handle.shutdown().await;
}

#[tokio::test]
async fn test_server_sends_heartbeats() {
    let mut config = config(TransportKind::WebSocket);
    config.heartbeat_interval_ms = 20;
    let fixture = start(config).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/", fixture.addr()))
        .await
        .unwrap();

    match ws.next().await.unwrap().unwrap() {
        WsMessage::Binary(data) => {
            assert!(heartbeat::is_heartbeat_packet(&data));
            assert!(heartbeat::extract_timestamp(&data).unwrap() > 0);
        }
        other => panic!("expected heartbeat, got {:?}", other),
    }
    fixture.handle.shutdown().await;
}

#[tokio::test]
async fn test_reserved_bit_violation_closes_only_offender() {
    let fixture = start(config(TransportKind::WebSocket)).await;
    let (mut good, _) = tokio_tungstenite::connect_async(format!("ws://{}/", fixture.addr()))
        .await
        .unwrap();
    let mut bad = raw_upgrade(fixture.addr()).await;
    wait_for_count(fixture.registry(), 2).await;

    // Masked, empty text frame with RSV1 set; nothing was negotiated.
    bad.write_all(&[0xC1, 0x80, 0, 0, 0, 0]).await.unwrap();

    let mut reply = [0u8; 4];
    bad.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x88);
    assert_eq!(u16::from_be_bytes([reply[2], reply[3]]), 1002);

    wait_for_count(fixture.registry(), 1).await;
    good.send(WsMessage::Text("still here".into())).await.unwrap();
    assert_eq!(good.next().await.unwrap().unwrap(), WsMessage::Text("still here".into()));
    fixture.handle.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_reaches_every_session() {
    let fixture = start(config(TransportKind::WebSocket)).await;
    let url = format!("ws://{}/", fixture.addr());
    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(tokio_tungstenite::connect_async(url.as_str()).await.unwrap().0);
    }
    wait_for_count(fixture.registry(), 3).await;

    clients[0].send(WsMessage::Text("/all valve 3 open".into())).await.unwrap();
    for client in &mut clients {
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            WsMessage::Text("valve 3 open".into())
        );
    }
    fixture.handle.shutdown().await;
}

#[tokio::test]
async fn test_malformed_upgrade_is_rejected() {
    let fixture = start(config(TransportKind::WebSocket)).await;
    let mut stream = TcpStream::connect(fixture.addr()).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 400"), "{}", response);
    assert_eq!(fixture.registry().count(), 0);
    fixture.handle.shutdown().await;
}

#[tokio::test]
async fn test_oversized_upgrade_is_rejected() {
    let mut config = config(TransportKind::WebSocket);
    config.max_handshake_len = 256;
    let fixture = start(config).await;

    let mut request = String::from("GET / HTTP/1.1\r\nHost: localhost\r\n");
    request.push_str(&format!("X-Padding: {}\r\n\r\n", "a".repeat(400)));
    let mut stream = TcpStream::connect(fixture.addr()).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 431"), "{}", response);
    fixture.handle.shutdown().await;
}

#[tokio::test]
async fn test_client_negotiates_deflate() {
    let mut config = config(TransportKind::WebSocket);
    config.per_message_deflate = true;
    let fixture = start(config).await;

    let (tx, mut received) = mpsc::unbounded_channel();
    let client = Client::new()
        .with_heartbeat_interval(None)
        .with_idle_timeout(None)
        .with_per_message_deflate()
        .connect(&fixture.addr().to_string(), "/deflate", Arc::new(Inbox { received: tx }))
        .await
        .unwrap();

    let extensions = client.session().info().extensions.clone().unwrap();
    assert!(extensions.starts_with("permessage-deflate"), "{}", extensions);

    let report = "temperature=21.5;".repeat(500);
    client.session().send_text(report.as_str()).unwrap();
    assert_eq!(received.recv().await.unwrap().as_text(), Some(report.as_str()));

    client.session().send_binary(vec![0u8; 4096]).unwrap();
    assert_eq!(received.recv().await.unwrap().as_bytes(), &[0u8; 4096][..]);

    client.close();
    client.closed().await;
    wait_for_count(fixture.registry(), 0).await;
    fixture.handle.shutdown().await;
}

#[tokio::test]
async fn test_client_heartbeats_reach_server() {
    let mut fixture = start(config(TransportKind::WebSocket)).await;
    let (tx, _received) = mpsc::unbounded_channel();
    let client = Client::new()
        .with_heartbeat_interval(Some(Duration::from_millis(20)))
        .with_idle_timeout(None)
        .connect(&fixture.addr().to_string(), "/", Arc::new(Inbox { received: tx }))
        .await
        .unwrap();

    assert!(fixture.heartbeats.recv().await.unwrap() > 0);
    assert_eq!(client.session().state(), ConnectionState::Open);

    client.close();
    client.closed().await;
    fixture.handle.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_sessions() {
    let fixture = start(config(TransportKind::WebSocket)).await;
    let (tx, _received) = mpsc::unbounded_channel();
    let client = Client::new()
        .with_heartbeat_interval(None)
        .with_idle_timeout(None)
        .connect(&fixture.addr().to_string(), "/", Arc::new(Inbox { received: tx }))
        .await
        .unwrap();
    wait_for_count(fixture.registry(), 1).await;

    let registry = fixture.registry().clone();
    fixture.handle.shutdown().await;
    wait_for_count(&registry, 0).await;

    let mut states = client.session().subscribe_state();
    states.wait_for(|s| *s == ConnectionState::Closed).await.unwrap();
    client.closed().await;
}

#[tokio::test]
async fn test_tcp_echo_and_heartbeat() {
    let mut fixture = start(config(TransportKind::Tcp)).await;
    let mut stream = TcpStream::connect(fixture.addr()).await.unwrap();

    stream.write_all(b"\x01\x03\x00\x00\x00\x0a").await.unwrap();
    let mut buf = [0u8; 6];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"\x01\x03\x00\x00\x00\x0a");

    stream
        .write_all(&heartbeat::create_heartbeat_packet_at(99))
        .await
        .unwrap();
    assert_eq!(fixture.heartbeats.recv().await, Some(99));

    drop(stream);
    wait_for_count(fixture.registry(), 0).await;
    fixture.handle.shutdown().await;
}

#[tokio::test]
async fn test_udp_sessions_per_peer() {
    let mut fixture = start(config(TransportKind::Udp)).await;
    let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    first.connect(fixture.addr()).await.unwrap();
    second.connect(fixture.addr()).await.unwrap();

    let mut buf = [0u8; 64];
    first.send(b"one").await.unwrap();
    let len = first.recv(&mut buf).await.unwrap();
    assert_eq!(&buf[..len], b"one");

    second.send(b"two").await.unwrap();
    let len = second.recv(&mut buf).await.unwrap();
    assert_eq!(&buf[..len], b"two");
    wait_for_count(fixture.registry(), 2).await;

    first.send(&heartbeat::create_heartbeat_packet_at(3)).await.unwrap();
    assert_eq!(fixture.heartbeats.recv().await, Some(3));

    let registry = fixture.registry().clone();
    fixture.handle.shutdown().await;
    wait_for_count(&registry, 0).await;
}

#[tokio::test]
async fn test_udp_idle_sessions_expire() {
    let mut config = config(TransportKind::Udp);
    config.idle_timeout_ms = 300;
    let fixture = start(config).await;
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    peer.send_to(b"hi", fixture.addr()).await.unwrap();
    wait_for_count(fixture.registry(), 1).await;
    wait_for_count(fixture.registry(), 0).await;
    fixture.handle.shutdown().await;
}
