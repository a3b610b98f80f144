//! Integration tests for quicore
//!
//! Two connections wired together over an in-memory transport, driven
//! through handshake, stream data, acknowledgment, resend and close.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep, timeout};

use quicore::config::ConnectionConfig;
use quicore::quic::codec::{self, PacketKind};
use quicore::quic::crypto::initial_aead;
use quicore::quic::error::{ConnectionError, QuicError};
use quicore::quic::packet::LongHeader;
use quicore::quic::pipeline::{Context, Direction, Flow, Handler};
use quicore::quic::{
    ChannelListener, Connection, ConnectionId, EncryptionLevel, Frame, ManualClock, Packet, Role, State, StreamEvent,
    StreamId, TransportErrorCode,
};
use quicore::transport::{self, MemoryTransport, Transport};

const WAIT: Duration = Duration::from_secs(5);

fn addrs() -> (SocketAddr, SocketAddr) {
    ("127.0.0.1:40000".parse().unwrap(), "127.0.0.1:4433".parse().unwrap())
}

/// Outbound handler keeping a copy of every packet about to be protected
#[derive(Default)]
struct Recorder {
    packets: Mutex<Vec<Packet>>,
}

#[async_trait]
impl Handler for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    async fn before_send(&self, _ctx: &mut Context, packet: Packet) -> quicore::Result<Flow> {
        self.packets.lock().push(packet.clone());
        Ok(Flow::Next(packet))
    }
}

struct Pair {
    client: Arc<Connection>,
    server: Arc<Connection>,
    server_transport: Arc<MemoryTransport>,
    server_events: UnboundedReceiver<StreamEvent>,
    server_pump: JoinHandle<()>,
}

async fn connected_pair(client_config: ConnectionConfig, client_clock: Option<Arc<ManualClock>>) -> Pair {
    let (client_addr, server_addr) = addrs();
    let (client_transport, server_transport) = MemoryTransport::pair(client_addr, server_addr);

    let mut builder = Connection::client_builder(client_config);
    if let Some(clock) = client_clock {
        builder = builder.clock(clock);
    }
    let client = builder.connect(client_transport.clone()).unwrap();
    transport::pump(client_transport.clone(), client.clone());

    let handshake = tokio::spawn({
        let client = client.clone();
        async move { client.handshake().await }
    });

    let first = timeout(WAIT, server_transport.recv()).await.unwrap().unwrap();
    let (listener, server_events) = ChannelListener::new();
    let server = Connection::server_builder(ConnectionConfig::default())
        .listener(Arc::new(listener))
        .accept(server_transport.clone(), &first)
        .await
        .unwrap();
    let server_pump = transport::pump(server_transport.clone(), server.clone());

    timeout(WAIT, server.handshake()).await.unwrap().unwrap();
    timeout(WAIT, handshake).await.unwrap().unwrap().unwrap();

    Pair { client, server, server_transport, server_events, server_pump }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_handshake_stream_and_ack() {
    let mut pair = connected_pair(ConnectionConfig::default(), None).await;
    assert_eq!(pair.client.state(), State::Done);
    assert_eq!(pair.server.state(), State::Ready);
    assert_eq!(pair.client.remote_cid(), pair.server.local_cid());

    let client_out = Arc::new(Recorder::default());
    let server_out = Arc::new(Recorder::default());
    pair.client.pipeline().add_last(Direction::Outbound, client_out.clone());
    pair.server.pipeline().add_last(Direction::Outbound, server_out.clone());

    let stream = pair.client.open_stream().unwrap();
    assert_eq!(stream.id(), StreamId::new(0));
    stream.write(b"ping", true).await.unwrap();

    let event = timeout(WAIT, pair.server_events.recv()).await.unwrap().unwrap();
    assert_eq!(
        event,
        StreamEvent::Data { stream: StreamId::new(0), data: Bytes::from_static(b"ping"), fin: true }
    );

    let stream_packet = client_out
        .packets
        .lock()
        .iter()
        .find(|p| p.frames().iter().any(|f| matches!(f, Frame::Stream { .. })))
        .and_then(|p| p.number())
        .unwrap()
        .value();

    wait_until(|| {
        server_out.packets.lock().iter().any(|p| {
            p.level() == Some(EncryptionLevel::OneRtt)
                && p.frames().iter().any(|f| match f {
                    Frame::Ack { ranges, .. } => ranges.iter().any(|r| r.contains(stream_packet)),
                    _ => false,
                })
        })
    })
    .await;

    // the ack reaches the client and empties its store
    wait_until(|| !pair.client.reliability().is_outstanding(EncryptionLevel::OneRtt, stream_packet)).await;
    assert!(stream.is_finished().await);
}

#[tokio::test]
async fn test_client_follows_retry() {
    let (client_addr, server_addr) = addrs();
    let (client_transport, harness) = MemoryTransport::pair(client_addr, server_addr);
    let client = Connection::client_builder(ConnectionConfig::default())
        .connect(client_transport.clone())
        .unwrap();
    transport::pump(client_transport.clone(), client.clone());
    let handshake = tokio::spawn({
        let client = client.clone();
        async move { client.handshake().await }
    });

    let first = timeout(WAIT, harness.recv()).await.unwrap().unwrap();
    let half = codec::half_parse(&first, 8).unwrap();
    assert_eq!(half.kind, PacketKind::Initial);
    let original_dcid = half.dcid.clone();
    let client_scid = half.scid.clone().unwrap();
    let hello = half
        .complete(&initial_aead(original_dcid.as_bytes(), Role::Server).unwrap(), None)
        .unwrap();
    assert_eq!(hello.number().unwrap().value(), 0);

    let retry_scid = ConnectionId::random(8).unwrap();
    let retry = codec::retry_packet(
        LongHeader::new(client_scid, retry_scid.clone()),
        Bytes::from_static(b"retry-token"),
        &original_dcid,
    )
    .unwrap();
    let any_keys = initial_aead(original_dcid.as_bytes(), Role::Server).unwrap();
    harness.send(codec::protect(&retry, &any_keys, None).unwrap().freeze()).await.unwrap();

    let second = timeout(WAIT, harness.recv()).await.unwrap().unwrap();
    let half = codec::half_parse(&second, 8).unwrap();
    assert_eq!(half.kind, PacketKind::Initial);
    assert_eq!(half.dcid, retry_scid);
    assert_eq!(half.token(), &Bytes::from_static(b"retry-token"));

    let resent = half
        .complete(&initial_aead(retry_scid.as_bytes(), Role::Server).unwrap(), None)
        .unwrap();
    // the Initial space starts over
    assert_eq!(resent.number().unwrap().value(), 0);
    let crypto = |p: &Packet| p.frames().iter().find(|f| matches!(f, Frame::Crypto { .. })).cloned();
    assert_eq!(crypto(&resent), crypto(&hello));
    assert!(crypto(&resent).is_some());
    assert_eq!(client.state(), State::BeforeHello);

    client.close(TransportErrorCode::NoError, "done").await;
    let result = timeout(WAIT, handshake).await.unwrap().unwrap();
    assert!(result.is_err());
}

#[tokio::test]
async fn test_unacked_frames_are_resent() {
    let clock = Arc::new(ManualClock::new());
    let mut pair = connected_pair(ConnectionConfig::default(), Some(clock.clone())).await;

    // the server stops reading; datagrams queue up in its transport
    pair.server_pump.abort();
    let _ = pair.server_pump.await;

    let before = pair.client.stats().reliability.retransmitted;
    let stream = pair.client.open_stream().unwrap();
    stream.write(b"late", true).await.unwrap();
    assert!(pair.client.reliability().outstanding(EncryptionLevel::OneRtt) >= 1);

    clock.advance(Duration::from_millis(600));
    wait_until(|| pair.client.stats().reliability.retransmitted > before).await;

    transport::pump(pair.server_transport.clone(), pair.server.clone());
    let event = timeout(WAIT, pair.server_events.recv()).await.unwrap().unwrap();
    assert_eq!(
        event,
        StreamEvent::Data { stream: StreamId::new(0), data: Bytes::from_static(b"late"), fin: true }
    );

    // the duplicate copy is not delivered twice
    sleep(Duration::from_millis(50)).await;
    assert!(pair.server_events.try_recv().is_err());
}

#[tokio::test]
async fn test_close_is_idempotent_and_reaches_peer() {
    let pair = connected_pair(ConnectionConfig::default(), None).await;
    let stream = pair.client.open_stream().unwrap();

    pair.client.close(TransportErrorCode::NoError, "bye").await;
    pair.client.close(TransportErrorCode::InternalError, "again").await;
    assert_eq!(pair.client.state(), State::Closed);
    assert_eq!(
        pair.client.close_reason(),
        Some(ConnectionError::LocallyClosed { code: 0, reason: "bye".to_string() })
    );

    let err = stream.write(b"after close", false).await.unwrap_err();
    assert!(matches!(err, QuicError::Connection(ConnectionError::Closed)));
    assert!(!err.is_fatal());

    wait_until(|| pair.server.state() == State::Closed).await;
    assert_eq!(
        pair.server.close_reason(),
        Some(ConnectionError::PeerClosed { code: 0, reason: "bye".to_string() })
    );
}

#[tokio::test]
async fn test_peer_close_gets_no_reply() {
    let pair = connected_pair(ConnectionConfig::default(), None).await;
    wait_until(|| pair.server.reliability().stats().outstanding.iter().sum::<usize>() == 0).await;
    let sent_before = pair.server.stats().packets_sent;

    pair.client.close(TransportErrorCode::NoError, "bye").await;
    wait_until(|| pair.server.state() == State::Closed).await;

    assert_eq!(pair.server.stats().packets_sent, sent_before);
}

#[tokio::test]
async fn test_handshake_timeout() {
    let (client_addr, server_addr) = addrs();
    let (client_transport, _silent) = MemoryTransport::pair(client_addr, server_addr);
    let config = ConnectionConfig { handshake_timeout_ms: 50, ..ConnectionConfig::default() };
    let client = Connection::client_builder(config).connect(client_transport).unwrap();

    let err = timeout(WAIT, client.handshake()).await.unwrap().unwrap_err();
    assert!(matches!(err, QuicError::Connection(ConnectionError::HandshakeTimeout)));
    assert_eq!(client.state(), State::Closed);
}

#[tokio::test]
async fn test_version_negotiation_without_common_version() {
    let (client_addr, server_addr) = addrs();
    let (client_transport, harness) = MemoryTransport::pair(client_addr, server_addr);
    let client = Connection::client_builder(ConnectionConfig::default())
        .connect(client_transport.clone())
        .unwrap();
    transport::pump(client_transport.clone(), client.clone());
    let handshake = tokio::spawn({
        let client = client.clone();
        async move { client.handshake().await }
    });

    let first = timeout(WAIT, harness.recv()).await.unwrap().unwrap();
    let half = codec::half_parse(&first, 8).unwrap();
    let negotiation = Packet::VersionNegotiation {
        dcid: half.scid.clone().unwrap(),
        scid: half.dcid.clone(),
        versions: vec![0xff00_001d],
    };
    let any_keys = initial_aead(half.dcid.as_bytes(), Role::Server).unwrap();
    harness.send(codec::protect(&negotiation, &any_keys, None).unwrap().freeze()).await.unwrap();

    let err = timeout(WAIT, handshake).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, QuicError::Connection(ConnectionError::VersionNegotiation(_))));
    assert_eq!(client.state(), State::Closed);
}

#[tokio::test]
async fn test_stream_before_handshake_is_refused() {
    let (client_addr, server_addr) = addrs();
    let (client_transport, _peer) = MemoryTransport::pair(client_addr, server_addr);
    let client = Connection::client_builder(ConnectionConfig::default())
        .connect(client_transport)
        .unwrap();
    let err = client.open_stream().unwrap_err();
    assert!(matches!(err, QuicError::Connection(ConnectionError::NotReady(_))));
    assert_eq!(client.peer_addr(), server_addr);
}
