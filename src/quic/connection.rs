//! QUIC connection
//!
//! A [`Connection`] ties the codec, the state machine, the reliability
//! engine and the handler pipeline together. It owns the send path (one
//! packet at a time under an async send lock), the receive path (one call
//! per datagram), the periodic timer driving resends and timeouts, and the
//! single teardown routine every close converges on.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::ConnectionConfig;
use crate::quic::clock::{Clock, SystemClock};
use crate::quic::codec::{self, HalfParsed, PacketKind};
use crate::quic::crypto;
use crate::quic::error::{ConnectionError, CryptoError, PacketError, QuicError, Result, TransportErrorCode};
use crate::quic::flow_control::{FlowControlHandler, FlowControlStats, FlowController};
use crate::quic::frame::{Frame, Payload};
use crate::quic::packet::{ConnectionId, EncryptionLevel, Packet};
use crate::quic::pipeline::{ConnectionFacts, Context, Direction, Effects, Pipeline};
use crate::quic::reliability::{Reliability, ReliabilityHandler, ReliabilityStats};
use crate::quic::state::{Role, State, StateEvent, StateMachine};
use crate::quic::stream::{FrameSink, SendStream, StreamHandler, StreamId, StreamListener};
use crate::tls::{LoopbackTls, TlsHandler, TlsSession};
use crate::transport::Transport;

/// Where the handshake stands, as seen by `Connection::handshake`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStatus {
    Pending,
    Complete,
    Failed(ConnectionError),
}

/// QUIC connection statistics
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub state: State,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_discarded: u64,
    pub streams_opened: u64,
    pub reliability: ReliabilityStats,
    pub flow_control: FlowControlStats,
}

#[derive(Debug, Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    packets_discarded: AtomicU64,
}

#[derive(Debug)]
struct Ids {
    local: ConnectionId,
    remote: ConnectionId,
    /// Client: the first destination id it chose. Server: the id the
    /// client's first Initial was sent to.
    original_dcid: ConnectionId,
    /// Retry token echoed in every later client Initial
    token: Bytes,
    /// Client has switched to the server-chosen id
    remote_confirmed: bool,
    retried: bool,
}

/// Builder for both ends of a connection
pub struct ConnectionBuilder {
    role: Role,
    config: ConnectionConfig,
    listener: Option<Arc<dyn StreamListener>>,
    clock: Arc<dyn Clock>,
    session: Option<Box<dyn TlsSession>>,
}

impl ConnectionBuilder {
    fn new(role: Role, config: ConnectionConfig) -> Self {
        Self { role, config, listener: None, clock: Arc::new(SystemClock), session: None }
    }

    /// Receiver for incoming stream data
    pub fn listener(mut self, listener: Arc<dyn StreamListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use `session` instead of the built-in loopback handshake
    pub fn tls(mut self, session: Box<dyn TlsSession>) -> Self {
        self.session = Some(session);
        self
    }

    /// Create a client connection. The handshake starts on
    /// [`Connection::handshake`].
    pub fn connect(self, transport: Arc<dyn Transport>) -> Result<Arc<Connection>> {
        if self.role != Role::Client {
            return Err(QuicError::Config("connect needs a client builder".to_string()));
        }
        let remote = ConnectionId::random(8)?;
        let ids = Ids {
            local: ConnectionId::random(self.config.local_cid_len)?,
            remote: remote.clone(),
            original_dcid: remote.clone(),
            token: Bytes::new(),
            remote_confirmed: false,
            retried: false,
        };
        let session = match self.session {
            Some(session) => session,
            None => Box::new(LoopbackTls::client(&remote)?),
        };
        Connection::build(self.role, self.config, ids, session, self.listener, self.clock, transport)
    }

    /// Create a server connection from the datagram carrying the client's
    /// first Initial packet, then process that datagram
    pub async fn accept(self, transport: Arc<dyn Transport>, first_datagram: &[u8]) -> Result<Arc<Connection>> {
        if self.role != Role::Server {
            return Err(QuicError::Config("accept needs a server builder".to_string()));
        }
        let half = codec::half_parse(first_datagram, self.config.local_cid_len)?;
        let client_scid = match (half.kind, half.scid) {
            (PacketKind::Initial, Some(scid)) => scid,
            _ => return Err(PacketError::InvalidHeader("first packet is not an Initial".to_string()).into()),
        };
        let ids = Ids {
            local: ConnectionId::random(self.config.local_cid_len)?,
            remote: client_scid,
            original_dcid: half.dcid.clone(),
            token: Bytes::new(),
            remote_confirmed: true,
            retried: false,
        };
        let session = match self.session {
            Some(session) => session,
            None => Box::new(LoopbackTls::server(&half.dcid)?),
        };
        let connection = Connection::build(self.role, self.config, ids, session, self.listener, self.clock, transport)?;
        connection.receive(first_datagram).await;
        Ok(connection)
    }
}

/// Listener used when the caller did not install one
struct DiscardListener;

impl StreamListener for DiscardListener {
    fn on_data(&self, stream: StreamId, data: Bytes, fin: bool) {
        debug!("no listener, dropping {} bytes on stream {} (fin {})", data.len(), stream, fin);
    }
}

pub struct Connection {
    role: Role,
    config: ConnectionConfig,
    state: Arc<StateMachine>,
    pipeline: Pipeline,
    reliability: Arc<Reliability>,
    flow: Arc<FlowController>,
    tls: Arc<TlsHandler>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    ids: Mutex<Ids>,
    send_lock: tokio::sync::Mutex<()>,
    handshake_tx: watch::Sender<HandshakeStatus>,
    timer: Mutex<Option<JoinHandle<()>>>,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    close_reason: Mutex<Option<ConnectionError>>,
    next_bidi: AtomicU64,
    next_uni: AtomicU64,
    counters: Counters,
}

impl Connection {
    pub fn client_builder(config: ConnectionConfig) -> ConnectionBuilder {
        ConnectionBuilder::new(Role::Client, config)
    }

    pub fn server_builder(config: ConnectionConfig) -> ConnectionBuilder {
        ConnectionBuilder::new(Role::Server, config)
    }

    fn build(
        role: Role,
        config: ConnectionConfig,
        ids: Ids,
        session: Box<dyn TlsSession>,
        listener: Option<Arc<dyn StreamListener>>,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| QuicError::Config(format!("connection needs a tokio runtime: {}", e)))?;

        let state = Arc::new(StateMachine::new(role));
        let reliability = Arc::new(Reliability::new(
            clock.clone(),
            config.ack_delay_exponent,
            config.resend_threshold(),
        ));
        let flow = Arc::new(FlowController::new(config.flow_control()));
        let tls = Arc::new(TlsHandler::new(Arc::new(Mutex::new(session)), state.clone()));
        let listener = listener.unwrap_or_else(|| Arc::new(DiscardListener));

        let pipeline = Pipeline::new();
        pipeline.add_last(Direction::Inbound, Arc::new(ReliabilityHandler::new(reliability.clone())));
        pipeline.add_last(Direction::Inbound, tls.clone());
        pipeline.add_last(Direction::Inbound, Arc::new(FlowControlHandler::new(flow.clone())));
        pipeline.add_last(Direction::Inbound, Arc::new(StreamHandler::new(role, listener)));
        pipeline.add_last(Direction::Outbound, Arc::new(FlowControlHandler::new(flow.clone())));
        pipeline.add_last(Direction::Outbound, Arc::new(ReliabilityHandler::new(reliability.clone())));

        let now = clock.now();
        let (handshake_tx, _) = watch::channel(HandshakeStatus::Pending);
        let connection = Arc::new(Self {
            role,
            config,
            state,
            pipeline,
            reliability,
            flow,
            tls,
            transport,
            clock,
            ids: Mutex::new(ids),
            send_lock: tokio::sync::Mutex::new(()),
            handshake_tx,
            timer: Mutex::new(None),
            created_at: now,
            last_activity: Mutex::new(now),
            close_reason: Mutex::new(None),
            next_bidi: AtomicU64::new(0),
            next_uni: AtomicU64::new(0),
            counters: Counters::default(),
        });

        let timer = runtime.spawn(Self::run_timer(Arc::downgrade(&connection), connection.config.timer_interval()));
        *connection.timer.lock() = Some(timer);

        info!(
            "{} connection created, local {} remote {}",
            role,
            connection.local_cid(),
            connection.remote_cid()
        );
        Ok(connection)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> State {
        self.state.state()
    }

    pub fn local_cid(&self) -> ConnectionId {
        self.ids.lock().local.clone()
    }

    pub fn remote_cid(&self) -> ConnectionId {
        self.ids.lock().remote.clone()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.transport.peer_addr()
    }

    /// The handler chains, for installing extra handlers
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn reliability(&self) -> &Arc<Reliability> {
        &self.reliability
    }

    /// Why the connection closed, once it has
    pub fn close_reason(&self) -> Option<ConnectionError> {
        self.close_reason.lock().clone()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            state: self.state(),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            packets_received: self.counters.packets_received.load(Ordering::Relaxed),
            packets_discarded: self.counters.packets_discarded.load(Ordering::Relaxed),
            streams_opened: self.next_bidi.load(Ordering::Relaxed) + self.next_uni.load(Ordering::Relaxed),
            reliability: self.reliability.stats(),
            flow_control: self.flow.connection_stats(),
        }
    }

    fn facts(&self) -> ConnectionFacts {
        ConnectionFacts {
            role: self.role,
            peer_addr: self.transport.peer_addr(),
            version: self.config.version,
            state: self.state(),
        }
    }

    /// Run the handshake to completion.
    ///
    /// A client sends its first flight on the first call. Resolves once the
    /// connection reaches Done (client) or Ready (server), and fails if it
    /// closes first or the handshake timeout passes.
    pub async fn handshake(&self) -> Result<()> {
        if self.role == Role::Client && self.state() == State::Started {
            let flights = self.tls.start()?;
            self.state.transition(StateEvent::HelloSent)?;
            for (level, frames) in flights {
                self.send_frames(level, frames).await?;
            }
        }

        let mut rx = self.handshake_tx.subscribe();
        let status = rx
            .wait_for(|status| *status != HandshakeStatus::Pending)
            .await
            .map_err(|_| ConnectionError::Closed)?
            .clone();
        match status {
            HandshakeStatus::Failed(e) => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Open the next locally initiated bidirectional stream
    pub fn open_stream(self: &Arc<Self>) -> Result<SendStream> {
        self.open(true)
    }

    /// Open the next locally initiated unidirectional stream
    pub fn open_uni_stream(self: &Arc<Self>) -> Result<SendStream> {
        self.open(false)
    }

    fn open(self: &Arc<Self>, bidirectional: bool) -> Result<SendStream> {
        let state = self.state();
        if !state.is_established() {
            return Err(ConnectionError::NotReady(format!("cannot open a stream while {:?}", state)).into());
        }
        let counter = if bidirectional { &self.next_bidi } else { &self.next_uni };
        let id = StreamId::nth(self.role, bidirectional, counter.fetch_add(1, Ordering::Relaxed));
        debug!("{} opened stream {}", self.role, id);
        let sink: Arc<dyn FrameSink> = self.clone();
        Ok(SendStream::new(id, sink, self.flow.clone()))
    }

    /// Send a PING, eliciting an acknowledgment
    pub async fn ping(&self) -> Result<()> {
        self.send_frames(EncryptionLevel::OneRtt, vec![Frame::Ping]).await
    }

    /// Close the connection, telling the peer why. Closing an already
    /// closed connection does nothing.
    pub async fn close(&self, code: TransportErrorCode, reason: &str) {
        let error = ConnectionError::LocallyClosed { code: code.to_u64(), reason: reason.to_string() };
        self.teardown(code, reason, true, error).await;
    }

    /// Process one datagram from the peer. Bad packets are discarded; a
    /// protocol violation closes the connection.
    pub async fn receive(&self, datagram: &[u8]) {
        if self.state().is_closing_or_closed() {
            trace!("{} ignoring datagram while {:?}", self.role, self.state());
            return;
        }
        *self.last_activity.lock() = self.clock.now();
        self.counters.bytes_received.fetch_add(datagram.len() as u64, Ordering::Relaxed);

        let short_dcid_len = self.config.local_cid_len;
        for half in codec::split(datagram, short_dcid_len) {
            let half = match half {
                Ok(half) => half,
                Err(e) => {
                    warn!("{} dropping rest of datagram: {}", self.role, e);
                    self.counters.packets_discarded.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            };
            if let Err(e) = self.receive_packet(&half).await {
                if e.is_fatal() {
                    warn!("{} protocol violation: {}", self.role, e);
                    self.fail(e).await;
                    return;
                }
                debug!("{} discarding {:?} packet: {}", self.role, half.kind, e);
                self.counters.packets_discarded.fetch_add(1, Ordering::Relaxed);
            }
            if self.state().is_closing_or_closed() {
                return;
            }
        }
    }

    fn is_local_dcid(&self, dcid: &ConnectionId) -> bool {
        let ids = self.ids.lock();
        *dcid == ids.local || (self.role == Role::Server && *dcid == ids.original_dcid)
    }

    async fn receive_packet(&self, half: &HalfParsed<'_>) -> Result<()> {
        if !self.is_local_dcid(&half.dcid) {
            return Err(PacketError::InvalidHeader(format!("unknown destination id {}", half.dcid)).into());
        }
        let level = match half.kind {
            PacketKind::VersionNegotiation => return self.on_version_negotiation(half).await,
            PacketKind::Retry => return self.on_retry(half).await,
            kind => kind.level().ok_or_else(|| PacketError::InvalidHeader(format!("{:?}", kind)))?,
        };

        let aead = self
            .tls
            .session()
            .lock()
            .aead_for(level)
            .ok_or(CryptoError::KeysUnavailable(level))?;
        let packet = half.complete(aead.as_ref(), self.reliability.largest_received(level))?;
        self.counters.packets_received.fetch_add(1, Ordering::Relaxed);
        debug!(
            "{} received {} packet {:?} with {} frames",
            self.role,
            level,
            packet.number().map(|n| n.value()),
            packet.frames().len()
        );

        for frame in packet.frames() {
            self.state.check_frame(frame, level)?;
        }
        self.adopt_remote_cid(&packet);

        if let Some(Frame::ConnectionClose { error_code, reason_phrase, .. }) =
            packet.frames().iter().find(|frame| matches!(frame, Frame::ConnectionClose { .. }))
        {
            info!("{} closed by peer: code 0x{:x} {}", self.role, error_code, reason_phrase);
            let error = ConnectionError::PeerClosed { code: *error_code, reason: reason_phrase.clone() };
            self.teardown(TransportErrorCode::from_u64(*error_code), reason_phrase, false, error).await;
            return Ok(());
        }

        let mut ctx = Context::new(self.facts());
        self.pipeline.run_inbound(&mut ctx, packet).await?;
        self.apply_effects(ctx.into_effects()).await
    }

    /// Client: switch to the id the server chose, on its first long header
    fn adopt_remote_cid(&self, packet: &Packet) {
        if self.role != Role::Client {
            return;
        }
        let Some(scid) = packet.scid() else { return };
        let mut ids = self.ids.lock();
        if !ids.remote_confirmed {
            debug!("client adopting server id {}", scid);
            ids.remote = scid.clone();
            ids.remote_confirmed = true;
        }
    }

    async fn on_retry(&self, half: &HalfParsed<'_>) -> Result<()> {
        let (original_dcid, retried) = {
            let ids = self.ids.lock();
            (ids.original_dcid.clone(), ids.retried || ids.remote_confirmed)
        };
        if self.role != Role::Client || self.state() != State::BeforeHello || retried {
            debug!("{} ignoring Retry while {:?}", self.role, self.state());
            return Ok(());
        }
        crypto::verify_retry_integrity(original_dcid.as_bytes(), half.as_bytes())?;
        let (header, token) = match half.decode_unprotected()? {
            Packet::Retry { header, token, .. } if !token.is_empty() => (header, token),
            _ => return Err(PacketError::InvalidHeader("Retry without token".to_string()).into()),
        };

        info!("client accepted Retry, new destination id {}", header.scid);
        self.state.retry()?;
        self.tls.session().lock().on_retry(&header.scid)?;
        {
            let mut ids = self.ids.lock();
            ids.remote = header.scid.clone();
            ids.token = token;
            ids.retried = true;
        }

        let frames = self.reliability.take_all(EncryptionLevel::Initial);
        self.reliability.discard_level(EncryptionLevel::Initial);
        if frames.is_empty() {
            return Ok(());
        }
        self.send_frames(EncryptionLevel::Initial, frames).await
    }

    async fn on_version_negotiation(&self, half: &HalfParsed<'_>) -> Result<()> {
        if self.role != Role::Client || self.state() != State::BeforeHello {
            debug!("{} ignoring Version Negotiation while {:?}", self.role, self.state());
            return Ok(());
        }
        let Packet::VersionNegotiation { versions, .. } = half.decode_unprotected()? else {
            return Ok(());
        };
        if versions.contains(&self.config.version) {
            debug!("Version Negotiation lists our version, ignoring");
            return Ok(());
        }
        warn!("no common version with peer, offered {:?}", versions);
        let error = ConnectionError::VersionNegotiation(versions);
        self.teardown(TransportErrorCode::NoError, "version negotiation", false, error).await;
        Ok(())
    }

    async fn apply_effects(&self, effects: Effects) -> Result<()> {
        if let Some(close) = effects.close {
            let error = ConnectionError::LocallyClosed { code: close.code.to_u64(), reason: close.reason.clone() };
            self.teardown(close.code, &close.reason, true, error).await;
            return Ok(());
        }

        for (level, frames) in effects.sends {
            self.send_frames(level, frames).await?;
        }

        if let Some(level) = effects.ack_flush {
            // frames sent above may already have carried the acks
            if let Some(ack) = self.reliability.drain_ack_frame(level) {
                self.send_frames(level, vec![ack]).await?;
            }
        }

        self.on_progress();
        Ok(())
    }

    /// Discard keys the handshake has moved past and wake `handshake()`
    fn on_progress(&self) {
        let state = self.state();
        let discard: &[EncryptionLevel] = match (self.role, state) {
            (Role::Client, State::BeforeDone) => &[EncryptionLevel::Initial],
            (Role::Client, State::Done) | (Role::Server, State::Ready) => {
                &[EncryptionLevel::Initial, EncryptionLevel::Handshake]
            }
            _ => &[],
        };
        for level in discard {
            let had_keys = {
                let mut session = self.tls.session().lock();
                let had = session.is_available(*level);
                session.discard(*level);
                had
            };
            if had_keys {
                self.reliability.discard_level(*level);
            }
        }

        if state.is_established() {
            self.handshake_tx.send_if_modified(|status| {
                if *status == HandshakeStatus::Pending {
                    info!("{} handshake complete", self.role);
                    *status = HandshakeStatus::Complete;
                    true
                } else {
                    false
                }
            });
        }
    }

    /// Build, protect and send one packet carrying `frames` at `level`,
    /// returning the effects requested by the outbound chain
    async fn transmit(&self, level: EncryptionLevel, frames: Vec<Frame>) -> Result<Effects> {
        let payload = Payload::new(frames)?;
        let _guard = self.send_lock.lock().await;

        let aead = self
            .tls
            .session()
            .lock()
            .aead_for(level)
            .ok_or(CryptoError::KeysUnavailable(level))?;
        let number = self.state.next_packet_number(level)?;
        let (dcid, scid, token) = {
            let ids = self.ids.lock();
            let token = if level == EncryptionLevel::Initial { ids.token.clone() } else { Bytes::new() };
            (ids.remote.clone(), ids.local.clone(), token)
        };
        let packet = Packet::at_level(level, dcid, scid, token, number, payload);

        let mut ctx = Context::new(self.facts());
        let Some(packet) = self.pipeline.run_outbound(&mut ctx, packet).await? else {
            return Ok(ctx.into_effects());
        };
        let bytes = codec::protect(&packet, aead.as_ref(), self.reliability.largest_acked(level))?;
        let len = bytes.len();
        if let Err(e) = self.transport.send(bytes.freeze()).await {
            error!("{} transport send failed: {}", self.role, e);
            return Err(e);
        }
        self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
        debug!("{} sent {} packet {} ({} bytes)", self.role, level, number.value(), len);
        Ok(ctx.into_effects())
    }

    async fn run_timer(connection: Weak<Connection>, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(connection) = connection.upgrade() else { break };
            if connection.state() == State::Closed {
                break;
            }
            connection.on_timer().await;
        }
    }

    /// One timer tick: timeouts first, then due resends
    pub async fn on_timer(&self) {
        if self.state().is_closing_or_closed() {
            return;
        }
        let now = self.clock.now();

        let idle = now.saturating_duration_since(*self.last_activity.lock());
        if idle >= self.config.idle_timeout() {
            info!("{} idle for {:?}, closing", self.role, idle);
            self.teardown(TransportErrorCode::NoError, "idle timeout", false, ConnectionError::IdleTimeout)
                .await;
            return;
        }

        if !self.state().is_established()
            && now.saturating_duration_since(self.created_at) >= self.config.handshake_timeout()
        {
            warn!("{} handshake did not complete in {:?}", self.role, self.config.handshake_timeout());
            self.teardown(TransportErrorCode::NoError, "handshake timeout", true, ConnectionError::HandshakeTimeout)
                .await;
            return;
        }

        for (level, frames) in self.reliability.take_due() {
            if let Err(e) = self.send_frames(level, frames).await {
                debug!("{} resend at {} failed: {}", self.role, level, e);
            }
        }
    }

    async fn fail(&self, error: QuicError) {
        let code = error.transport_code();
        let reason = error.to_string();
        let closed = ConnectionError::LocallyClosed { code: code.to_u64(), reason: reason.clone() };
        self.teardown(code, &reason, true, closed).await;
    }

    /// The one way a connection ends. Only the first caller does anything.
    async fn teardown(&self, code: TransportErrorCode, reason: &str, notify_peer: bool, error: ConnectionError) {
        if !self.state.begin_close() {
            return;
        }
        info!("{} closing: {} ({})", self.role, code, reason);
        *self.close_reason.lock() = Some(error.clone());
        self.handshake_tx.send_if_modified(|status| {
            if *status == HandshakeStatus::Pending {
                *status = HandshakeStatus::Failed(error);
                true
            } else {
                false
            }
        });

        if notify_peer {
            let level = {
                let session = self.tls.session().lock();
                [EncryptionLevel::OneRtt, EncryptionLevel::Handshake, EncryptionLevel::Initial]
                    .into_iter()
                    .find(|level| session.is_available(*level))
            };
            if let Some(level) = level {
                let frame = Frame::ConnectionClose {
                    error_code: code.to_u64(),
                    frame_type: Some(0),
                    reason_phrase: reason.to_string(),
                };
                if let Err(e) = self.transmit(level, vec![frame]).await {
                    warn!("{} could not send close frame: {}", self.role, e);
                }
            }
        }

        if let Err(e) = self.state.transition(StateEvent::Drained) {
            error!("{} teardown: {}", self.role, e);
        }
        self.transport.close().await;
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }
}

#[async_trait]
impl FrameSink for Connection {
    /// Send `frames` in one packet at `level`; fails once closing has begun
    async fn send_frames(&self, level: EncryptionLevel, frames: Vec<Frame>) -> Result<()> {
        if self.state().is_closing_or_closed() {
            return Err(ConnectionError::Closed.into());
        }
        let effects = self.transmit(level, frames).await?;
        if effects.close.is_some() || !effects.sends.is_empty() {
            self.apply_effects(effects).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("state", &self.state())
            .field("ids", &*self.ids.lock())
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.abort();
        }
    }
}
