//! TLS integration for the QUIC handshake
//!
//! The connection core does not speak TLS itself. A [`TlsSession`] consumes
//! handshake bytes per encryption level, produces the bytes to send back and
//! installs packet protection keys as the handshake advances. [`TlsHandler`]
//! plugs a session into the inbound pipeline: it reassembles CRYPTO frames,
//! feeds the session and turns its progress into state transitions.

pub mod loopback;

pub use loopback::LoopbackTls;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::quic::crypto::Aead;
use crate::quic::error::{QuicError, Result, TransportErrorCode};
use crate::quic::frame::Frame;
use crate::quic::packet::{ConnectionId, EncryptionLevel, Packet};
use crate::quic::pipeline::{Context, Flow, Handler};
use crate::quic::state::{Role, State, StateEvent, StateMachine};
use crate::quic::stream::RecvBuffer;

/// CRYPTO_ERROR carrying the TLS `handshake_failure` alert
pub const HANDSHAKE_FAILURE: TransportErrorCode = TransportErrorCode::Other(0x0128);

/// Handshake progress reported by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeEvent {
    /// Handshake level keys are installed
    HandshakeKeysReady,
    /// Client: our Finished is part of this output
    FinishedSent,
    /// Server: the client's Finished verified
    HandshakeConfirmed,
}

/// What one step of the handshake produced
#[derive(Debug, Default)]
pub struct TlsOutput {
    /// Handshake bytes to send, in order, per level
    pub crypto: Vec<(EncryptionLevel, Bytes)>,
    pub events: Vec<HandshakeEvent>,
}

/// A TLS 1.3 handshake driven by the connection
pub trait TlsSession: Send + Sync {
    fn role(&self) -> Role;

    /// Produce the first flight. Only clients have one.
    fn start(&mut self) -> Result<TlsOutput>;

    /// Consume in-order handshake bytes received at `level`
    fn on_crypto(&mut self, level: EncryptionLevel, data: &[u8]) -> Result<TlsOutput>;

    /// Whether packet protection keys are installed for `level`
    fn is_available(&self, level: EncryptionLevel) -> bool {
        self.aead_for(level).is_some()
    }

    fn aead_for(&self, level: EncryptionLevel) -> Option<Arc<dyn Aead>>;

    /// Drop the keys of `level`; packets at that level can no longer be sent
    /// or opened
    fn discard(&mut self, level: EncryptionLevel);

    /// Re-key Initial protection after a Retry moved us to `new_dcid`
    fn on_retry(&mut self, new_dcid: &ConnectionId) -> Result<()>;

    fn is_complete(&self) -> bool;
}

/// Shared handle to the connection's session
pub type SharedSession = Arc<Mutex<Box<dyn TlsSession>>>;

/// Inbound handler routing CRYPTO and HANDSHAKE_DONE frames
pub struct TlsHandler {
    session: SharedSession,
    state: Arc<StateMachine>,
    received: [Mutex<RecvBuffer>; 3],
    send_offsets: Mutex<[u64; 3]>,
}

impl TlsHandler {
    pub fn new(session: SharedSession, state: Arc<StateMachine>) -> Self {
        Self {
            session,
            state,
            received: Default::default(),
            send_offsets: Mutex::new([0; 3]),
        }
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    /// Run the session's first flight and frame it for sending
    pub fn start(&self) -> Result<Vec<(EncryptionLevel, Vec<Frame>)>> {
        let output = self.session.lock().start()?;
        Ok(self.crypto_frames(output.crypto))
    }

    /// Wrap handshake bytes in CRYPTO frames at the next offsets of each level
    fn crypto_frames(&self, crypto: Vec<(EncryptionLevel, Bytes)>) -> Vec<(EncryptionLevel, Vec<Frame>)> {
        let mut offsets = self.send_offsets.lock();
        crypto
            .into_iter()
            .filter(|(_, data)| !data.is_empty())
            .map(|(level, data)| {
                let offset = &mut offsets[level.index()];
                let frame = Frame::Crypto { offset: *offset, data: data.clone() };
                *offset += data.len() as u64;
                (level, vec![frame])
            })
            .collect()
    }

    fn apply_event(&self, ctx: &mut Context, event: HandshakeEvent) -> Result<()> {
        match event {
            HandshakeEvent::HandshakeKeysReady => {
                self.state.transition(StateEvent::HandshakeKeys)?;
            }
            HandshakeEvent::FinishedSent => {
                self.state.transition(StateEvent::FinishedSent)?;
            }
            HandshakeEvent::HandshakeConfirmed => {
                self.state.transition(StateEvent::HandshakeConfirmed)?;
                ctx.send(EncryptionLevel::OneRtt, vec![Frame::HandshakeDone]);
            }
        }
        Ok(())
    }

    fn on_crypto(&self, ctx: &mut Context, level: EncryptionLevel, offset: u64, data: Bytes) -> Result<()> {
        if self.state.role() == Role::Server && self.state.state() == State::Started {
            self.state.transition(StateEvent::HelloReceived)?;
        }

        let chunks = self.received[level.index()].lock().push(offset, data, false);
        for (chunk, _) in chunks {
            let output = match self.session.lock().on_crypto(level, &chunk) {
                Ok(output) => output,
                Err(QuicError::Crypto(e)) => {
                    warn!("handshake failed at {}: {}", level, e);
                    ctx.close(HANDSHAKE_FAILURE, e.to_string());
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            for (send_level, frames) in self.crypto_frames(output.crypto) {
                ctx.send(send_level, frames);
            }
            for event in output.events {
                debug!("{} handshake event {:?}", self.state.role(), event);
                self.apply_event(ctx, event)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for TlsHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsHandler")
            .field("role", &self.state.role())
            .field("send_offsets", &*self.send_offsets.lock())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Handler for TlsHandler {
    fn name(&self) -> &'static str {
        "tls"
    }

    async fn on_receive(&self, ctx: &mut Context, packet: Packet) -> Result<Flow> {
        let level = packet.level();
        for frame in packet.frames() {
            match frame {
                Frame::Crypto { offset, data } => {
                    let Some(level) = level else { continue };
                    self.on_crypto(ctx, level, *offset, data.clone())?;
                }
                // a retransmitted HANDSHAKE_DONE after Done is harmless
                Frame::HandshakeDone if self.state.state() != State::Done => {
                    self.state.transition(StateEvent::HandshakeDone)?;
                }
                _ => {}
            }
            if ctx.close_requested() {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Next(packet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quic::frame::Payload;
    use crate::quic::number::PacketNumber;
    use crate::quic::pipeline::ConnectionFacts;

    fn facts(role: Role, state: State) -> ConnectionFacts {
        ConnectionFacts {
            role,
            peer_addr: "127.0.0.1:4433".parse().unwrap(),
            version: crate::quic::packet::QUIC_VERSION_1,
            state,
        }
    }

    fn packet(level: EncryptionLevel, frames: Vec<Frame>) -> Packet {
        let dcid = ConnectionId::random(8).unwrap();
        let scid = ConnectionId::random(8).unwrap();
        Packet::at_level(level, dcid, scid, Bytes::new(), PacketNumber::ZERO, Payload::new(frames).unwrap())
    }

    fn handler(role: Role, dcid: &ConnectionId) -> TlsHandler {
        let session: Box<dyn TlsSession> = match role {
            Role::Client => Box::new(LoopbackTls::client(dcid).unwrap()),
            Role::Server => Box::new(LoopbackTls::server(dcid).unwrap()),
        };
        TlsHandler::new(Arc::new(Mutex::new(session)), Arc::new(StateMachine::new(role)))
    }

    /// Feed every frame of `sends` to `to` and return what it wants to send
    async fn deliver(to: &TlsHandler, role: Role, sends: Vec<(EncryptionLevel, Vec<Frame>)>) -> Vec<(EncryptionLevel, Vec<Frame>)> {
        let mut out = Vec::new();
        for (level, frames) in sends {
            let mut ctx = Context::new(facts(role, to.state.state()));
            let flow = to.on_receive(&mut ctx, packet(level, frames)).await.unwrap();
            assert!(matches!(flow, Flow::Next(_)));
            let effects = ctx.into_effects();
            assert!(effects.close.is_none());
            out.extend(effects.sends);
        }
        out
    }

    #[tokio::test]
    async fn test_handshake_drives_both_state_machines() {
        let dcid = ConnectionId::random(8).unwrap();
        let client = handler(Role::Client, &dcid);
        let server = handler(Role::Server, &dcid);

        let hello = client.start().unwrap();
        client.state.transition(StateEvent::HelloSent).unwrap();
        assert_eq!(hello.len(), 1);
        assert_eq!(hello[0].0, EncryptionLevel::Initial);

        let server_flight = deliver(&server, Role::Server, hello).await;
        assert_eq!(server.state.state(), State::BeforeHandshake);
        let levels: Vec<_> = server_flight.iter().map(|(level, _)| *level).collect();
        assert_eq!(levels, vec![EncryptionLevel::Initial, EncryptionLevel::Handshake]);

        let client_finished = deliver(&client, Role::Client, server_flight).await;
        assert_eq!(client.state.state(), State::BeforeDone);
        assert!(client.session.lock().is_available(EncryptionLevel::OneRtt));

        let done = deliver(&server, Role::Server, client_finished).await;
        assert_eq!(server.state.state(), State::Ready);
        assert_eq!(done, vec![(EncryptionLevel::OneRtt, vec![Frame::HandshakeDone])]);

        deliver(&client, Role::Client, done.clone()).await;
        assert_eq!(client.state.state(), State::Done);
        // duplicate HANDSHAKE_DONE is ignored
        deliver(&client, Role::Client, done).await;
        assert_eq!(client.state.state(), State::Done);
    }

    #[tokio::test]
    async fn test_duplicate_crypto_is_ignored() {
        let dcid = ConnectionId::random(8).unwrap();
        let client = handler(Role::Client, &dcid);
        let server = handler(Role::Server, &dcid);

        let hello = client.start().unwrap();
        let first = deliver(&server, Role::Server, hello.clone()).await;
        assert_eq!(first.len(), 2);
        let again = deliver(&server, Role::Server, hello).await;
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_garbage_closes_with_crypto_error() {
        let dcid = ConnectionId::random(8).unwrap();
        let server = handler(Role::Server, &dcid);
        let frame = Frame::Crypto { offset: 0, data: Bytes::from_static(&[9, 0, 1, 0]) };

        let mut ctx = Context::new(facts(Role::Server, State::Started));
        let flow = server.on_receive(&mut ctx, packet(EncryptionLevel::Initial, vec![frame])).await.unwrap();
        assert!(matches!(flow, Flow::Stop));
        assert_eq!(ctx.into_effects().close.unwrap().code, HANDSHAKE_FAILURE);
    }

    #[test]
    fn test_crypto_offsets_advance_per_level() {
        let dcid = ConnectionId::random(8).unwrap();
        let client = handler(Role::Client, &dcid);
        let framed = client.crypto_frames(vec![
            (EncryptionLevel::Handshake, Bytes::from_static(b"abc")),
            (EncryptionLevel::Handshake, Bytes::from_static(b"de")),
            (EncryptionLevel::Initial, Bytes::from_static(b"f")),
        ]);
        let offsets: Vec<_> = framed
            .iter()
            .map(|(_, frames)| match &frames[0] {
                Frame::Crypto { offset, .. } => *offset,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(offsets, vec![0, 3, 0]);
    }
}
