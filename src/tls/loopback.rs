//! Minimal in-process handshake
//!
//! `LoopbackTls` is not TLS. It runs the same flight shape as a TLS 1.3
//! handshake (hello exchange at Initial, Finished messages at Handshake) and
//! installs real QUIC packet protection, so two endpoints in one process can
//! bring a connection up without certificates. Messages are framed as
//! `type (1 byte) | length (2 bytes) | body`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ring::rand::{SecureRandom, SystemRandom};
use std::sync::Arc;
use tracing::debug;

use super::{HandshakeEvent, TlsOutput, TlsSession};
use crate::quic::crypto::{self, Aead, RingAead};
use crate::quic::error::{CryptoError, Result};
use crate::quic::packet::{ConnectionId, EncryptionLevel};
use crate::quic::state::Role;

const CLIENT_HELLO: u8 = 1;
const SERVER_HELLO: u8 = 2;
const SERVER_FINISHED: u8 = 3;
const CLIENT_FINISHED: u8 = 4;

const RANDOM_LEN: usize = 32;
const HEADER_LEN: usize = 3;

const LOOPBACK_IKM: &[u8] = b"quicore loopback handshake";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Start,
    WaitServerHello,
    WaitServerFinished,
    WaitClientHello,
    WaitClientFinished,
    Complete,
}

pub struct LoopbackTls {
    role: Role,
    step: Step,
    rng: SystemRandom,
    client_random: [u8; RANDOM_LEN],
    server_random: [u8; RANDOM_LEN],
    keys: [Option<Arc<dyn Aead>>; 3],
    inbound: [BytesMut; 3],
}

impl LoopbackTls {
    /// Client session with Initial keys for the destination id it chose
    pub fn client(dcid: &ConnectionId) -> Result<Self> {
        Self::new(Role::Client, dcid, Step::Start)
    }

    /// Server session with Initial keys for the client's destination id
    pub fn server(dcid: &ConnectionId) -> Result<Self> {
        Self::new(Role::Server, dcid, Step::WaitClientHello)
    }

    fn new(role: Role, dcid: &ConnectionId, step: Step) -> Result<Self> {
        let initial: Arc<dyn Aead> = Arc::new(crypto::initial_aead(dcid.as_bytes(), role)?);
        Ok(Self {
            role,
            step,
            rng: SystemRandom::new(),
            client_random: [0; RANDOM_LEN],
            server_random: [0; RANDOM_LEN],
            keys: [Some(initial), None, None],
            inbound: Default::default(),
        })
    }

    fn random(&self) -> Result<[u8; RANDOM_LEN]> {
        let mut out = [0u8; RANDOM_LEN];
        self.rng
            .fill(&mut out)
            .map_err(|_| CryptoError::Handshake("random source failed".into()))?;
        Ok(out)
    }

    fn transcript(&self) -> Vec<u8> {
        [self.client_random, self.server_random].concat()
    }

    fn install(&mut self, level: EncryptionLevel, client_label: &[u8], server_label: &[u8]) -> Result<()> {
        let (client, server) = crypto::derive_secret_pair(&self.transcript(), LOOPBACK_IKM, client_label, server_label)?;
        self.keys[level.index()] = Some(Arc::new(RingAead::from_secrets(self.role, &client, &server)?));
        debug!("{} installed {} keys", self.role, level);
        Ok(())
    }

    /// (client, server) Finished verify data
    fn finished(&self) -> Result<([u8; 32], [u8; 32])> {
        crypto::derive_secret_pair(&self.transcript(), LOOPBACK_IKM, b"c finished", b"s finished")
    }

    fn handle(&mut self, level: EncryptionLevel, kind: u8, body: Bytes, output: &mut TlsOutput) -> Result<()> {
        match (self.step, level, kind) {
            (Step::WaitClientHello, EncryptionLevel::Initial, CLIENT_HELLO) => {
                self.client_random = read_random(&body)?;
                self.server_random = self.random()?;
                self.install(EncryptionLevel::Handshake, b"c hs traffic", b"s hs traffic")?;
                self.install(EncryptionLevel::OneRtt, b"c ap traffic", b"s ap traffic")?;
                let (_, server_finished) = self.finished()?;
                output.crypto.push((EncryptionLevel::Initial, message(SERVER_HELLO, &self.server_random)));
                output.crypto.push((EncryptionLevel::Handshake, message(SERVER_FINISHED, &server_finished)));
                output.events.push(HandshakeEvent::HandshakeKeysReady);
                self.step = Step::WaitClientFinished;
            }
            (Step::WaitServerHello, EncryptionLevel::Initial, SERVER_HELLO) => {
                self.server_random = read_random(&body)?;
                self.install(EncryptionLevel::Handshake, b"c hs traffic", b"s hs traffic")?;
                output.events.push(HandshakeEvent::HandshakeKeysReady);
                self.step = Step::WaitServerFinished;
            }
            (Step::WaitServerFinished, EncryptionLevel::Handshake, SERVER_FINISHED) => {
                let (client_finished, server_finished) = self.finished()?;
                if body.as_ref() != server_finished {
                    return Err(CryptoError::Handshake("server Finished does not verify".into()).into());
                }
                self.install(EncryptionLevel::OneRtt, b"c ap traffic", b"s ap traffic")?;
                output.crypto.push((EncryptionLevel::Handshake, message(CLIENT_FINISHED, &client_finished)));
                output.events.push(HandshakeEvent::FinishedSent);
                self.step = Step::Complete;
            }
            (Step::WaitClientFinished, EncryptionLevel::Handshake, CLIENT_FINISHED) => {
                let (client_finished, _) = self.finished()?;
                if body.as_ref() != client_finished {
                    return Err(CryptoError::Handshake("client Finished does not verify".into()).into());
                }
                output.events.push(HandshakeEvent::HandshakeConfirmed);
                self.step = Step::Complete;
            }
            (step, level, kind) => {
                return Err(CryptoError::Handshake(format!(
                    "unexpected message {} at {} while {:?}",
                    kind, level, step
                ))
                .into());
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for LoopbackTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTls")
            .field("role", &self.role)
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}

fn message(kind: u8, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    buf.put_u8(kind);
    buf.put_u16(body.len() as u16);
    buf.put_slice(body);
    buf.freeze()
}

/// Split one complete message off the front of `buf`, if there is one
fn take_message(buf: &mut BytesMut) -> Option<(u8, Bytes)> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
    if buf.len() < HEADER_LEN + len {
        return None;
    }
    let kind = buf.get_u8();
    buf.advance(2);
    Some((kind, buf.split_to(len).freeze()))
}

fn read_random(body: &[u8]) -> Result<[u8; RANDOM_LEN]> {
    body.try_into()
        .map_err(|_| CryptoError::Handshake(format!("hello random of {} bytes", body.len())).into())
}

impl TlsSession for LoopbackTls {
    fn role(&self) -> Role {
        self.role
    }

    fn start(&mut self) -> Result<TlsOutput> {
        if self.step != Step::Start {
            return Err(CryptoError::Handshake(format!("start while {:?}", self.step)).into());
        }
        self.client_random = self.random()?;
        self.step = Step::WaitServerHello;
        Ok(TlsOutput {
            crypto: vec![(EncryptionLevel::Initial, message(CLIENT_HELLO, &self.client_random))],
            events: Vec::new(),
        })
    }

    fn on_crypto(&mut self, level: EncryptionLevel, data: &[u8]) -> Result<TlsOutput> {
        let mut output = TlsOutput::default();
        self.inbound[level.index()].extend_from_slice(data);
        while let Some((kind, body)) = take_message(&mut self.inbound[level.index()]) {
            self.handle(level, kind, body, &mut output)?;
        }
        Ok(output)
    }

    fn aead_for(&self, level: EncryptionLevel) -> Option<Arc<dyn Aead>> {
        self.keys[level.index()].clone()
    }

    fn discard(&mut self, level: EncryptionLevel) {
        if self.keys[level.index()].take().is_some() {
            debug!("{} discarded {} keys", self.role, level);
        }
    }

    fn on_retry(&mut self, new_dcid: &ConnectionId) -> Result<()> {
        if self.role != Role::Client || self.step != Step::WaitServerHello {
            return Err(CryptoError::Handshake(format!("retry while {:?}", self.step)).into());
        }
        self.keys[EncryptionLevel::Initial.index()] = Some(Arc::new(crypto::initial_aead(new_dcid.as_bytes(), Role::Client)?));
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.step == Step::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quic::error::QuicError;

    fn pair() -> (LoopbackTls, LoopbackTls) {
        let dcid = ConnectionId::random(8).unwrap();
        (LoopbackTls::client(&dcid).unwrap(), LoopbackTls::server(&dcid).unwrap())
    }

    fn only(output: &TlsOutput, level: EncryptionLevel) -> Bytes {
        output
            .crypto
            .iter()
            .find(|(l, _)| *l == level)
            .map(|(_, data)| data.clone())
            .unwrap()
    }

    #[test]
    fn test_full_exchange_installs_matching_keys() {
        let (mut client, mut server) = pair();
        let hello = client.start().unwrap();
        let flight = server.on_crypto(EncryptionLevel::Initial, &only(&hello, EncryptionLevel::Initial)).unwrap();
        assert_eq!(flight.events, vec![HandshakeEvent::HandshakeKeysReady]);

        let out = client.on_crypto(EncryptionLevel::Initial, &only(&flight, EncryptionLevel::Initial)).unwrap();
        assert_eq!(out.events, vec![HandshakeEvent::HandshakeKeysReady]);
        let finished = client.on_crypto(EncryptionLevel::Handshake, &only(&flight, EncryptionLevel::Handshake)).unwrap();
        assert_eq!(finished.events, vec![HandshakeEvent::FinishedSent]);
        assert!(client.is_complete());

        let confirmed = server
            .on_crypto(EncryptionLevel::Handshake, &only(&finished, EncryptionLevel::Handshake))
            .unwrap();
        assert_eq!(confirmed.events, vec![HandshakeEvent::HandshakeConfirmed]);
        assert!(server.is_complete());

        for level in EncryptionLevel::ALL {
            let sealer = client.aead_for(level).unwrap();
            let opener = server.aead_for(level).unwrap();
            let header = [0x40u8, 1, 2, 3];
            let sealed = sealer.seal(7, &header, b"loopback").unwrap();
            assert_eq!(&opener.open(7, &header, &sealed).unwrap()[..], b"loopback");
        }
    }

    #[test]
    fn test_split_messages_are_buffered() {
        let (mut client, mut server) = pair();
        let hello = only(&client.start().unwrap(), EncryptionLevel::Initial);
        let first = server.on_crypto(EncryptionLevel::Initial, &hello[..10]).unwrap();
        assert!(first.crypto.is_empty());
        let rest = server.on_crypto(EncryptionLevel::Initial, &hello[10..]).unwrap();
        assert_eq!(rest.crypto.len(), 2);
    }

    #[test]
    fn test_tampered_finished_fails() {
        let (mut client, mut server) = pair();
        let hello = client.start().unwrap();
        let flight = server.on_crypto(EncryptionLevel::Initial, &only(&hello, EncryptionLevel::Initial)).unwrap();
        client.on_crypto(EncryptionLevel::Initial, &only(&flight, EncryptionLevel::Initial)).unwrap();

        let mut bad = only(&flight, EncryptionLevel::Handshake).to_vec();
        let last = bad.len() - 1;
        bad[last] ^= 0xff;
        let err = client.on_crypto(EncryptionLevel::Handshake, &bad).unwrap_err();
        assert!(matches!(err, QuicError::Crypto(CryptoError::Handshake(_))));
    }

    #[test]
    fn test_retry_rekeys_initial_level() {
        let (mut client, _) = pair();
        let before = client.aead_for(EncryptionLevel::Initial).unwrap();
        assert!(client.on_retry(&ConnectionId::random(8).unwrap()).is_err());

        client.start().unwrap();
        let new_dcid = ConnectionId::random(8).unwrap();
        client.on_retry(&new_dcid).unwrap();
        let after = client.aead_for(EncryptionLevel::Initial).unwrap();

        let header = [0xc0u8, 0, 0, 0, 1];
        let sealed = after.seal(0, &header, b"hello").unwrap();
        assert!(before.seal(0, &header, b"hello").unwrap() != sealed);

        let server = LoopbackTls::server(&new_dcid).unwrap();
        let opener = server.aead_for(EncryptionLevel::Initial).unwrap();
        assert_eq!(&opener.open(0, &header, &sealed).unwrap()[..], b"hello");
    }

    #[test]
    fn test_discard_drops_keys() {
        let (mut client, _) = pair();
        assert!(client.is_available(EncryptionLevel::Initial));
        client.discard(EncryptionLevel::Initial);
        assert!(!client.is_available(EncryptionLevel::Initial));
    }
}
