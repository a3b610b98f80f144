//! Packet protection and two-phase parsing
//!
//! Outgoing packets are sealed and header-protected by [`protect`]. Incoming
//! datagrams are first [`half_parse`]d to learn the encryption level and
//! connection id without any keys, then [`HalfParsed::complete`]d with the
//! AEAD for that level.

use bytes::{BufMut, Bytes, BytesMut};

use crate::quic::crypto::{self, Aead, MASK_LEN, SAMPLE_LEN};
use crate::quic::error::{PacketError, Result};
use crate::quic::frame::Payload;
use crate::quic::number::PacketNumber;
use crate::quic::packet::{
    ConnectionId, EncryptionLevel, LongHeader, LongPacketType, Packet, QUIC_VERSION_1,
};
use crate::quic::varint::{self, Reader};

const LONG_FORM: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;
const KEY_PHASE: u8 = 0x04;
const PN_LEN_MASK: u8 = 0x03;

/// Header protection samples past the longest packet number encoding
const PN_MAX_LEN: usize = 4;

const RETRY_TAG_LEN: usize = 16;

/// Packet type as seen before decryption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Initial,
    Handshake,
    Retry,
    VersionNegotiation,
    Short,
}

impl PacketKind {
    pub fn level(self) -> Option<EncryptionLevel> {
        match self {
            PacketKind::Initial => Some(EncryptionLevel::Initial),
            PacketKind::Handshake => Some(EncryptionLevel::Handshake),
            PacketKind::Short => Some(EncryptionLevel::OneRtt),
            PacketKind::Retry | PacketKind::VersionNegotiation => None,
        }
    }
}

/// Seal and header-protect a packet.
///
/// When the payload is too short to provide a header protection sample the
/// packet number is written with a longer encoding instead, so the frames
/// on the wire are exactly the packet's frames.
/// Retry and Version Negotiation packets are written unprotected.
pub fn protect(packet: &Packet, aead: &dyn Aead, largest_acked: Option<PacketNumber>) -> Result<BytesMut> {
    let (number, payload) = match (packet.number(), packet.payload()) {
        (Some(number), Some(payload)) => (number, payload),
        _ => return encode_unprotected(packet),
    };

    let plaintext = payload.to_bytes()?;
    let tag_len = aead.tag_len();

    // sample starts PN_MAX_LEN bytes after the packet number offset
    let min_pn_len = (PN_MAX_LEN + SAMPLE_LEN).saturating_sub(plaintext.len() + tag_len);
    if min_pn_len > PN_MAX_LEN {
        return Err(PacketError::TooSmall { size: plaintext.len() + tag_len }.into());
    }
    let pn_bytes = number.encode_at_least(largest_acked, min_pn_len);
    let pn_len = pn_bytes.len();

    let mut buf = BytesMut::with_capacity(64 + plaintext.len() + tag_len);
    let pn_bits = (pn_len - 1) as u8;
    match packet {
        Packet::Initial { header, token, .. } => {
            buf.put_u8(LONG_FORM | FIXED_BIT | ((LongPacketType::Initial as u8) << 4) | pn_bits);
            put_long_header(&mut buf, header);
            varint::encode(&mut buf, token.len() as u64)?;
            buf.put_slice(token);
            varint::encode(&mut buf, (pn_len + plaintext.len() + tag_len) as u64)?;
        }
        Packet::Handshake { header, .. } => {
            buf.put_u8(LONG_FORM | FIXED_BIT | ((LongPacketType::Handshake as u8) << 4) | pn_bits);
            put_long_header(&mut buf, header);
            varint::encode(&mut buf, (pn_len + plaintext.len() + tag_len) as u64)?;
        }
        Packet::Short { dcid, key_phase, .. } => {
            let phase = if *key_phase { KEY_PHASE } else { 0 };
            buf.put_u8(FIXED_BIT | phase | pn_bits);
            buf.put_slice(dcid.as_bytes());
        }
        Packet::Retry { .. } | Packet::VersionNegotiation { .. } => return encode_unprotected(packet),
    }

    let pn_offset = buf.len();
    buf.put_slice(&pn_bytes);
    let ciphertext = aead.seal(number.value(), &buf, &plaintext)?;
    buf.put_slice(&ciphertext);

    let sample_start = pn_offset + PN_MAX_LEN;
    let mask = aead.encrypt_header_sample(&buf[sample_start..sample_start + SAMPLE_LEN])?;
    apply_mask(&mut buf, pn_offset, pn_len, &mask);

    Ok(buf)
}

fn put_long_header(buf: &mut BytesMut, header: &LongHeader) {
    buf.put_u32(header.version);
    buf.put_u8(header.dcid.len() as u8);
    buf.put_slice(header.dcid.as_bytes());
    buf.put_u8(header.scid.len() as u8);
    buf.put_slice(header.scid.as_bytes());
}

fn apply_mask(packet: &mut [u8], pn_offset: usize, pn_len: usize, mask: &[u8; MASK_LEN]) {
    let bits = if packet[0] & LONG_FORM != 0 { 0x0f } else { 0x1f };
    packet[0] ^= mask[0] & bits;
    for (byte, m) in packet[pn_offset..pn_offset + pn_len].iter_mut().zip(&mask[1..]) {
        *byte ^= m;
    }
}

fn retry_without_tag(header: &LongHeader, token: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(32 + token.len() + RETRY_TAG_LEN);
    buf.put_u8(LONG_FORM | FIXED_BIT | ((LongPacketType::Retry as u8) << 4));
    put_long_header(&mut buf, header);
    buf.put_slice(token);
    buf
}

fn encode_unprotected(packet: &Packet) -> Result<BytesMut> {
    match packet {
        Packet::Retry { header, token, integrity_tag } => {
            let mut buf = retry_without_tag(header, token);
            buf.put_slice(integrity_tag);
            Ok(buf)
        }
        Packet::VersionNegotiation { dcid, scid, versions } => {
            let mut buf = BytesMut::with_capacity(7 + dcid.len() + scid.len() + versions.len() * 4);
            buf.put_u8(LONG_FORM | FIXED_BIT);
            put_long_header(&mut buf, &LongHeader { version: 0, dcid: dcid.clone(), scid: scid.clone() });
            for version in versions {
                buf.put_u32(*version);
            }
            Ok(buf)
        }
        other => Err(PacketError::InvalidHeader(format!("{} packet needs packet protection", other.kind())).into()),
    }
}

/// Build a Retry packet whose integrity tag covers `original_dcid`
pub fn retry_packet(header: LongHeader, token: Bytes, original_dcid: &ConnectionId) -> Result<Packet> {
    let body = retry_without_tag(&header, &token);
    let integrity_tag = crypto::retry_integrity_tag(original_dcid.as_bytes(), &body)?;
    Ok(Packet::Retry { header, token, integrity_tag })
}

/// A packet located inside a datagram whose protection is still in place
#[derive(Debug, Clone)]
pub struct HalfParsed<'a> {
    pub kind: PacketKind,
    pub version: u32,
    pub dcid: ConnectionId,
    pub scid: Option<ConnectionId>,
    token: Bytes,
    /// Offset of the packet number, or of the body for unprotected packets
    pn_offset: usize,
    bytes: &'a [u8],
}

impl<'a> HalfParsed<'a> {
    pub fn level(&self) -> Option<EncryptionLevel> {
        self.kind.level()
    }

    /// Bytes this packet occupies in the datagram
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn token(&self) -> &Bytes {
        &self.token
    }

    fn long_header(&self) -> Result<LongHeader> {
        let scid = self
            .scid
            .clone()
            .ok_or_else(|| PacketError::InvalidHeader("long header without source id".to_string()))?;
        Ok(LongHeader { version: self.version, dcid: self.dcid.clone(), scid })
    }

    /// Decode a Retry or Version Negotiation packet
    pub fn decode_unprotected(&self) -> Result<Packet> {
        let body = &self.bytes[self.pn_offset..];
        match self.kind {
            PacketKind::Retry => {
                if body.len() < RETRY_TAG_LEN {
                    return Err(PacketError::TooSmall { size: self.bytes.len() }.into());
                }
                let (token, tag) = body.split_at(body.len() - RETRY_TAG_LEN);
                let mut integrity_tag = [0u8; RETRY_TAG_LEN];
                integrity_tag.copy_from_slice(tag);
                Ok(Packet::Retry {
                    header: self.long_header()?,
                    token: Bytes::copy_from_slice(token),
                    integrity_tag,
                })
            }
            PacketKind::VersionNegotiation => {
                if body.is_empty() || body.len() % 4 != 0 {
                    return Err(PacketError::InvalidHeader("version list length".to_string()).into());
                }
                let versions = body
                    .chunks_exact(4)
                    .map(|chunk| u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                    .collect();
                Ok(Packet::VersionNegotiation {
                    dcid: self.dcid.clone(),
                    scid: self.long_header()?.scid,
                    versions,
                })
            }
            _ => Err(PacketError::InvalidHeader("packet is protected".to_string()).into()),
        }
    }

    /// Remove header protection, open the payload and decode its frames
    pub fn complete(&self, aead: &dyn Aead, largest_received: Option<PacketNumber>) -> Result<Packet> {
        if self.kind.level().is_none() {
            return self.decode_unprotected();
        }

        let pn_offset = self.pn_offset;
        let sample_start = pn_offset + PN_MAX_LEN;
        if self.bytes.len() < sample_start + SAMPLE_LEN {
            return Err(PacketError::TooSmall { size: self.bytes.len() }.into());
        }

        let mut buf = self.bytes.to_vec();
        let mask = aead.decrypt_header_sample(&buf[sample_start..sample_start + SAMPLE_LEN])?;
        let bits = if buf[0] & LONG_FORM != 0 { 0x0f } else { 0x1f };
        buf[0] ^= mask[0] & bits;
        let pn_len = (buf[0] & PN_LEN_MASK) as usize + 1;
        for (byte, m) in buf[pn_offset..pn_offset + pn_len].iter_mut().zip(&mask[1..]) {
            *byte ^= m;
        }

        let number = PacketNumber::decode(&buf[pn_offset..pn_offset + pn_len], largest_received)?;
        let (header, ciphertext) = buf.split_at(pn_offset + pn_len);
        let plaintext = aead.open(number.value(), header, ciphertext)?;
        let payload = Payload::decode(&plaintext)?;

        let packet = match self.kind {
            PacketKind::Initial => Packet::Initial {
                header: self.long_header()?,
                token: self.token.clone(),
                number,
                payload,
            },
            PacketKind::Handshake => Packet::Handshake {
                header: self.long_header()?,
                number,
                payload,
            },
            _ => Packet::Short {
                dcid: self.dcid.clone(),
                key_phase: buf[0] & KEY_PHASE != 0,
                number,
                payload,
            },
        };
        Ok(packet)
    }
}

fn read_connection_id(reader: &mut Reader<'_>) -> Result<ConnectionId> {
    let len = reader.u8()? as usize;
    ConnectionId::from_slice(reader.bytes(len)?)
}

/// Locate the first packet of `datagram` and read its unprotected fields.
///
/// Short headers carry no id length, so the local id length is supplied.
pub fn half_parse(datagram: &[u8], short_dcid_len: usize) -> Result<HalfParsed<'_>> {
    let mut reader = Reader::new(datagram);
    let first = reader.u8()?;

    if first & LONG_FORM == 0 {
        if first & FIXED_BIT == 0 {
            return Err(PacketError::InvalidHeader("fixed bit not set".to_string()).into());
        }
        let dcid = ConnectionId::from_slice(reader.bytes(short_dcid_len)?)?;
        return Ok(HalfParsed {
            kind: PacketKind::Short,
            version: QUIC_VERSION_1,
            dcid,
            scid: None,
            token: Bytes::new(),
            pn_offset: reader.position(),
            bytes: datagram,
        });
    }

    let version = reader.u32()?;
    let dcid = read_connection_id(&mut reader)?;
    let scid = Some(read_connection_id(&mut reader)?);

    if version == 0 {
        return Ok(HalfParsed {
            kind: PacketKind::VersionNegotiation,
            version,
            dcid,
            scid,
            token: Bytes::new(),
            pn_offset: reader.position(),
            bytes: datagram,
        });
    }
    if version != QUIC_VERSION_1 {
        return Err(PacketError::UnsupportedVersion(version).into());
    }
    if first & FIXED_BIT == 0 {
        return Err(PacketError::InvalidHeader("fixed bit not set".to_string()).into());
    }

    let (kind, token) = match LongPacketType::from_first_byte(first) {
        LongPacketType::Retry => {
            return Ok(HalfParsed {
                kind: PacketKind::Retry,
                version,
                dcid,
                scid,
                token: Bytes::new(),
                pn_offset: reader.position(),
                bytes: datagram,
            });
        }
        LongPacketType::ZeroRtt => {
            return Err(PacketError::InvalidHeader("0-RTT packets are not supported".to_string()).into());
        }
        LongPacketType::Initial => (PacketKind::Initial, Bytes::copy_from_slice(reader.length_prefixed()?)),
        LongPacketType::Handshake => (PacketKind::Handshake, Bytes::new()),
    };

    let length = usize::try_from(reader.varint()?).map_err(|_| PacketError::IncompleteData)?;
    let pn_offset = reader.position();
    let end = pn_offset
        .checked_add(length)
        .filter(|end| *end <= datagram.len())
        .ok_or(PacketError::IncompleteData)?;

    Ok(HalfParsed {
        kind,
        version,
        dcid,
        scid,
        token,
        pn_offset,
        bytes: &datagram[..end],
    })
}

/// Iterate the packets coalesced into one datagram.
///
/// Iteration stops after the first packet whose boundary cannot be
/// determined; that error is yielded once.
pub fn split(datagram: &[u8], short_dcid_len: usize) -> Split<'_> {
    Split { remaining: datagram, short_dcid_len, failed: false }
}

#[derive(Debug)]
pub struct Split<'a> {
    remaining: &'a [u8],
    short_dcid_len: usize,
    failed: bool,
}

impl<'a> Iterator for Split<'a> {
    type Item = Result<HalfParsed<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining.is_empty() {
            return None;
        }
        match half_parse(self.remaining, self.short_dcid_len) {
            Ok(half) => {
                self.remaining = &self.remaining[half.len()..];
                Some(Ok(half))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Half-parse and complete a single packet
pub fn open(
    datagram: &[u8],
    aead: &dyn Aead,
    short_dcid_len: usize,
    largest_received: Option<PacketNumber>,
) -> Result<Packet> {
    half_parse(datagram, short_dcid_len)?.complete(aead, largest_received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quic::ack_range::AckRange;
    use crate::quic::crypto::{RingAead, initial_aead, verify_retry_integrity};
    use crate::quic::error::{CryptoError, QuicError};
    use crate::quic::frame::Frame;
    use crate::quic::state::Role;
    use crate::quic::stream::StreamId;

    fn cid(byte: u8) -> ConnectionId {
        ConnectionId::from_slice(&[byte; 8]).unwrap()
    }

    fn keys() -> (RingAead, RingAead) {
        let dcid = cid(0x83);
        (
            initial_aead(dcid.as_bytes(), Role::Client).unwrap(),
            initial_aead(dcid.as_bytes(), Role::Server).unwrap(),
        )
    }

    fn pn(value: u64) -> PacketNumber {
        PacketNumber::new(value).unwrap()
    }

    fn payload() -> Payload {
        Payload::new(vec![
            Frame::Crypto { offset: 0, data: Bytes::from_static(b"client hello bytes") },
            Frame::Ack { ack_delay: 3, ranges: vec![AckRange::new(0, 4).unwrap()] },
        ])
        .unwrap()
    }

    #[test]
    fn test_initial_round_trip() {
        let (client, server) = keys();
        let packet = Packet::Initial {
            header: LongHeader::new(cid(0x83), cid(0x11)),
            token: Bytes::from_static(b"retry-token"),
            number: pn(9),
            payload: payload(),
        };
        let wire = protect(&packet, &client, None).unwrap();
        assert_eq!(wire[0] & LONG_FORM, LONG_FORM);

        let half = half_parse(&wire, 8).unwrap();
        assert_eq!(half.level(), Some(EncryptionLevel::Initial));
        assert_eq!(half.dcid, cid(0x83));
        assert_eq!(half.len(), wire.len());
        assert_eq!(half.complete(&server, None).unwrap(), packet);
    }

    #[test]
    fn test_short_round_trip_with_truncated_number() {
        let (client, server) = keys();
        let packet = Packet::Short {
            dcid: cid(0x22),
            key_phase: true,
            number: pn(0x1_0203),
            payload: Payload::new(vec![Frame::Stream {
                stream_id: StreamId::new(0),
                offset: 0,
                data: Bytes::from_static(b"ping"),
                fin: true,
            }])
            .unwrap(),
        };
        let wire = protect(&packet, &server, Some(pn(0x1_0200))).unwrap();
        let opened = open(&wire, &client, 8, Some(pn(0x1_0202))).unwrap();
        assert_eq!(opened, packet);
    }

    #[test]
    fn test_ping_only_packets_round_trip_at_every_level() {
        let (client, server) = keys();
        let ping = || Payload::new(vec![Frame::Ping]).unwrap();
        let packets = [
            Packet::Initial {
                header: LongHeader::new(cid(1), cid(2)),
                token: Bytes::new(),
                number: pn(0),
                payload: ping(),
            },
            Packet::Handshake { header: LongHeader::new(cid(1), cid(2)), number: pn(0), payload: ping() },
            Packet::Short { dcid: cid(1), key_phase: false, number: pn(0), payload: ping() },
        ];
        for packet in packets {
            let wire = protect(&packet, &client, None).unwrap();
            let opened = open(&wire, &server, 8, None).unwrap();
            assert_eq!(opened, packet);
            assert_eq!(opened.frames(), &[Frame::Ping]);
        }
    }

    #[test]
    fn test_ack_only_short_packet_round_trips_exactly() {
        let (client, server) = keys();
        let packet = Packet::Short {
            dcid: cid(0x22),
            key_phase: false,
            number: pn(300),
            payload: Payload::new(vec![Frame::Ack { ack_delay: 0, ranges: vec![AckRange::single(7)] }]).unwrap(),
        };
        let wire = protect(&packet, &server, Some(pn(299))).unwrap();
        let opened = open(&wire, &client, 8, Some(pn(299))).unwrap();
        assert_eq!(opened, packet);
    }

    #[test]
    fn test_tampered_packet_fails_to_open() {
        let (client, server) = keys();
        let packet = Packet::Handshake {
            header: LongHeader::new(cid(1), cid(2)),
            number: pn(5),
            payload: payload(),
        };
        let mut wire = protect(&packet, &client, None).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xff;
        let err = open(&wire, &server, 8, None).unwrap_err();
        assert!(matches!(err, QuicError::Crypto(CryptoError::Decryption)));
    }

    #[test]
    fn test_zero_version_is_version_negotiation() {
        let (client, _) = keys();
        let packet = Packet::VersionNegotiation {
            dcid: cid(1),
            scid: cid(2),
            versions: vec![0xff00_001d, QUIC_VERSION_1],
        };
        let wire = protect(&packet, &client, None).unwrap();
        let half = half_parse(&wire, 8).unwrap();
        assert_eq!(half.kind, PacketKind::VersionNegotiation);
        assert_eq!(half.decode_unprotected().unwrap(), packet);
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let mut wire = vec![0xc0];
        wire.extend_from_slice(&0x0a0a_0a0au32.to_be_bytes());
        wire.extend_from_slice(&[4, 1, 1, 1, 1, 4, 2, 2, 2, 2, 0]);
        let err = half_parse(&wire, 8).unwrap_err();
        assert!(matches!(err, QuicError::Packet(PacketError::UnsupportedVersion(0x0a0a_0a0a))));
    }

    #[test]
    fn test_retry_integrity() {
        let original = cid(0x83);
        let retry = retry_packet(LongHeader::new(cid(0x11), cid(0x99)), Bytes::from_static(b"token"), &original).unwrap();
        let (client, _) = keys();
        let wire = protect(&retry, &client, None).unwrap();

        verify_retry_integrity(original.as_bytes(), &wire).unwrap();
        assert!(verify_retry_integrity(cid(0x84).as_bytes(), &wire).is_err());

        let half = half_parse(&wire, 8).unwrap();
        assert_eq!(half.kind, PacketKind::Retry);
        assert_eq!(half.decode_unprotected().unwrap(), retry);
    }

    #[test]
    fn test_coalesced_datagram_skips_bad_sibling() {
        let (client, server) = keys();
        let first = Packet::Initial {
            header: LongHeader::new(cid(1), cid(2)),
            token: Bytes::new(),
            number: pn(0),
            payload: payload(),
        };
        let second = Packet::Handshake {
            header: LongHeader::new(cid(1), cid(2)),
            number: pn(0),
            payload: payload(),
        };
        let third = Packet::Short {
            dcid: cid(1),
            key_phase: false,
            number: pn(3),
            payload: payload(),
        };

        let mut datagram = BytesMut::new();
        datagram.extend_from_slice(&protect(&first, &client, None).unwrap());
        let mut broken = protect(&second, &client, None).unwrap();
        let last = broken.len() - 1;
        broken[last] ^= 0x01;
        datagram.extend_from_slice(&broken);
        datagram.extend_from_slice(&protect(&third, &client, None).unwrap());

        let results: Vec<_> = split(&datagram, 8)
            .map(|half| half.and_then(|half| half.complete(&server, None)))
            .collect();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap(), &first);
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap(), &third);
    }

    #[test]
    fn test_split_stops_when_boundary_is_lost() {
        let datagram = [0xc0, 0, 0, 0, 1, 8];
        let results: Vec<_> = split(&datagram, 8).collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }
}
