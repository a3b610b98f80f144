//! QUIC packet model
//!
//! Packets are kept in their unprotected form here. Protection and parsing
//! live in [`crate::quic::codec`].

use bytes::Bytes;
use std::fmt;

use crate::quic::error::{PacketError, Result};
use crate::quic::frame::{Frame, Payload};
use crate::quic::number::PacketNumber;

/// QUIC version 1 (RFC 9000)
pub const QUIC_VERSION_1: u32 = 0x0000_0001;

pub const MIN_CONNECTION_ID_LEN: usize = 4;
pub const MAX_CONNECTION_ID_LEN: usize = 20;

/// Connection identifier, 4 to 20 opaque bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(Bytes);

impl ConnectionId {
    pub fn new(bytes: Bytes) -> Result<Self> {
        if !(MIN_CONNECTION_ID_LEN..=MAX_CONNECTION_ID_LEN).contains(&bytes.len()) {
            return Err(PacketError::InvalidConnectionIdLength(bytes.len()).into());
        }
        Ok(Self(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Self::new(Bytes::copy_from_slice(bytes))
    }

    /// Random connection id of `len` bytes built from UUID v4 material
    pub fn random(len: usize) -> Result<Self> {
        let mut bytes = Vec::with_capacity(len);
        while bytes.len() < len {
            bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
        }
        bytes.truncate(len);
        Self::new(Bytes::from(bytes))
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// Encryption level, one per packet number space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EncryptionLevel {
    Initial,
    Handshake,
    OneRtt,
}

impl EncryptionLevel {
    pub const ALL: [EncryptionLevel; 3] = [
        EncryptionLevel::Initial,
        EncryptionLevel::Handshake,
        EncryptionLevel::OneRtt,
    ];

    pub fn index(self) -> usize {
        match self {
            EncryptionLevel::Initial => 0,
            EncryptionLevel::Handshake => 1,
            EncryptionLevel::OneRtt => 2,
        }
    }
}

impl fmt::Display for EncryptionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EncryptionLevel::Initial => "initial",
            EncryptionLevel::Handshake => "handshake",
            EncryptionLevel::OneRtt => "1-rtt",
        };
        f.write_str(name)
    }
}

/// Long header packet types (RFC 9000 Section 17.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongPacketType {
    Initial = 0x0,
    ZeroRtt = 0x1,
    Handshake = 0x2,
    Retry = 0x3,
}

impl LongPacketType {
    /// Decode the type bits of a long header first byte
    pub fn from_first_byte(byte: u8) -> Self {
        match (byte >> 4) & 0x03 {
            0x0 => LongPacketType::Initial,
            0x1 => LongPacketType::ZeroRtt,
            0x2 => LongPacketType::Handshake,
            _ => LongPacketType::Retry,
        }
    }
}

/// Fields shared by long header packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongHeader {
    pub version: u32,
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
}

impl LongHeader {
    pub fn new(dcid: ConnectionId, scid: ConnectionId) -> Self {
        Self { version: QUIC_VERSION_1, dcid, scid }
    }
}

/// QUIC packet in unprotected form
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Initial {
        header: LongHeader,
        token: Bytes,
        number: PacketNumber,
        payload: Payload,
    },
    Handshake {
        header: LongHeader,
        number: PacketNumber,
        payload: Payload,
    },
    Retry {
        header: LongHeader,
        token: Bytes,
        integrity_tag: [u8; 16],
    },
    VersionNegotiation {
        dcid: ConnectionId,
        scid: ConnectionId,
        versions: Vec<u32>,
    },
    Short {
        dcid: ConnectionId,
        key_phase: bool,
        number: PacketNumber,
        payload: Payload,
    },
}

impl Packet {
    /// Build a protected-space packet at `level`
    pub fn at_level(
        level: EncryptionLevel,
        dcid: ConnectionId,
        scid: ConnectionId,
        token: Bytes,
        number: PacketNumber,
        payload: Payload,
    ) -> Self {
        match level {
            EncryptionLevel::Initial => Packet::Initial {
                header: LongHeader::new(dcid, scid),
                token,
                number,
                payload,
            },
            EncryptionLevel::Handshake => Packet::Handshake {
                header: LongHeader::new(dcid, scid),
                number,
                payload,
            },
            EncryptionLevel::OneRtt => Packet::Short {
                dcid,
                key_phase: false,
                number,
                payload,
            },
        }
    }

    /// Encryption level, `None` for Retry and Version Negotiation
    pub fn level(&self) -> Option<EncryptionLevel> {
        match self {
            Packet::Initial { .. } => Some(EncryptionLevel::Initial),
            Packet::Handshake { .. } => Some(EncryptionLevel::Handshake),
            Packet::Short { .. } => Some(EncryptionLevel::OneRtt),
            Packet::Retry { .. } | Packet::VersionNegotiation { .. } => None,
        }
    }

    pub fn number(&self) -> Option<PacketNumber> {
        match self {
            Packet::Initial { number, .. } | Packet::Handshake { number, .. } | Packet::Short { number, .. } => {
                Some(*number)
            }
            _ => None,
        }
    }

    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Packet::Initial { payload, .. } | Packet::Handshake { payload, .. } | Packet::Short { payload, .. } => {
                Some(payload)
            }
            _ => None,
        }
    }

    pub fn payload_mut(&mut self) -> Option<&mut Payload> {
        match self {
            Packet::Initial { payload, .. } | Packet::Handshake { payload, .. } | Packet::Short { payload, .. } => {
                Some(payload)
            }
            _ => None,
        }
    }

    /// Frames carried by the packet, empty for Retry and Version Negotiation
    pub fn frames(&self) -> &[Frame] {
        self.payload().map(Payload::frames).unwrap_or(&[])
    }

    pub fn dcid(&self) -> &ConnectionId {
        match self {
            Packet::Initial { header, .. } | Packet::Handshake { header, .. } | Packet::Retry { header, .. } => {
                &header.dcid
            }
            Packet::VersionNegotiation { dcid, .. } | Packet::Short { dcid, .. } => dcid,
        }
    }

    pub fn scid(&self) -> Option<&ConnectionId> {
        match self {
            Packet::Initial { header, .. } | Packet::Handshake { header, .. } | Packet::Retry { header, .. } => {
                Some(&header.scid)
            }
            Packet::VersionNegotiation { scid, .. } => Some(scid),
            Packet::Short { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Initial { .. } => "Initial",
            Packet::Handshake { .. } => "Handshake",
            Packet::Retry { .. } => "Retry",
            Packet::VersionNegotiation { .. } => "VersionNegotiation",
            Packet::Short { .. } => "1-RTT",
        }
    }
}
