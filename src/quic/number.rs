//! Packet numbers and their truncated wire encoding (RFC 9000 Section 17.1)

use std::fmt;

use crate::quic::error::{PacketError, Result};

/// Exclusive upper bound of the packet number space
pub const MAX_PACKET_NUMBER: u64 = (1 << 62) - 1;

/// QUIC packet number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketNumber(u64);

impl PacketNumber {
    pub const ZERO: PacketNumber = PacketNumber(0);

    pub fn new(value: u64) -> Result<Self> {
        if value >= MAX_PACKET_NUMBER {
            return Err(PacketError::InvalidHeader(format!("packet number {} out of range", value)).into());
        }
        Ok(Self(value))
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Bytes needed to encode this number given the largest acknowledged one.
    ///
    /// The encoding must cover twice the number of unacknowledged packets.
    pub fn encoded_len(self, largest_acked: Option<PacketNumber>) -> usize {
        let unacked = match largest_acked {
            Some(largest) => self.0.saturating_sub(largest.0),
            None => self.0 + 1,
        };
        if unacked < 1 << 7 {
            1
        } else if unacked < 1 << 15 {
            2
        } else if unacked < 1 << 23 {
            3
        } else {
            4
        }
    }

    /// Truncated big-endian encoding
    pub fn encode(self, largest_acked: Option<PacketNumber>) -> Vec<u8> {
        self.encode_at_least(largest_acked, 1)
    }

    /// Like [`encode`](Self::encode) but never shorter than `min_len` bytes (capped at 4)
    pub fn encode_at_least(self, largest_acked: Option<PacketNumber>, min_len: usize) -> Vec<u8> {
        let len = self.encoded_len(largest_acked).max(min_len).min(4);
        self.0.to_be_bytes()[8 - len..].to_vec()
    }

    /// Recover the full packet number from its truncated form (RFC 9000 Appendix A.3)
    pub fn decode(truncated: &[u8], largest_received: Option<PacketNumber>) -> Result<Self> {
        if truncated.is_empty() || truncated.len() > 4 {
            return Err(PacketError::InvalidHeader(format!(
                "packet number length {}",
                truncated.len()
            ))
            .into());
        }

        let truncated_value = truncated.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
        let expected = largest_received.map_or(0, |largest| largest.0 + 1);
        let pn_win = 1u64 << (truncated.len() * 8);
        let pn_hwin = pn_win / 2;
        let pn_mask = pn_win - 1;

        let candidate = (expected & !pn_mask) | truncated_value;
        let value = if candidate + pn_hwin <= expected && candidate + pn_win < MAX_PACKET_NUMBER {
            candidate + pn_win
        } else if candidate > expected + pn_hwin && candidate >= pn_win {
            candidate - pn_win
        } else {
            candidate
        };
        Self::new(value)
    }
}

impl From<PacketNumber> for u64 {
    fn from(pn: PacketNumber) -> u64 {
        pn.0
    }
}

impl fmt::Display for PacketNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pn(value: u64) -> PacketNumber {
        PacketNumber::new(value).unwrap()
    }

    #[test]
    fn test_encoding_length_tracks_unacked_distance() {
        assert_eq!(pn(42).encode(None), vec![42]);
        assert_eq!(pn(0x12345).encode(None).len(), 3);
        assert_eq!(pn(0x12345).encode(Some(pn(0x12300))), vec![0x45]);
    }

    #[test]
    fn test_widened_encoding_decodes_to_same_number() {
        assert_eq!(pn(5).encode_at_least(None, 3), vec![0, 0, 5]);
        assert_eq!(pn(5).encode_at_least(None, 9).len(), 4);
        let wide = pn(0x1_0203).encode_at_least(Some(pn(0x1_0200)), 4);
        assert_eq!(PacketNumber::decode(&wide, Some(pn(0x1_0202))).unwrap(), pn(0x1_0203));
    }

    #[test]
    fn test_rfc_decode_example() {
        // RFC 9000 Appendix A.3
        let decoded = PacketNumber::decode(&[0x9b, 0x32], Some(pn(0xa82f30ea))).unwrap();
        assert_eq!(decoded.value(), 0xa82f9b32);
    }

    #[test]
    fn test_decode_without_history() {
        assert_eq!(PacketNumber::decode(&[7], None).unwrap().value(), 7);
    }

    #[test]
    fn test_decode_wraps_forward() {
        // 0x01 after 0xfe with one byte means 0x101
        let decoded = PacketNumber::decode(&[0x01], Some(pn(0xfe))).unwrap();
        assert_eq!(decoded.value(), 0x101);
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(PacketNumber::new(MAX_PACKET_NUMBER).is_err());
        assert!(PacketNumber::decode(&[], None).is_err());
        assert!(PacketNumber::decode(&[0; 5], None).is_err());
    }
}
