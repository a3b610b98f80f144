//! QUIC variable-length integer encoding (RFC 9000 Section 16)

use bytes::BufMut;

use crate::quic::error::{PacketError, Result};

/// Largest value representable as a varint (2^62 - 1)
pub const MAX_VARINT: u64 = (1 << 62) - 1;

/// Number of bytes needed to encode `value`
pub fn encoded_len(value: u64) -> usize {
    if value < 64 {
        1
    } else if value < 16384 {
        2
    } else if value < 1_073_741_824 {
        4
    } else {
        8
    }
}

pub fn encode<B: BufMut>(buf: &mut B, value: u64) -> Result<()> {
    if value > MAX_VARINT {
        return Err(PacketError::VarintOverflow(value).into());
    }
    match encoded_len(value) {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16(0x4000 | value as u16),
        4 => buf.put_u32(0x8000_0000 | value as u32),
        _ => buf.put_u64(0xc000_0000_0000_0000 | value),
    }
    Ok(())
}

/// Decode a varint from the front of `data`, returning the value and bytes consumed
pub fn decode(data: &[u8]) -> Result<(u64, usize)> {
    let first = *data.first().ok_or(PacketError::IncompleteData)?;
    let len = 1usize << (first >> 6);
    if data.len() < len {
        return Err(PacketError::IncompleteData.into());
    }

    let mut value = (first & 0x3f) as u64;
    for byte in &data[1..len] {
        value = (value << 8) | *byte as u64;
    }
    Ok((value, len))
}

/// Cursor-style reader over a byte slice, used by the frame and header parsers
#[derive(Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn varint(&mut self) -> Result<u64> {
        let (value, len) = decode(&self.data[self.pos..])?;
        self.pos += len;
        Ok(value)
    }

    pub fn u8(&mut self) -> Result<u8> {
        let byte = self.peek_u8().ok_or(PacketError::IncompleteData)?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn u32(&mut self) -> Result<u32> {
        let bytes = self.bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(PacketError::IncompleteData.into());
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    /// Read a varint length prefix followed by that many bytes
    pub fn length_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.varint()?;
        let len = usize::try_from(len).map_err(|_| PacketError::IncompleteData)?;
        self.bytes(len)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }
}
