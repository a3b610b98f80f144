//! QUIC frames (RFC 9000 Section 19) and packet payloads

use bytes::{BufMut, Bytes, BytesMut};

use crate::quic::ack_range::{self, AckRange};
use crate::quic::error::{PacketError, Result};
use crate::quic::packet::EncryptionLevel;
use crate::quic::stream::StreamId;
use crate::quic::varint::{self, Reader};

/// QUIC frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Padding = 0x00,
    Ping = 0x01,
    Ack = 0x02,
    ResetStream = 0x04,
    StopSending = 0x05,
    Crypto = 0x06,
    NewToken = 0x07,
    Stream = 0x08,
    MaxData = 0x10,
    MaxStreamData = 0x11,
    MaxStreams = 0x12,
    DataBlocked = 0x14,
    StreamDataBlocked = 0x15,
    StreamsBlocked = 0x16,
    NewConnectionId = 0x18,
    RetireConnectionId = 0x19,
    PathChallenge = 0x1a,
    PathResponse = 0x1b,
    ConnectionClose = 0x1c,
    HandshakeDone = 0x1e,
}

impl FrameType {
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0x00 => Some(FrameType::Padding),
            0x01 => Some(FrameType::Ping),
            0x02..=0x03 => Some(FrameType::Ack),
            0x04 => Some(FrameType::ResetStream),
            0x05 => Some(FrameType::StopSending),
            0x06 => Some(FrameType::Crypto),
            0x07 => Some(FrameType::NewToken),
            0x08..=0x0f => Some(FrameType::Stream),
            0x10 => Some(FrameType::MaxData),
            0x11 => Some(FrameType::MaxStreamData),
            0x12..=0x13 => Some(FrameType::MaxStreams),
            0x14 => Some(FrameType::DataBlocked),
            0x15 => Some(FrameType::StreamDataBlocked),
            0x16..=0x17 => Some(FrameType::StreamsBlocked),
            0x18 => Some(FrameType::NewConnectionId),
            0x19 => Some(FrameType::RetireConnectionId),
            0x1a => Some(FrameType::PathChallenge),
            0x1b => Some(FrameType::PathResponse),
            0x1c..=0x1d => Some(FrameType::ConnectionClose),
            0x1e => Some(FrameType::HandshakeDone),
            _ => None,
        }
    }
}

/// QUIC frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `length` zero bytes in total
    Padding {
        length: usize,
    },
    Ping,
    Ack {
        ack_delay: u64,
        /// Descending by `largest`, non-overlapping, never empty
        ranges: Vec<AckRange>,
    },
    ResetStream {
        stream_id: StreamId,
        application_error_code: u64,
        final_size: u64,
    },
    StopSending {
        stream_id: StreamId,
        application_error_code: u64,
    },
    Crypto {
        offset: u64,
        data: Bytes,
    },
    NewToken {
        token: Bytes,
    },
    Stream {
        stream_id: StreamId,
        offset: u64,
        data: Bytes,
        fin: bool,
    },
    MaxData {
        maximum_data: u64,
    },
    MaxStreamData {
        stream_id: StreamId,
        maximum_stream_data: u64,
    },
    MaxStreams {
        maximum_streams: u64,
        bidirectional: bool,
    },
    DataBlocked {
        maximum_data: u64,
    },
    StreamDataBlocked {
        stream_id: StreamId,
        maximum_stream_data: u64,
    },
    StreamsBlocked {
        maximum_streams: u64,
        bidirectional: bool,
    },
    NewConnectionId {
        sequence_number: u64,
        retire_prior_to: u64,
        connection_id: Bytes,
        stateless_reset_token: [u8; 16],
    },
    RetireConnectionId {
        sequence_number: u64,
    },
    PathChallenge {
        data: [u8; 8],
    },
    PathResponse {
        data: [u8; 8],
    },
    /// `frame_type` is `Some` for transport closes (0x1c) and `None` for
    /// application closes (0x1d)
    ConnectionClose {
        error_code: u64,
        frame_type: Option<u64>,
        reason_phrase: String,
    },
    HandshakeDone,
}

impl Frame {
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Padding { .. } => "PADDING",
            Frame::Ping => "PING",
            Frame::Ack { .. } => "ACK",
            Frame::ResetStream { .. } => "RESET_STREAM",
            Frame::StopSending { .. } => "STOP_SENDING",
            Frame::Crypto { .. } => "CRYPTO",
            Frame::NewToken { .. } => "NEW_TOKEN",
            Frame::Stream { .. } => "STREAM",
            Frame::MaxData { .. } => "MAX_DATA",
            Frame::MaxStreamData { .. } => "MAX_STREAM_DATA",
            Frame::MaxStreams { .. } => "MAX_STREAMS",
            Frame::DataBlocked { .. } => "DATA_BLOCKED",
            Frame::StreamDataBlocked { .. } => "STREAM_DATA_BLOCKED",
            Frame::StreamsBlocked { .. } => "STREAMS_BLOCKED",
            Frame::NewConnectionId { .. } => "NEW_CONNECTION_ID",
            Frame::RetireConnectionId { .. } => "RETIRE_CONNECTION_ID",
            Frame::PathChallenge { .. } => "PATH_CHALLENGE",
            Frame::PathResponse { .. } => "PATH_RESPONSE",
            Frame::ConnectionClose { .. } => "CONNECTION_CLOSE",
            Frame::HandshakeDone => "HANDSHAKE_DONE",
        }
    }

    /// Largest acknowledged packet number of an ACK frame
    pub fn largest_acknowledged(&self) -> Option<u64> {
        match self {
            Frame::Ack { ranges, .. } => ranges.first().map(|r| r.largest),
            _ => None,
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Frame::Ack { .. })
    }

    /// Frames whose content is re-sent when the carrying packet is not acknowledged
    pub fn is_retransmittable(&self) -> bool {
        !matches!(
            self,
            Frame::Padding { .. }
                | Frame::Ping
                | Frame::Ack { .. }
                | Frame::PathChallenge { .. }
                | Frame::PathResponse { .. }
                | Frame::ConnectionClose { .. }
        )
    }

    /// Whether the frame may appear in a packet of the given level (RFC 9000 Section 12.4)
    pub fn allowed_at(&self, level: EncryptionLevel) -> bool {
        match level {
            EncryptionLevel::OneRtt => true,
            EncryptionLevel::Initial | EncryptionLevel::Handshake => match self {
                Frame::Padding { .. } | Frame::Ping | Frame::Ack { .. } | Frame::Crypto { .. } => true,
                Frame::ConnectionClose { frame_type, .. } => frame_type.is_some(),
                _ => false,
            },
        }
    }

    pub fn encoded_len(&self) -> usize {
        use varint::encoded_len as vl;
        match self {
            Frame::Padding { length } => (*length).max(1),
            Frame::Ping | Frame::HandshakeDone => 1,
            Frame::Ack { ack_delay, ranges } => {
                let mut len = 1 + vl(*ack_delay) + vl(ranges.len().saturating_sub(1) as u64);
                if let Some(first) = ranges.first() {
                    len += vl(first.largest) + vl(first.largest - first.smallest);
                }
                for pair in ranges.windows(2) {
                    len += vl(pair[0].smallest - pair[1].largest - 2);
                    len += vl(pair[1].largest - pair[1].smallest);
                }
                len
            }
            Frame::ResetStream { stream_id, application_error_code, final_size } => {
                1 + vl(stream_id.value()) + vl(*application_error_code) + vl(*final_size)
            }
            Frame::StopSending { stream_id, application_error_code } => {
                1 + vl(stream_id.value()) + vl(*application_error_code)
            }
            Frame::Crypto { offset, data } => 1 + vl(*offset) + vl(data.len() as u64) + data.len(),
            Frame::NewToken { token } => 1 + vl(token.len() as u64) + token.len(),
            Frame::Stream { stream_id, offset, data, .. } => {
                let offset_len = if *offset > 0 { vl(*offset) } else { 0 };
                1 + vl(stream_id.value()) + offset_len + vl(data.len() as u64) + data.len()
            }
            Frame::MaxData { maximum_data } | Frame::DataBlocked { maximum_data } => 1 + vl(*maximum_data),
            Frame::MaxStreamData { stream_id, maximum_stream_data }
            | Frame::StreamDataBlocked { stream_id, maximum_stream_data } => {
                1 + vl(stream_id.value()) + vl(*maximum_stream_data)
            }
            Frame::MaxStreams { maximum_streams, .. } | Frame::StreamsBlocked { maximum_streams, .. } => {
                1 + vl(*maximum_streams)
            }
            Frame::NewConnectionId { sequence_number, retire_prior_to, connection_id, .. } => {
                1 + vl(*sequence_number) + vl(*retire_prior_to) + 1 + connection_id.len() + 16
            }
            Frame::RetireConnectionId { sequence_number } => 1 + vl(*sequence_number),
            Frame::PathChallenge { .. } | Frame::PathResponse { .. } => 9,
            Frame::ConnectionClose { error_code, frame_type, reason_phrase } => {
                1 + vl(*error_code)
                    + frame_type.map_or(0, vl)
                    + vl(reason_phrase.len() as u64)
                    + reason_phrase.len()
            }
        }
    }

    /// Encode frame to bytes
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        match self {
            Frame::Padding { length } => buf.put_bytes(0, (*length).max(1)),
            Frame::Ping => buf.put_u8(FrameType::Ping as u8),
            Frame::Ack { ack_delay, ranges } => {
                let first = ranges
                    .first()
                    .ok_or_else(|| PacketError::MalformedFrame("ACK without ranges".to_string()))?;
                buf.put_u8(FrameType::Ack as u8);
                varint::encode(buf, first.largest)?;
                varint::encode(buf, *ack_delay)?;
                varint::encode(buf, ranges.len() as u64 - 1)?;
                varint::encode(buf, first.largest - first.smallest)?;
                for pair in ranges.windows(2) {
                    varint::encode(buf, pair[0].smallest - pair[1].largest - 2)?;
                    varint::encode(buf, pair[1].largest - pair[1].smallest)?;
                }
            }
            Frame::ResetStream { stream_id, application_error_code, final_size } => {
                buf.put_u8(FrameType::ResetStream as u8);
                varint::encode(buf, stream_id.value())?;
                varint::encode(buf, *application_error_code)?;
                varint::encode(buf, *final_size)?;
            }
            Frame::StopSending { stream_id, application_error_code } => {
                buf.put_u8(FrameType::StopSending as u8);
                varint::encode(buf, stream_id.value())?;
                varint::encode(buf, *application_error_code)?;
            }
            Frame::Crypto { offset, data } => {
                buf.put_u8(FrameType::Crypto as u8);
                varint::encode(buf, *offset)?;
                varint::encode(buf, data.len() as u64)?;
                buf.put_slice(data);
            }
            Frame::NewToken { token } => {
                buf.put_u8(FrameType::NewToken as u8);
                varint::encode(buf, token.len() as u64)?;
                buf.put_slice(token);
            }
            Frame::Stream { stream_id, offset, data, fin } => {
                let mut frame_type = FrameType::Stream as u8 | 0x02; // always carry LEN
                if *fin {
                    frame_type |= 0x01;
                }
                if *offset > 0 {
                    frame_type |= 0x04;
                }
                buf.put_u8(frame_type);
                varint::encode(buf, stream_id.value())?;
                if *offset > 0 {
                    varint::encode(buf, *offset)?;
                }
                varint::encode(buf, data.len() as u64)?;
                buf.put_slice(data);
            }
            Frame::MaxData { maximum_data } => {
                buf.put_u8(FrameType::MaxData as u8);
                varint::encode(buf, *maximum_data)?;
            }
            Frame::MaxStreamData { stream_id, maximum_stream_data } => {
                buf.put_u8(FrameType::MaxStreamData as u8);
                varint::encode(buf, stream_id.value())?;
                varint::encode(buf, *maximum_stream_data)?;
            }
            Frame::MaxStreams { maximum_streams, bidirectional } => {
                buf.put_u8(FrameType::MaxStreams as u8 + u8::from(!*bidirectional));
                varint::encode(buf, *maximum_streams)?;
            }
            Frame::DataBlocked { maximum_data } => {
                buf.put_u8(FrameType::DataBlocked as u8);
                varint::encode(buf, *maximum_data)?;
            }
            Frame::StreamDataBlocked { stream_id, maximum_stream_data } => {
                buf.put_u8(FrameType::StreamDataBlocked as u8);
                varint::encode(buf, stream_id.value())?;
                varint::encode(buf, *maximum_stream_data)?;
            }
            Frame::StreamsBlocked { maximum_streams, bidirectional } => {
                buf.put_u8(FrameType::StreamsBlocked as u8 + u8::from(!*bidirectional));
                varint::encode(buf, *maximum_streams)?;
            }
            Frame::NewConnectionId { sequence_number, retire_prior_to, connection_id, stateless_reset_token } => {
                buf.put_u8(FrameType::NewConnectionId as u8);
                varint::encode(buf, *sequence_number)?;
                varint::encode(buf, *retire_prior_to)?;
                buf.put_u8(connection_id.len() as u8);
                buf.put_slice(connection_id);
                buf.put_slice(stateless_reset_token);
            }
            Frame::RetireConnectionId { sequence_number } => {
                buf.put_u8(FrameType::RetireConnectionId as u8);
                varint::encode(buf, *sequence_number)?;
            }
            Frame::PathChallenge { data } => {
                buf.put_u8(FrameType::PathChallenge as u8);
                buf.put_slice(data);
            }
            Frame::PathResponse { data } => {
                buf.put_u8(FrameType::PathResponse as u8);
                buf.put_slice(data);
            }
            Frame::ConnectionClose { error_code, frame_type, reason_phrase } => {
                match frame_type {
                    Some(ft) => {
                        buf.put_u8(FrameType::ConnectionClose as u8);
                        varint::encode(buf, *error_code)?;
                        varint::encode(buf, *ft)?;
                    }
                    None => {
                        buf.put_u8(FrameType::ConnectionClose as u8 + 1);
                        varint::encode(buf, *error_code)?;
                    }
                }
                varint::encode(buf, reason_phrase.len() as u64)?;
                buf.put_slice(reason_phrase.as_bytes());
            }
            Frame::HandshakeDone => buf.put_u8(FrameType::HandshakeDone as u8),
        }
        Ok(())
    }

    /// Decode one frame from the front of `reader`
    pub fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let type_value = reader.varint()?;
        let frame_type = FrameType::from_u64(type_value).ok_or(PacketError::UnknownFrameType(type_value))?;

        let frame = match frame_type {
            FrameType::Padding => {
                let mut length = 1;
                while reader.peek_u8() == Some(0x00) {
                    reader.u8()?;
                    length += 1;
                }
                Frame::Padding { length }
            }
            FrameType::Ping => Frame::Ping,
            FrameType::Ack => {
                let largest = reader.varint()?;
                let ack_delay = reader.varint()?;
                let range_count = reader.varint()?;
                let first_range = reader.varint()?;
                let smallest = largest
                    .checked_sub(first_range)
                    .ok_or_else(|| PacketError::MalformedFrame("first ack range exceeds largest".to_string()))?;
                let mut ranges = vec![AckRange::new(smallest, largest)?];
                for _ in 0..range_count {
                    let gap = reader.varint()?;
                    let length = reader.varint()?;
                    let previous_smallest = ranges[ranges.len() - 1].smallest;
                    let largest = previous_smallest
                        .checked_sub(gap + 2)
                        .ok_or_else(|| PacketError::MalformedFrame("ack gap underflow".to_string()))?;
                    let smallest = largest
                        .checked_sub(length)
                        .ok_or_else(|| PacketError::MalformedFrame("ack range underflow".to_string()))?;
                    ranges.push(AckRange::new(smallest, largest)?);
                }
                if type_value == 0x03 {
                    // ECN counts are read and dropped
                    for _ in 0..3 {
                        reader.varint()?;
                    }
                }
                ack_range::validate_ranges(&ranges)?;
                Frame::Ack { ack_delay, ranges }
            }
            FrameType::ResetStream => Frame::ResetStream {
                stream_id: StreamId::new(reader.varint()?),
                application_error_code: reader.varint()?,
                final_size: reader.varint()?,
            },
            FrameType::StopSending => Frame::StopSending {
                stream_id: StreamId::new(reader.varint()?),
                application_error_code: reader.varint()?,
            },
            FrameType::Crypto => {
                let offset = reader.varint()?;
                let data = Bytes::copy_from_slice(reader.length_prefixed()?);
                Frame::Crypto { offset, data }
            }
            FrameType::NewToken => {
                let token = Bytes::copy_from_slice(reader.length_prefixed()?);
                if token.is_empty() {
                    return Err(PacketError::MalformedFrame("empty NEW_TOKEN".to_string()).into());
                }
                Frame::NewToken { token }
            }
            FrameType::Stream => {
                let stream_id = StreamId::new(reader.varint()?);
                let offset = if type_value & 0x04 != 0 { reader.varint()? } else { 0 };
                let data = if type_value & 0x02 != 0 {
                    reader.length_prefixed()?
                } else {
                    reader.rest()
                };
                Frame::Stream {
                    stream_id,
                    offset,
                    data: Bytes::copy_from_slice(data),
                    fin: type_value & 0x01 != 0,
                }
            }
            FrameType::MaxData => Frame::MaxData { maximum_data: reader.varint()? },
            FrameType::MaxStreamData => Frame::MaxStreamData {
                stream_id: StreamId::new(reader.varint()?),
                maximum_stream_data: reader.varint()?,
            },
            FrameType::MaxStreams => Frame::MaxStreams {
                maximum_streams: reader.varint()?,
                bidirectional: type_value == 0x12,
            },
            FrameType::DataBlocked => Frame::DataBlocked { maximum_data: reader.varint()? },
            FrameType::StreamDataBlocked => Frame::StreamDataBlocked {
                stream_id: StreamId::new(reader.varint()?),
                maximum_stream_data: reader.varint()?,
            },
            FrameType::StreamsBlocked => Frame::StreamsBlocked {
                maximum_streams: reader.varint()?,
                bidirectional: type_value == 0x16,
            },
            FrameType::NewConnectionId => {
                let sequence_number = reader.varint()?;
                let retire_prior_to = reader.varint()?;
                let len = reader.u8()? as usize;
                if !(1..=20).contains(&len) {
                    return Err(PacketError::InvalidConnectionIdLength(len).into());
                }
                let connection_id = Bytes::copy_from_slice(reader.bytes(len)?);
                let stateless_reset_token = reader.array::<16>()?;
                Frame::NewConnectionId { sequence_number, retire_prior_to, connection_id, stateless_reset_token }
            }
            FrameType::RetireConnectionId => Frame::RetireConnectionId { sequence_number: reader.varint()? },
            FrameType::PathChallenge => Frame::PathChallenge { data: reader.array::<8>()? },
            FrameType::PathResponse => Frame::PathResponse { data: reader.array::<8>()? },
            FrameType::ConnectionClose => {
                let error_code = reader.varint()?;
                let frame_type = if type_value == 0x1c { Some(reader.varint()?) } else { None };
                let reason_phrase = String::from_utf8_lossy(reader.length_prefixed()?).into_owned();
                Frame::ConnectionClose { error_code, frame_type, reason_phrase }
            }
            FrameType::HandshakeDone => Frame::HandshakeDone,
        };

        Ok(frame)
    }
}

/// Non-empty ordered sequence of frames carried by a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(Vec<Frame>);

impl Payload {
    pub fn new(frames: Vec<Frame>) -> Result<Self> {
        if frames.is_empty() {
            return Err(PacketError::EmptyPayload.into());
        }
        Ok(Self(frames))
    }

    pub fn frames(&self) -> &[Frame] {
        &self.0
    }

    pub fn into_frames(self) -> Vec<Frame> {
        self.0
    }

    pub fn push(&mut self, frame: Frame) {
        self.0.push(frame);
    }

    /// Serialized length of all frames
    pub fn encoded_len(&self) -> usize {
        self.0.iter().map(Frame::encoded_len).sum()
    }

    /// True when every frame is an ACK (padding ignored)
    pub fn is_ack_only(&self) -> bool {
        let mut saw_ack = false;
        for frame in &self.0 {
            match frame {
                Frame::Ack { .. } => saw_ack = true,
                Frame::Padding { .. } => {}
                _ => return false,
            }
        }
        saw_ack
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        for frame in &self.0 {
            frame.encode(buf)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let mut frames = Vec::new();
        while !reader.is_empty() {
            frames.push(Frame::decode(&mut reader)?);
        }
        Self::new(frames)
    }
}
