use thiserror::Error;

/// QUIC transport error codes (RFC 9000 Section 20.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorCode {
    NoError,
    InternalError,
    ConnectionRefused,
    FlowControlError,
    StreamLimitError,
    StreamStateError,
    FinalSizeError,
    FrameEncodingError,
    TransportParameterError,
    ProtocolViolation,
    CryptoBufferExceeded,
    /// Any code not listed above, kept verbatim
    Other(u64),
}

impl TransportErrorCode {
    pub fn from_u64(code: u64) -> Self {
        match code {
            0x00 => TransportErrorCode::NoError,
            0x01 => TransportErrorCode::InternalError,
            0x02 => TransportErrorCode::ConnectionRefused,
            0x03 => TransportErrorCode::FlowControlError,
            0x04 => TransportErrorCode::StreamLimitError,
            0x05 => TransportErrorCode::StreamStateError,
            0x06 => TransportErrorCode::FinalSizeError,
            0x07 => TransportErrorCode::FrameEncodingError,
            0x08 => TransportErrorCode::TransportParameterError,
            0x0a => TransportErrorCode::ProtocolViolation,
            0x0d => TransportErrorCode::CryptoBufferExceeded,
            other => TransportErrorCode::Other(other),
        }
    }

    pub fn to_u64(self) -> u64 {
        match self {
            TransportErrorCode::NoError => 0x00,
            TransportErrorCode::InternalError => 0x01,
            TransportErrorCode::ConnectionRefused => 0x02,
            TransportErrorCode::FlowControlError => 0x03,
            TransportErrorCode::StreamLimitError => 0x04,
            TransportErrorCode::StreamStateError => 0x05,
            TransportErrorCode::FinalSizeError => 0x06,
            TransportErrorCode::FrameEncodingError => 0x07,
            TransportErrorCode::TransportParameterError => 0x08,
            TransportErrorCode::ProtocolViolation => 0x0a,
            TransportErrorCode::CryptoBufferExceeded => 0x0d,
            TransportErrorCode::Other(code) => code,
        }
    }
}

impl std::fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}(0x{:x})", self, self.to_u64())
    }
}

/// Wire-level packet and frame errors. The packet carrying them is discarded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Packet too small: {size} bytes")]
    TooSmall { size: usize },

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Unsupported version: 0x{0:08x}")]
    UnsupportedVersion(u32),

    #[error("Unknown frame type: 0x{0:x}")]
    UnknownFrameType(u64),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Invalid connection ID length: {0}")]
    InvalidConnectionIdLength(usize),

    #[error("Empty payload")]
    EmptyPayload,

    #[error("Varint value out of range: {0}")]
    VarintOverflow(u64),

    #[error("Incomplete packet data")]
    IncompleteData,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed")]
    Decryption,

    #[error("Header protection failed: {0}")]
    HeaderProtection(String),

    #[error("No keys available for {0:?}")]
    KeysUnavailable(crate::quic::packet::EncryptionLevel),

    #[error("Retry integrity tag mismatch")]
    RetryIntegrity,

    #[error("TLS handshake failed: {0}")]
    Handshake(String),
}

/// Violations of the protocol state machine. Always fatal for the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Frame {frame} not allowed at {level:?} level")]
    FrameNotAllowed {
        frame: &'static str,
        level: crate::quic::packet::EncryptionLevel,
    },

    #[error("Frame {frame} not allowed in state {state:?}")]
    FrameNotAllowedInState {
        frame: &'static str,
        state: crate::quic::state::State,
    },

    #[error("Invalid state transition from {from:?} on {event}")]
    InvalidTransition {
        from: crate::quic::state::State,
        event: &'static str,
    },

    #[error("Acknowledged unsent packet {0}")]
    AckOfUnsentPacket(u64),

    #[error("Flow control violation: {0}")]
    FlowControlViolation(String),
}

/// Local misuse of a stream. Reported to the caller, connection unaffected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Stream {0} already finished")]
    Finished(u64),

    #[error("Stream {0} blocked by peer flow control")]
    Blocked(u64),

    #[error("Stream {0} is receive-only")]
    ReceiveOnly(u64),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connection closed")]
    Closed,

    #[error("Closed by peer: {code} ({reason})")]
    PeerClosed { code: u64, reason: String },

    #[error("Closed locally: {code} ({reason})")]
    LocallyClosed { code: u64, reason: String },

    #[error("Handshake timeout")]
    HandshakeTimeout,

    #[error("Idle timeout")]
    IdleTimeout,

    #[error("Version negotiation failed, peer offers {0:?}")]
    VersionNegotiation(Vec<u32>),

    #[error("Connection not ready: {0}")]
    NotReady(String),
}

#[derive(Error, Debug, Clone)]
pub enum QuicError {
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String), // String instead of std::io::Error for Clone
}

impl From<std::io::Error> for QuicError {
    fn from(err: std::io::Error) -> Self {
        QuicError::Io(err.to_string())
    }
}

impl From<::config::ConfigError> for QuicError {
    fn from(err: ::config::ConfigError) -> Self {
        QuicError::Config(err.to_string())
    }
}

impl QuicError {
    /// Whether this error must tear the connection down.
    ///
    /// Wire errors discard a single packet and local misuse is reported to
    /// the caller; protocol and flow-control violations are fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(self, QuicError::Protocol(_))
    }

    /// Transport error code carried in the CONNECTION_CLOSE frame for this error
    pub fn transport_code(&self) -> TransportErrorCode {
        match self {
            QuicError::Protocol(ProtocolError::FlowControlViolation(_)) => {
                TransportErrorCode::FlowControlError
            }
            QuicError::Protocol(_) => TransportErrorCode::ProtocolViolation,
            QuicError::Packet(PacketError::UnknownFrameType(_))
            | QuicError::Packet(PacketError::MalformedFrame(_)) => {
                TransportErrorCode::FrameEncodingError
            }
            QuicError::Connection(ConnectionError::HandshakeTimeout)
            | QuicError::Connection(ConnectionError::IdleTimeout) => TransportErrorCode::NoError,
            _ => TransportErrorCode::InternalError,
        }
    }
}

pub type Result<T> = std::result::Result<T, QuicError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_code_round_trip() {
        for code in [0x00, 0x01, 0x03, 0x07, 0x0a, 0x0d, 0x1ff] {
            assert_eq!(TransportErrorCode::from_u64(code).to_u64(), code);
        }
        assert_eq!(TransportErrorCode::from_u64(0x0a), TransportErrorCode::ProtocolViolation);
    }

    #[test]
    fn test_error_classification() {
        let violation = QuicError::Protocol(ProtocolError::FlowControlViolation("x".into()));
        assert!(violation.is_fatal());
        assert_eq!(violation.transport_code(), TransportErrorCode::FlowControlError);

        let wire = QuicError::Packet(PacketError::UnknownFrameType(0x40));
        assert!(!wire.is_fatal());

        let misuse = QuicError::Stream(StreamError::Finished(0));
        assert!(!misuse.is_fatal());
    }
}
