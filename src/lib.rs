// QUIC connection core
pub mod quic;

// Handshake integration
pub mod tls;

// Datagram transport abstraction
pub mod transport;

// Configuration and logging bootstrap
pub mod config;
pub mod logging;

// Re-export main types
pub use quic::{Connection, ConnectionBuilder, QuicError, Result, Role, State, StreamId};

pub mod prelude {
    pub use crate::config::{ConnectionConfig, LoggingConfig, QuicConfig};
    pub use crate::quic::{
        ChannelListener, Connection, ConnectionBuilder, EncryptionLevel, Frame, SendStream, State, StreamEvent,
        StreamId, StreamListener, TransportErrorCode,
    };
    pub use crate::tls::{LoopbackTls, TlsSession};
    pub use crate::transport::{MemoryTransport, Transport};
    pub use anyhow::Result;
}
