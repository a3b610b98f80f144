//! QUIC protocol implementation
//!
//! This module contains the connection core: wire codec, packet protection,
//! packet numbers and ack ranges, the per-level reliability engine, the
//! connection state machine and the handler pipeline tying them together.

pub mod ack_range;
pub mod clock;
pub mod codec;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod flow_control;
pub mod frame;
pub mod number;
pub mod packet;
pub mod pipeline;
pub mod reliability;
pub mod state;
pub mod stream;
pub mod varint;

// Re-export commonly used items
pub use ack_range::AckRange;
pub use clock::{Clock, ManualClock, SystemClock};
pub use connection::{Connection, ConnectionBuilder, ConnectionStats, HandshakeStatus};
pub use crypto::{Aead, RingAead};
pub use error::{ConnectionError, ProtocolError, QuicError, Result, StreamError, TransportErrorCode};
pub use flow_control::{FlowControlConfig, FlowController};
pub use frame::{Frame, Payload};
pub use number::PacketNumber;
pub use packet::{ConnectionId, EncryptionLevel, Packet};
pub use pipeline::{Context, Direction, Flow, Handler, Pipeline};
pub use reliability::Reliability;
pub use state::{Role, State};
pub use stream::{ChannelListener, SendStream, StreamEvent, StreamId, StreamListener};
