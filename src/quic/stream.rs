//! QUIC streams
//!
//! Sending goes through [`SendStream`], which turns writes into STREAM frames
//! on the connection. Receiving is handled by [`StreamHandler`] in the
//! inbound pipeline: it reassembles STREAM frames in offset order and hands
//! the data to a [`StreamListener`].

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::quic::error::{Result, StreamError, TransportErrorCode};
use crate::quic::flow_control::FlowController;
use crate::quic::frame::Frame;
use crate::quic::packet::{EncryptionLevel, Packet};
use crate::quic::pipeline::{Context, Flow, Handler};
use crate::quic::state::Role;

/// Stream identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct StreamId(u64);

impl StreamId {
    /// Create a new stream ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// The `index`-th stream of a kind opened by `initiator`
    pub fn nth(initiator: Role, bidirectional: bool, index: u64) -> Self {
        let initiator_bit = if initiator.is_client() { 0 } else { 0x1 };
        let direction_bit = if bidirectional { 0 } else { 0x2 };
        Self((index << 2) | direction_bit | initiator_bit)
    }

    /// Get the raw value
    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn initiator(&self) -> Role {
        if self.0 & 0x1 == 0 { Role::Client } else { Role::Server }
    }

    pub fn is_bidirectional(&self) -> bool {
        (self.0 & 0x2) == 0
    }

    pub fn is_unidirectional(&self) -> bool {
        !self.is_bidirectional()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a connection sends frames built outside the pipeline
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frames(&self, level: EncryptionLevel, frames: Vec<Frame>) -> Result<()>;
}

/// Receives stream data and stream signals from the peer
pub trait StreamListener: Send + Sync {
    /// In-order data; `fin` marks the final chunk
    fn on_data(&self, stream: StreamId, data: Bytes, fin: bool);

    fn on_reset(&self, stream: StreamId, error_code: u64, final_size: u64) {
        debug!("stream {} reset by peer: code {} final size {}", stream, error_code, final_size);
    }

    fn on_stop_sending(&self, stream: StreamId, error_code: u64) {
        debug!("peer stopped reading stream {}: code {}", stream, error_code);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Data { stream: StreamId, data: Bytes, fin: bool },
    Reset { stream: StreamId, error_code: u64, final_size: u64 },
    StopSending { stream: StreamId, error_code: u64 },
}

/// Listener forwarding every event into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: StreamEvent) {
        if self.tx.send(event).is_err() {
            warn!("stream event dropped, receiver gone");
        }
    }
}

impl StreamListener for ChannelListener {
    fn on_data(&self, stream: StreamId, data: Bytes, fin: bool) {
        self.forward(StreamEvent::Data { stream, data, fin });
    }

    fn on_reset(&self, stream: StreamId, error_code: u64, final_size: u64) {
        self.forward(StreamEvent::Reset { stream, error_code, final_size });
    }

    fn on_stop_sending(&self, stream: StreamId, error_code: u64) {
        self.forward(StreamEvent::StopSending { stream, error_code });
    }
}

#[derive(Debug)]
struct SendState {
    offset: u64,
    finished: bool,
}

/// Sending half of a stream
pub struct SendStream {
    id: StreamId,
    state: Mutex<SendState>,
    sink: Arc<dyn FrameSink>,
    flow: Arc<FlowController>,
}

impl SendStream {
    pub fn new(id: StreamId, sink: Arc<dyn FrameSink>, flow: Arc<FlowController>) -> Self {
        flow.open_stream(id);
        Self {
            id,
            state: Mutex::new(SendState { offset: 0, finished: false }),
            sink,
            flow,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Send `data` as one STREAM frame, closing the stream when `fin` is set.
    ///
    /// Fails without touching the connection if the stream is already
    /// finished or the peer's flow control limit leaves no room.
    pub async fn write(&self, data: &[u8], fin: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.finished {
            return Err(StreamError::Finished(self.id.value()).into());
        }

        let len = data.len() as u64;
        if let Err(e) = self.flow.reserve_send(self.id, len) {
            let blocked = self.flow.blocked_frames(self.id, len);
            if let Err(send_err) = self.sink.send_frames(EncryptionLevel::OneRtt, blocked).await {
                debug!("could not signal blocked stream {}: {}", self.id, send_err);
            }
            return Err(e);
        }

        let frame = Frame::Stream {
            stream_id: self.id,
            offset: state.offset,
            data: Bytes::copy_from_slice(data),
            fin,
        };
        if let Err(e) = self.sink.send_frames(EncryptionLevel::OneRtt, vec![frame]).await {
            self.flow.release_send(self.id, len);
            return Err(e);
        }

        state.offset += len;
        state.finished = fin;
        Ok(())
    }

    /// Abandon the stream with an application error code
    pub async fn reset(&self, error_code: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.finished {
            return Err(StreamError::Finished(self.id.value()).into());
        }
        let frame = Frame::ResetStream {
            stream_id: self.id,
            application_error_code: error_code,
            final_size: state.offset,
        };
        self.sink.send_frames(EncryptionLevel::OneRtt, vec![frame]).await?;
        state.finished = true;
        Ok(())
    }

    pub async fn is_finished(&self) -> bool {
        self.state.lock().await.finished
    }
}

impl fmt::Debug for SendStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendStream").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Receive-side reassembly of one stream (or one level's CRYPTO stream)
#[derive(Debug, Default)]
pub(crate) struct RecvBuffer {
    next_offset: u64,
    final_size: Option<u64>,
    pending: BTreeMap<u64, Bytes>,
    finished: bool,
}

impl RecvBuffer {
    /// Accept a frame and return the chunks now deliverable in order
    pub(crate) fn push(&mut self, offset: u64, data: Bytes, fin: bool) -> Vec<(Bytes, bool)> {
        if self.finished {
            return Vec::new();
        }
        let end = offset + data.len() as u64;
        if fin {
            self.final_size = Some(end);
        }
        if end > self.next_offset || self.final_size == Some(end) {
            // a shorter duplicate must not replace a longer buffered chunk
            match self.pending.get(&offset) {
                Some(existing) if existing.len() >= data.len() => {}
                _ => {
                    self.pending.insert(offset, data);
                }
            }
        }

        let mut ready = Vec::new();
        while let Some((&start, _)) = self.pending.range(..=self.next_offset).next_back() {
            let Some(chunk) = self.pending.remove(&start) else {
                break;
            };
            let chunk_end = start + chunk.len() as u64;
            if chunk_end < self.next_offset {
                continue;
            }
            let fresh = chunk.slice((self.next_offset - start) as usize..);
            self.next_offset = chunk_end;
            let fin = self.final_size == Some(chunk_end);
            if !fresh.is_empty() || fin {
                ready.push((fresh, fin));
            }
            if fin {
                self.finished = true;
                self.pending.clear();
                break;
            }
        }
        ready
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Inbound handler delivering stream frames to the listener
pub struct StreamHandler {
    role: Role,
    listener: Arc<dyn StreamListener>,
    buffers: DashMap<StreamId, RecvBuffer>,
    /// Streams fully delivered or reset; late retransmissions are dropped
    finished: DashSet<StreamId>,
}

impl StreamHandler {
    pub fn new(role: Role, listener: Arc<dyn StreamListener>) -> Self {
        Self { role, listener, buffers: DashMap::new(), finished: DashSet::new() }
    }

    fn deliver(&self, id: StreamId, offset: u64, data: Bytes, fin: bool) {
        if self.finished.contains(&id) {
            return;
        }
        let (ready, done) = {
            let mut buffer = self.buffers.entry(id).or_default();
            let ready = buffer.push(offset, data, fin);
            (ready, buffer.is_finished())
        };
        if done {
            self.buffers.remove(&id);
            self.finished.insert(id);
        }
        for (chunk, fin) in ready {
            self.listener.on_data(id, chunk, fin);
        }
    }

    pub fn open_buffers(&self) -> usize {
        self.buffers.len()
    }
}

impl fmt::Debug for StreamHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandler")
            .field("role", &self.role)
            .field("streams", &self.buffers.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Handler for StreamHandler {
    fn name(&self) -> &'static str {
        "streams"
    }

    async fn on_receive(&self, ctx: &mut Context, packet: Packet) -> Result<Flow> {
        for frame in packet.frames() {
            match frame {
                Frame::Stream { stream_id, offset, data, fin } => {
                    if stream_id.is_unidirectional() && stream_id.initiator() == self.role {
                        ctx.close(
                            TransportErrorCode::StreamStateError,
                            format!("data on send-only stream {}", stream_id),
                        );
                        return Ok(Flow::Stop);
                    }
                    self.deliver(*stream_id, *offset, data.clone(), *fin);
                }
                Frame::ResetStream { stream_id, application_error_code, final_size } => {
                    self.buffers.remove(stream_id);
                    if !self.finished.insert(*stream_id) {
                        continue;
                    }
                    self.listener.on_reset(*stream_id, *application_error_code, *final_size);
                }
                Frame::StopSending { stream_id, application_error_code } => {
                    self.listener.on_stop_sending(*stream_id, *application_error_code);
                }
                Frame::MaxStreams { maximum_streams, bidirectional } => {
                    debug!("peer allows {} {} streams", maximum_streams, if *bidirectional { "bidi" } else { "uni" });
                }
                _ => {}
            }
        }
        Ok(Flow::Next(packet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quic::error::QuicError;
    use crate::quic::flow_control::FlowControlConfig;
    use crate::quic::error::ConnectionError;
    use crate::quic::frame::Payload;
    use crate::quic::number::PacketNumber;
    use crate::quic::packet::{ConnectionId, QUIC_VERSION_1};
    use crate::quic::pipeline::ConnectionFacts;
    use crate::quic::state::State;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        sent: SyncMutex<Vec<(EncryptionLevel, Vec<Frame>)>>,
        failing: AtomicBool,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_frames(&self, level: EncryptionLevel, frames: Vec<Frame>) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ConnectionError::Closed.into());
            }
            self.sent.lock().push((level, frames));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Collect(SyncMutex<Vec<(StreamId, Bytes, bool)>>);

    impl StreamListener for Collect {
        fn on_data(&self, stream: StreamId, data: Bytes, fin: bool) {
            self.0.lock().push((stream, data, fin));
        }
    }

    fn one_rtt(frames: Vec<Frame>) -> Packet {
        Packet::Short {
            dcid: ConnectionId::from_slice(&[7; 8]).unwrap(),
            key_phase: false,
            number: PacketNumber::ZERO,
            payload: Payload::new(frames).unwrap(),
        }
    }

    fn context() -> Context {
        Context::new(ConnectionFacts {
            role: Role::Server,
            peer_addr: "127.0.0.1:1".parse().unwrap(),
            version: QUIC_VERSION_1,
            state: State::Ready,
        })
    }

    #[test]
    fn test_stream_id_layout() {
        assert_eq!(StreamId::nth(Role::Client, true, 0).value(), 0);
        assert_eq!(StreamId::nth(Role::Server, true, 1).value(), 5);
        let uni = StreamId::nth(Role::Client, false, 2);
        assert_eq!(uni.value(), 10);
        assert!(uni.is_unidirectional());
        assert_eq!(uni.initiator(), Role::Client);
    }

    #[tokio::test]
    async fn test_write_after_fin_fails() {
        let sink = Arc::new(RecordingSink::default());
        let flow = Arc::new(FlowController::new(FlowControlConfig::default()));
        let stream = SendStream::new(StreamId::new(0), sink.clone(), flow);

        stream.write(b"hel", false).await.unwrap();
        stream.write(b"lo", true).await.unwrap();
        let err = stream.write(b"!", false).await.unwrap_err();
        assert!(matches!(err, QuicError::Stream(StreamError::Finished(0))));
        assert!(!err.is_fatal());

        let sent = sink.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[1].1,
            vec![Frame::Stream { stream_id: StreamId::new(0), offset: 3, data: Bytes::from_static(b"lo"), fin: true }]
        );
    }

    #[tokio::test]
    async fn test_blocked_write_signals_peer() {
        let sink = Arc::new(RecordingSink::default());
        let flow = Arc::new(FlowController::new(FlowControlConfig { initial_max_data: 4, initial_max_stream_data: 4 }));
        let stream = SendStream::new(StreamId::new(0), sink.clone(), flow);

        let err = stream.write(b"too long", false).await.unwrap_err();
        assert!(matches!(err, QuicError::Stream(StreamError::Blocked(0))));
        let sent = sink.sent.lock();
        assert!(sent[0].1.contains(&Frame::DataBlocked { maximum_data: 4 }));
    }

    #[test]
    fn test_reassembly_in_order() {
        let mut buffer = RecvBuffer::default();
        assert!(buffer.push(3, Bytes::from_static(b"lo"), true).is_empty());
        let ready = buffer.push(0, Bytes::from_static(b"hel"), false);
        assert_eq!(
            ready,
            vec![(Bytes::from_static(b"hel"), false), (Bytes::from_static(b"lo"), true)]
        );
        // duplicates after the final chunk are ignored
        assert!(buffer.push(0, Bytes::from_static(b"hel"), false).is_empty());
    }

    #[test]
    fn test_reassembly_overlap_and_empty_fin() {
        let mut buffer = RecvBuffer::default();
        assert_eq!(buffer.push(0, Bytes::from_static(b"abcd"), false), vec![(Bytes::from_static(b"abcd"), false)]);
        assert_eq!(buffer.push(2, Bytes::from_static(b"cdef"), false), vec![(Bytes::from_static(b"ef"), false)]);
        assert_eq!(buffer.push(6, Bytes::new(), true), vec![(Bytes::new(), true)]);
    }

    #[tokio::test]
    async fn test_failed_send_returns_flow_credit() {
        let sink = Arc::new(RecordingSink::default());
        let flow = Arc::new(FlowController::new(FlowControlConfig { initial_max_data: 8, initial_max_stream_data: 8 }));
        let stream = SendStream::new(StreamId::new(0), sink.clone(), flow.clone());

        sink.failing.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            assert!(stream.write(b"12345678", false).await.is_err());
        }
        assert_eq!(flow.connection_stats().sent, 0);
        assert_eq!(flow.stream_stats(StreamId::new(0)).unwrap().sent, 0);

        sink.failing.store(false, Ordering::SeqCst);
        stream.write(b"12345678", true).await.unwrap();
        let sent = sink.sent.lock();
        assert_eq!(
            sent[0].1,
            vec![Frame::Stream {
                stream_id: StreamId::new(0),
                offset: 0,
                data: Bytes::from_static(b"12345678"),
                fin: true
            }]
        );
    }

    #[test]
    fn test_shorter_duplicate_keeps_longer_chunk() {
        let mut buffer = RecvBuffer::default();
        assert!(buffer.push(5, Bytes::from_static(b"xyzabc"), false).is_empty());
        assert!(buffer.push(5, Bytes::from_static(b"x"), false).is_empty());
        let ready = buffer.push(0, Bytes::from_static(b"hello"), false);
        let delivered: Vec<u8> = ready.iter().flat_map(|(chunk, _)| chunk.iter().copied()).collect();
        assert_eq!(delivered, b"helloxyzabc");
    }

    #[test]
    fn test_longer_duplicate_extends_buffered_chunk() {
        let mut buffer = RecvBuffer::default();
        assert!(buffer.push(4, Bytes::from_static(b"ef"), false).is_empty());
        assert!(buffer.push(4, Bytes::from_static(b"efgh"), true).is_empty());
        let ready = buffer.push(0, Bytes::from_static(b"abcd"), false);
        assert_eq!(
            ready,
            vec![(Bytes::from_static(b"abcd"), false), (Bytes::from_static(b"efgh"), true)]
        );
    }

    #[tokio::test]
    async fn test_finished_stream_releases_buffer() {
        let listener = Arc::new(Collect::default());
        let handler = StreamHandler::new(Role::Server, listener.clone());
        let id = StreamId::new(0);
        let frame = |offset: u64, data: &'static [u8], fin: bool| Frame::Stream {
            stream_id: id,
            offset,
            data: Bytes::from_static(data),
            fin,
        };

        let mut ctx = context();
        handler.on_receive(&mut ctx, one_rtt(vec![frame(3, b"lo", true)])).await.unwrap();
        assert_eq!(handler.open_buffers(), 1);
        handler.on_receive(&mut ctx, one_rtt(vec![frame(0, b"hel", false)])).await.unwrap();
        assert_eq!(handler.open_buffers(), 0);

        // a late retransmission is not delivered a second time
        handler.on_receive(&mut ctx, one_rtt(vec![frame(0, b"hel", false)])).await.unwrap();
        assert_eq!(handler.open_buffers(), 0);
        let seen = listener.0.lock();
        assert_eq!(
            *seen,
            vec![(id, Bytes::from_static(b"hel"), false), (id, Bytes::from_static(b"lo"), true)]
        );
    }
}
