//! QUIC flow control
//!
//! Connection-level and stream-level limits as specified in RFC 9000
//! Section 4. Receive limits are enforced on incoming STREAM frames; send
//! limits are reserved before a stream writes.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::quic::error::{ProtocolError, Result, StreamError};
use crate::quic::frame::Frame;
use crate::quic::packet::{EncryptionLevel, Packet};
use crate::quic::pipeline::{Context, Flow, Handler};
use crate::quic::stream::StreamId;

/// Flow control configuration
#[derive(Debug, Clone, Copy)]
pub struct FlowControlConfig {
    /// Initial connection-level limit, both directions
    pub initial_max_data: u64,
    /// Initial stream-level limit, both directions
    pub initial_max_stream_data: u64,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            initial_max_data: 1024 * 1024,        // 1MB
            initial_max_stream_data: 256 * 1024,  // 256KB
        }
    }
}

/// Flow control window for a single stream or the connection
#[derive(Debug)]
pub struct FlowControlWindow {
    /// Peer's receive limit
    send_limit: AtomicU64,
    sent: AtomicU64,
    /// Our receive limit
    receive_limit: AtomicU64,
    /// Highest offset (stream) or total bytes (connection) received
    received: AtomicU64,
    window: u64,
}

impl FlowControlWindow {
    pub fn new(initial_send_limit: u64, initial_receive_limit: u64) -> Self {
        Self {
            send_limit: AtomicU64::new(initial_send_limit),
            sent: AtomicU64::new(0),
            receive_limit: AtomicU64::new(initial_receive_limit),
            received: AtomicU64::new(0),
            window: initial_receive_limit,
        }
    }

    /// Reserve send capacity, returning false if the peer's limit would be exceeded
    pub fn reserve_send(&self, amount: u64) -> bool {
        loop {
            let current = self.sent.load(Ordering::Acquire);
            if current + amount > self.send_limit.load(Ordering::Acquire) {
                return false;
            }
            if self
                .sent
                .compare_exchange_weak(current, current + amount, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn release_send(&self, amount: u64) {
        self.sent.fetch_sub(amount, Ordering::AcqRel);
    }

    pub fn send_capacity(&self) -> u64 {
        self.send_limit.load(Ordering::Acquire).saturating_sub(self.sent.load(Ordering::Acquire))
    }

    pub fn send_limit(&self) -> u64 {
        self.send_limit.load(Ordering::Acquire)
    }

    /// Raise the send limit (MAX_DATA / MAX_STREAM_DATA); lower values are ignored
    pub fn update_send_limit(&self, new_limit: u64) {
        let previous = self.send_limit.fetch_max(new_limit, Ordering::AcqRel);
        if new_limit > previous {
            debug!("send limit raised {} -> {}", previous, new_limit);
        }
    }

    /// Raise the received high-water mark to `end`, returning the increase
    fn raise_received(&self, end: u64) -> std::result::Result<u64, u64> {
        let limit = self.receive_limit.load(Ordering::Acquire);
        if end > limit {
            return Err(limit);
        }
        let previous = self.received.fetch_max(end, Ordering::AcqRel);
        Ok(end.saturating_sub(previous))
    }

    /// Add `amount` received bytes
    fn add_received(&self, amount: u64) -> std::result::Result<(), u64> {
        loop {
            let current = self.received.load(Ordering::Acquire);
            let limit = self.receive_limit.load(Ordering::Acquire);
            if current + amount > limit {
                return Err(limit);
            }
            if self
                .received
                .compare_exchange_weak(current, current + amount, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// New receive limit once half of the window is used
    fn next_receive_limit(&self) -> Option<u64> {
        let received = self.received.load(Ordering::Acquire);
        let limit = self.receive_limit.load(Ordering::Acquire);
        if limit.saturating_sub(received) > self.window / 2 {
            return None;
        }
        let new_limit = received + self.window;
        self.receive_limit
            .compare_exchange(limit, new_limit, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| new_limit)
    }

    pub fn stats(&self) -> FlowControlStats {
        FlowControlStats {
            send_limit: self.send_limit.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            receive_limit: self.receive_limit.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
        }
    }
}

/// Flow control statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowControlStats {
    pub send_limit: u64,
    pub sent: u64,
    pub receive_limit: u64,
    pub received: u64,
}

/// Connection-level flow controller with per-stream windows
#[derive(Debug)]
pub struct FlowController {
    config: FlowControlConfig,
    connection: FlowControlWindow,
    streams: DashMap<StreamId, FlowControlWindow>,
    /// MAX_DATA / MAX_STREAM_DATA frames waiting for the next 1-RTT packet
    pending_updates: Mutex<Vec<Frame>>,
}

impl FlowController {
    pub fn new(config: FlowControlConfig) -> Self {
        Self {
            config,
            connection: FlowControlWindow::new(config.initial_max_data, config.initial_max_data),
            streams: DashMap::new(),
            pending_updates: Mutex::new(Vec::new()),
        }
    }

    fn stream_window(&self, id: StreamId) -> dashmap::mapref::one::Ref<'_, StreamId, FlowControlWindow> {
        if let Some(window) = self.streams.get(&id) {
            return window;
        }
        self.streams
            .entry(id)
            .or_insert_with(|| {
                FlowControlWindow::new(self.config.initial_max_stream_data, self.config.initial_max_stream_data)
            })
            .downgrade()
    }

    /// Account for stream data ending at `end`; errors are flow control violations
    pub fn on_stream_data(&self, id: StreamId, end: u64) -> Result<()> {
        let increase = {
            let window = self.stream_window(id);
            let increase = window.raise_received(end).map_err(|limit| {
                ProtocolError::FlowControlViolation(format!("stream {} offset {} over limit {}", id, end, limit))
            })?;
            if let Some(limit) = window.next_receive_limit() {
                self.pending_updates
                    .lock()
                    .push(Frame::MaxStreamData { stream_id: id, maximum_stream_data: limit });
            }
            increase
        };

        self.connection.add_received(increase).map_err(|limit| {
            ProtocolError::FlowControlViolation(format!("connection data over limit {}", limit))
        })?;
        if let Some(limit) = self.connection.next_receive_limit() {
            self.pending_updates.lock().push(Frame::MaxData { maximum_data: limit });
        }
        Ok(())
    }

    pub fn on_max_data(&self, maximum_data: u64) {
        self.connection.update_send_limit(maximum_data);
    }

    /// Create the window for a locally opened stream
    pub fn open_stream(&self, id: StreamId) {
        drop(self.stream_window(id));
    }

    /// Raise the send limit of a known stream. Limits for streams that were
    /// never opened or seen are dropped.
    pub fn on_max_stream_data(&self, id: StreamId, maximum_stream_data: u64) {
        match self.streams.get(&id) {
            Some(window) => window.update_send_limit(maximum_stream_data),
            None => debug!("MAX_STREAM_DATA for unknown stream {} ignored", id),
        }
    }

    /// Reserve `amount` bytes on `id` against the peer's limits
    pub fn reserve_send(&self, id: StreamId, amount: u64) -> Result<()> {
        let window = self.stream_window(id);
        if !window.reserve_send(amount) {
            return Err(StreamError::Blocked(id.value()).into());
        }
        if !self.connection.reserve_send(amount) {
            window.release_send(amount);
            return Err(StreamError::Blocked(id.value()).into());
        }
        Ok(())
    }

    /// Give back a reservation whose data was never sent
    pub fn release_send(&self, id: StreamId, amount: u64) {
        if let Some(window) = self.streams.get(&id) {
            window.release_send(amount);
        }
        self.connection.release_send(amount);
    }

    /// BLOCKED frames describing why `id` cannot send `amount` more bytes
    pub fn blocked_frames(&self, id: StreamId, amount: u64) -> Vec<Frame> {
        let mut frames = Vec::new();
        if self.connection.send_capacity() < amount {
            frames.push(Frame::DataBlocked { maximum_data: self.connection.send_limit() });
        }
        let window = self.stream_window(id);
        if window.send_capacity() < amount {
            frames.push(Frame::StreamDataBlocked { stream_id: id, maximum_stream_data: window.send_limit() });
        }
        frames
    }

    pub fn take_updates(&self) -> Vec<Frame> {
        std::mem::take(&mut *self.pending_updates.lock())
    }

    pub fn connection_stats(&self) -> FlowControlStats {
        self.connection.stats()
    }

    pub fn stream_stats(&self, id: StreamId) -> Option<FlowControlStats> {
        self.streams.get(&id).map(|window| window.stats())
    }
}

/// Pipeline handler enforcing receive limits and piggybacking window updates
#[derive(Debug)]
pub struct FlowControlHandler {
    controller: Arc<FlowController>,
}

impl FlowControlHandler {
    pub fn new(controller: Arc<FlowController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl Handler for FlowControlHandler {
    fn name(&self) -> &'static str {
        "flow-control"
    }

    async fn on_receive(&self, _ctx: &mut Context, packet: Packet) -> Result<Flow> {
        for frame in packet.frames() {
            match frame {
                Frame::Stream { stream_id, offset, data, .. } => {
                    self.controller.on_stream_data(*stream_id, offset + data.len() as u64)?;
                }
                Frame::ResetStream { stream_id, final_size, .. } => {
                    self.controller.on_stream_data(*stream_id, *final_size)?;
                }
                Frame::MaxData { maximum_data } => self.controller.on_max_data(*maximum_data),
                Frame::MaxStreamData { stream_id, maximum_stream_data } => {
                    self.controller.on_max_stream_data(*stream_id, *maximum_stream_data)
                }
                Frame::DataBlocked { maximum_data } => {
                    warn!("peer blocked at connection limit {}", maximum_data);
                }
                Frame::StreamDataBlocked { stream_id, maximum_stream_data } => {
                    warn!("peer blocked on stream {} at {}", stream_id, maximum_stream_data);
                }
                _ => {}
            }
        }
        Ok(Flow::Next(packet))
    }

    async fn before_send(&self, _ctx: &mut Context, mut packet: Packet) -> Result<Flow> {
        if packet.level() == Some(EncryptionLevel::OneRtt) {
            let updates = self.controller.take_updates();
            if let Some(payload) = packet.payload_mut() {
                for frame in updates {
                    payload.push(frame);
                }
            }
        }
        Ok(Flow::Next(packet))
    }
}
