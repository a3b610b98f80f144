//! Per-level reliability: outstanding packets, ack generation and resend
//!
//! Each encryption level has its own store of sent packets awaiting
//! acknowledgment and its own queue of received packet numbers awaiting an
//! ACK frame. Both are concurrent maps so the receive path, the send path
//! and the resend timer can touch them without a shared lock.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::quic::ack_range::{self, AckRange};
use crate::quic::clock::Clock;
use crate::quic::error::{ProtocolError, Result};
use crate::quic::frame::Frame;
use crate::quic::number::PacketNumber;
use crate::quic::packet::{EncryptionLevel, Packet};
use crate::quic::pipeline::{Context, Flow, Handler};

/// A sent packet kept until it is acknowledged or resent
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub number: PacketNumber,
    pub frames: Vec<Frame>,
    pub time_sent: Instant,
}

/// Packet numbers are stored plus one so that zero means "none"
fn load_number(cell: &AtomicU64) -> Option<PacketNumber> {
    match cell.load(Ordering::Acquire) {
        0 => None,
        encoded => PacketNumber::new(encoded - 1).ok(),
    }
}

/// Raise `cell` to `value`, never lowering it
fn fetch_max(cell: &AtomicU64, value: u64) {
    let encoded = value + 1;
    let mut current = cell.load(Ordering::Acquire);
    while encoded > current {
        match cell.compare_exchange_weak(current, encoded, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}

#[derive(Debug, Default)]
struct Space {
    sent: DashMap<u64, SentPacket>,
    /// Received packet number -> time it was queued
    ack_queue: DashMap<u64, Instant>,
    largest_acked: AtomicU64,
    largest_received: AtomicU64,
    largest_sent: AtomicU64,
}

/// Reliability counters for observability
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReliabilityStats {
    pub outstanding: [usize; 3],
    pub pending_acks: [usize; 3],
    pub largest_acked: [Option<u64>; 3],
    pub acknowledged: u64,
    pub retransmitted: u64,
}

#[derive(Debug)]
pub struct Reliability {
    spaces: [Space; 3],
    clock: Arc<dyn Clock>,
    ack_delay_exponent: u8,
    resend_threshold: Duration,
    acknowledged: AtomicU64,
    retransmitted: AtomicU64,
}

impl Reliability {
    pub fn new(clock: Arc<dyn Clock>, ack_delay_exponent: u8, resend_threshold: Duration) -> Self {
        Self {
            spaces: Default::default(),
            clock,
            ack_delay_exponent,
            resend_threshold,
            acknowledged: AtomicU64::new(0),
            retransmitted: AtomicU64::new(0),
        }
    }

    fn space(&self, level: EncryptionLevel) -> &Space {
        &self.spaces[level.index()]
    }

    /// Retain the retransmittable frames of a sent packet
    pub fn on_packet_sent(&self, level: EncryptionLevel, number: PacketNumber, frames: &[Frame]) {
        let space = self.space(level);
        fetch_max(&space.largest_sent, number.value());

        let retained: Vec<Frame> = frames.iter().filter(|f| f.is_retransmittable()).cloned().collect();
        if retained.is_empty() {
            return;
        }
        trace!("{} packet {} retained with {} frames", level, number, retained.len());
        space.sent.insert(
            number.value(),
            SentPacket { number, frames: retained, time_sent: self.clock.now() },
        );
    }

    pub fn has_pending_acks(&self, level: EncryptionLevel) -> bool {
        !self.space(level).ack_queue.is_empty()
    }

    /// Drain the ack queue of `level` into an ACK frame
    pub fn drain_ack_frame(&self, level: EncryptionLevel) -> Option<Frame> {
        let queue = &self.space(level).ack_queue;
        let keys: Vec<u64> = queue.iter().map(|entry| *entry.key()).collect();

        let mut drained = Vec::with_capacity(keys.len());
        let mut latest: Option<(u64, Instant)> = None;
        for key in keys {
            if let Some((number, queued_at)) = queue.remove(&key) {
                if latest.is_none_or(|(largest, _)| number > largest) {
                    latest = Some((number, queued_at));
                }
                drained.push(number);
            }
        }

        let (_, queued_at) = latest?;
        let ranges = ack_range::ranges_from_numbers(drained);
        // Initial and Handshake ACKs always report zero delay (RFC 9000 Section 19.3)
        let ack_delay = match level {
            EncryptionLevel::OneRtt => {
                let elapsed = self.clock.now().saturating_duration_since(queued_at);
                (elapsed.as_micros() as u64) >> self.ack_delay_exponent
            }
            EncryptionLevel::Initial | EncryptionLevel::Handshake => 0,
        };

        debug!("{} ACK {:?} delay {}", level, ranges.iter().map(|r| r.to_string()).collect::<Vec<_>>(), ack_delay);
        Some(Frame::Ack { ack_delay, ranges })
    }

    /// Record a received packet and apply the ACK frames it carries
    pub fn on_packet_received(&self, level: EncryptionLevel, packet: &Packet) -> Result<()> {
        let space = self.space(level);
        if let Some(number) = packet.number() {
            space.ack_queue.insert(number.value(), self.clock.now());
            fetch_max(&space.largest_received, number.value());
        }

        match level {
            EncryptionLevel::Handshake => self.clear_store(EncryptionLevel::Initial),
            EncryptionLevel::OneRtt => self.clear_store(EncryptionLevel::Handshake),
            EncryptionLevel::Initial => {}
        }

        for frame in packet.frames() {
            if let Frame::Ack { ranges, .. } = frame {
                self.on_ack(level, ranges)?;
            }
        }
        Ok(())
    }

    fn on_ack(&self, level: EncryptionLevel, ranges: &[AckRange]) -> Result<()> {
        let space = self.space(level);
        let Some(largest) = ranges.first().map(|r| r.largest) else {
            return Ok(());
        };
        let sent_any = load_number(&space.largest_sent).map(PacketNumber::value);
        if sent_any.is_none_or(|sent| largest > sent) {
            return Err(ProtocolError::AckOfUnsentPacket(largest).into());
        }

        let acked: Vec<u64> = space
            .sent
            .iter()
            .map(|entry| *entry.key())
            .filter(|number| ranges.iter().any(|r| r.contains(*number)))
            .collect();
        let mut removed = 0;
        for number in acked {
            if space.sent.remove(&number).is_some() {
                removed += 1;
            }
        }
        self.acknowledged.fetch_add(removed, Ordering::Relaxed);
        fetch_max(&space.largest_acked, largest);

        trace!("{} acked {} packets, largest {}", level, removed, largest);
        Ok(())
    }

    /// Whether a received packet calls for an immediate standalone ACK
    pub fn should_flush(&self, packet: &Packet) -> bool {
        match (packet.level(), packet.payload()) {
            (Some(EncryptionLevel::OneRtt), Some(payload)) => !payload.is_ack_only(),
            _ => false,
        }
    }

    fn clear_store(&self, level: EncryptionLevel) {
        let store = &self.space(level).sent;
        if !store.is_empty() {
            debug!("clearing {} outstanding {} packets", store.len(), level);
            store.clear();
        }
    }

    /// Drop all state of a level whose keys were discarded
    pub fn discard_level(&self, level: EncryptionLevel) {
        let space = self.space(level);
        space.sent.clear();
        space.ack_queue.clear();
    }

    /// Take every packet older than the resend threshold and return its
    /// frames for re-injection, grouped by level
    pub fn take_due(&self) -> Vec<(EncryptionLevel, Vec<Frame>)> {
        let now = self.clock.now();
        let mut due = Vec::new();
        for level in EncryptionLevel::ALL {
            let store = &self.space(level).sent;
            let expired: Vec<u64> = store
                .iter()
                .filter(|entry| now.saturating_duration_since(entry.time_sent) >= self.resend_threshold)
                .map(|entry| *entry.key())
                .collect();

            let mut frames = Vec::new();
            for number in expired {
                if let Some((_, packet)) = store.remove(&number) {
                    debug!("resending frames of {} packet {}", level, packet.number);
                    self.retransmitted.fetch_add(1, Ordering::Relaxed);
                    frames.extend(packet.frames);
                }
            }
            if !frames.is_empty() {
                due.push((level, frames));
            }
        }
        due
    }

    /// Remove and return the retained frames of `level`, oldest first
    pub fn take_all(&self, level: EncryptionLevel) -> Vec<Frame> {
        let store = &self.space(level).sent;
        let mut numbers: Vec<u64> = store.iter().map(|entry| *entry.key()).collect();
        numbers.sort_unstable();
        numbers
            .into_iter()
            .filter_map(|number| store.remove(&number))
            .flat_map(|(_, packet)| packet.frames)
            .collect()
    }

    pub fn largest_acked(&self, level: EncryptionLevel) -> Option<PacketNumber> {
        load_number(&self.space(level).largest_acked)
    }

    pub fn largest_received(&self, level: EncryptionLevel) -> Option<PacketNumber> {
        load_number(&self.space(level).largest_received)
    }

    pub fn outstanding(&self, level: EncryptionLevel) -> usize {
        self.space(level).sent.len()
    }

    pub fn is_outstanding(&self, level: EncryptionLevel, number: u64) -> bool {
        self.space(level).sent.contains_key(&number)
    }

    pub fn stats(&self) -> ReliabilityStats {
        let mut stats = ReliabilityStats {
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            retransmitted: self.retransmitted.load(Ordering::Relaxed),
            ..Default::default()
        };
        for level in EncryptionLevel::ALL {
            let i = level.index();
            stats.outstanding[i] = self.space(level).sent.len();
            stats.pending_acks[i] = self.space(level).ack_queue.len();
            stats.largest_acked[i] = self.largest_acked(level).map(PacketNumber::value);
        }
        stats
    }
}

/// Pipeline handler wiring [`Reliability`] into both directions.
///
/// Inbound it records packets for acking, applies ACKs and stops acks-only
/// packets. Outbound it attaches pending ACKs and retains the final packet,
/// so it belongs at the end of the outbound chain.
#[derive(Debug)]
pub struct ReliabilityHandler {
    engine: Arc<Reliability>,
}

impl ReliabilityHandler {
    pub fn new(engine: Arc<Reliability>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Handler for ReliabilityHandler {
    fn name(&self) -> &'static str {
        "reliability"
    }

    async fn on_receive(&self, ctx: &mut Context, packet: Packet) -> Result<Flow> {
        let Some(level) = packet.level() else {
            return Ok(Flow::Next(packet));
        };
        self.engine.on_packet_received(level, &packet)?;
        if self.engine.should_flush(&packet) {
            ctx.request_ack_flush(level);
        }
        match packet.payload() {
            Some(payload) if payload.is_ack_only() => Ok(Flow::Stop),
            _ => Ok(Flow::Next(packet)),
        }
    }

    async fn before_send(&self, _ctx: &mut Context, mut packet: Packet) -> Result<Flow> {
        let Some(level) = packet.level() else {
            return Ok(Flow::Next(packet));
        };
        if let (Some(ack), Some(payload)) = (self.engine.drain_ack_frame(level), packet.payload_mut()) {
            payload.push(ack);
        }
        if let Some(number) = packet.number() {
            self.engine.on_packet_sent(level, number, packet.frames());
        }
        Ok(Flow::Next(packet))
    }
}
