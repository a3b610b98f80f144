//! Ordered inbound/outbound handler chains
//!
//! Every packet the connection receives runs through the inbound chain and
//! every packet it sends runs through the outbound chain. Handlers see the
//! packet by value and either pass it on (possibly replaced) or stop it.
//! Side effects (extra sends, close requests, ack flushes) are collected in
//! the [`Context`] and applied by the connection once the traversal ends.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::quic::error::{Result, TransportErrorCode};
use crate::quic::frame::Frame;
use crate::quic::packet::{EncryptionLevel, Packet};
use crate::quic::state::{Role, State};

/// Outcome of one handler
#[derive(Debug)]
pub enum Flow {
    /// Hand the packet to the next handler
    Next(Packet),
    /// Stop the traversal; the packet is not delivered or sent any further
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Read-only facts about the connection, snapshot at traversal start
#[derive(Debug, Clone)]
pub struct ConnectionFacts {
    pub role: Role,
    pub peer_addr: SocketAddr,
    pub version: u32,
    pub state: State,
}

/// Close requested by a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseRequest {
    pub code: TransportErrorCode,
    pub reason: String,
}

/// Per-traversal context passed explicitly to each handler
#[derive(Debug)]
pub struct Context {
    facts: ConnectionFacts,
    sends: Vec<(EncryptionLevel, Vec<Frame>)>,
    close: Option<CloseRequest>,
    ack_flush: Option<EncryptionLevel>,
}

impl Context {
    pub fn new(facts: ConnectionFacts) -> Self {
        Self { facts, sends: Vec::new(), close: None, ack_flush: None }
    }

    pub fn facts(&self) -> &ConnectionFacts {
        &self.facts
    }

    pub fn role(&self) -> Role {
        self.facts.role
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.facts.peer_addr
    }

    pub fn version(&self) -> u32 {
        self.facts.version
    }

    pub fn state(&self) -> State {
        self.facts.state
    }

    /// Queue frames to be sent at `level` after this traversal
    pub fn send(&mut self, level: EncryptionLevel, frames: Vec<Frame>) {
        if !frames.is_empty() {
            self.sends.push((level, frames));
        }
    }

    /// Request a connection close. The first request wins.
    pub fn close(&mut self, code: TransportErrorCode, reason: impl Into<String>) {
        if self.close.is_none() {
            self.close = Some(CloseRequest { code, reason: reason.into() });
        }
    }

    /// Ask the connection to send pending ACKs at `level` right away
    pub fn request_ack_flush(&mut self, level: EncryptionLevel) {
        self.ack_flush = Some(level);
    }

    pub fn close_requested(&self) -> bool {
        self.close.is_some()
    }

    pub fn into_effects(self) -> Effects {
        Effects { sends: self.sends, close: self.close, ack_flush: self.ack_flush }
    }
}

/// Side effects collected during one traversal
#[derive(Debug, Default)]
pub struct Effects {
    pub sends: Vec<(EncryptionLevel, Vec<Frame>)>,
    pub close: Option<CloseRequest>,
    pub ack_flush: Option<EncryptionLevel>,
}

/// A protocol behavior plugged into the pipeline
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_receive(&self, _ctx: &mut Context, packet: Packet) -> Result<Flow> {
        Ok(Flow::Next(packet))
    }

    async fn before_send(&self, _ctx: &mut Context, packet: Packet) -> Result<Flow> {
        Ok(Flow::Next(packet))
    }
}

#[derive(Default)]
pub struct Pipeline {
    inbound: RwLock<Vec<Arc<dyn Handler>>>,
    outbound: RwLock<Vec<Arc<dyn Handler>>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    fn chain(&self, direction: Direction) -> &RwLock<Vec<Arc<dyn Handler>>> {
        match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }

    pub fn add_first(&self, direction: Direction, handler: Arc<dyn Handler>) {
        self.chain(direction).write().insert(0, handler);
    }

    pub fn add_last(&self, direction: Direction, handler: Arc<dyn Handler>) {
        self.chain(direction).write().push(handler);
    }

    /// Remove every handler called `name`, returning whether any was found
    pub fn remove(&self, direction: Direction, name: &str) -> bool {
        let mut chain = self.chain(direction).write();
        let before = chain.len();
        chain.retain(|handler| handler.name() != name);
        chain.len() != before
    }

    pub fn names(&self, direction: Direction) -> Vec<&'static str> {
        self.chain(direction).read().iter().map(|handler| handler.name()).collect()
    }

    /// Run `packet` through a snapshot of the chain. `None` means a handler
    /// stopped it.
    pub async fn run(&self, direction: Direction, ctx: &mut Context, packet: Packet) -> Result<Option<Packet>> {
        let handlers: Vec<Arc<dyn Handler>> = self.chain(direction).read().clone();
        let mut packet = packet;
        for handler in handlers {
            let flow = match direction {
                Direction::Inbound => handler.on_receive(ctx, packet).await?,
                Direction::Outbound => handler.before_send(ctx, packet).await?,
            };
            match flow {
                Flow::Next(next) => packet = next,
                Flow::Stop => {
                    tracing::debug!("{:?} traversal stopped by {}", direction, handler.name());
                    return Ok(None);
                }
            }
        }
        Ok(Some(packet))
    }

    pub async fn run_inbound(&self, ctx: &mut Context, packet: Packet) -> Result<Option<Packet>> {
        self.run(Direction::Inbound, ctx, packet).await
    }

    pub async fn run_outbound(&self, ctx: &mut Context, packet: Packet) -> Result<Option<Packet>> {
        self.run(Direction::Outbound, ctx, packet).await
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("inbound", &self.names(Direction::Inbound))
            .field("outbound", &self.names(Direction::Outbound))
            .finish()
    }
}
