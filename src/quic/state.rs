//! Connection state machine
//!
//! The state cell and the three send packet-number counters share one
//! critical section. Callers only get transition operations, never setters.

use parking_lot::Mutex;
use std::fmt;
use std::time::Instant;

use crate::quic::error::{ProtocolError, Result};
use crate::quic::frame::Frame;
use crate::quic::number::PacketNumber;
use crate::quic::packet::EncryptionLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn is_client(self) -> bool {
        self == Role::Client
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// Connection states. `BeforeDone` and `Done` are client-only, `Ready` is
/// server-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Created, nothing exchanged yet
    Started,
    /// Client: hello sent. Server: first Initial received.
    BeforeHello,
    /// Handshake keys installed
    BeforeHandshake,
    /// Client Finished sent, waiting for HANDSHAKE_DONE
    BeforeDone,
    /// Server: handshake confirmed
    Ready,
    /// Client: HANDSHAKE_DONE received
    Done,
    Closing,
    Closed,
}

impl State {
    /// Handshake finished from this endpoint's point of view
    pub fn is_established(self) -> bool {
        matches!(self, State::Ready | State::Done)
    }

    pub fn is_closing_or_closed(self) -> bool {
        matches!(self, State::Closing | State::Closed)
    }
}

/// Events that drive the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    HelloSent,
    HelloReceived,
    HandshakeKeys,
    FinishedSent,
    HandshakeConfirmed,
    HandshakeDone,
    Retry,
    Close,
    Drained,
}

impl StateEvent {
    pub fn name(self) -> &'static str {
        match self {
            StateEvent::HelloSent => "hello sent",
            StateEvent::HelloReceived => "hello received",
            StateEvent::HandshakeKeys => "handshake keys",
            StateEvent::FinishedSent => "finished sent",
            StateEvent::HandshakeConfirmed => "handshake confirmed",
            StateEvent::HandshakeDone => "handshake done",
            StateEvent::Retry => "retry",
            StateEvent::Close => "close",
            StateEvent::Drained => "drained",
        }
    }
}

const MAX_HISTORY: usize = 32;

#[derive(Debug)]
struct Inner {
    state: State,
    next_packet_number: [u64; 3],
    history: Vec<(State, Instant)>,
}

#[derive(Debug)]
pub struct StateMachine {
    role: Role,
    inner: Mutex<Inner>,
}

impl StateMachine {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            inner: Mutex::new(Inner {
                state: State::Started,
                next_packet_number: [0; 3],
                history: vec![(State::Started, Instant::now())],
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    /// Target state of `event` in `state`, if the transition is legal
    pub fn next_state(role: Role, state: State, event: StateEvent) -> Option<State> {
        use State::*;
        use StateEvent::*;

        match (role, state, event) {
            (Role::Client, Started, HelloSent) => Some(BeforeHello),
            (Role::Client, BeforeHello, Retry) => Some(BeforeHello),
            (Role::Client, BeforeHello, HandshakeKeys) => Some(BeforeHandshake),
            (Role::Client, BeforeHandshake, FinishedSent) => Some(BeforeDone),
            (Role::Client, BeforeDone, HandshakeDone) => Some(Done),

            (Role::Server, Started, HelloReceived) => Some(BeforeHello),
            (Role::Server, BeforeHello, HandshakeKeys) => Some(BeforeHandshake),
            (Role::Server, BeforeHandshake, HandshakeConfirmed) => Some(Ready),

            (_, Closing, Drained) => Some(Closed),
            (_, Closing | Closed, _) => None,
            (_, _, Close) => Some(Closing),
            _ => None,
        }
    }

    fn apply(&self, inner: &mut Inner, event: StateEvent) -> Result<State> {
        let next = Self::next_state(self.role, inner.state, event).ok_or(ProtocolError::InvalidTransition {
            from: inner.state,
            event: event.name(),
        })?;
        if next != inner.state {
            tracing::info!("{} state {:?} -> {:?} on {}", self.role, inner.state, next, event.name());
            inner.state = next;
            inner.history.push((next, Instant::now()));
            if inner.history.len() > MAX_HISTORY {
                inner.history.remove(0);
            }
        }
        Ok(next)
    }

    /// Apply a transition, failing with a protocol error if it is illegal
    pub fn transition(&self, event: StateEvent) -> Result<State> {
        let mut inner = self.inner.lock();
        self.apply(&mut inner, event)
    }

    /// Enter Closing. Returns false if the connection was already closing
    /// or closed, so exactly one caller runs teardown.
    pub fn begin_close(&self) -> bool {
        let mut inner = self.inner.lock();
        self.apply(&mut inner, StateEvent::Close).is_ok()
    }

    /// Accept a Retry: stays in BeforeHello and resets the Initial counter
    pub fn retry(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.apply(&mut inner, StateEvent::Retry)?;
        inner.next_packet_number[EncryptionLevel::Initial.index()] = 0;
        Ok(())
    }

    /// Allocate the next send packet number of `level`
    pub fn next_packet_number(&self, level: EncryptionLevel) -> Result<PacketNumber> {
        let mut inner = self.inner.lock();
        let counter = &mut inner.next_packet_number[level.index()];
        let number = PacketNumber::new(*counter)?;
        *counter += 1;
        Ok(number)
    }

    /// Peek at the next send packet number of `level`
    pub fn peek_packet_number(&self, level: EncryptionLevel) -> u64 {
        self.inner.lock().next_packet_number[level.index()]
    }

    pub fn history(&self) -> Vec<(State, Instant)> {
        self.inner.lock().history.clone()
    }

    /// Check that a received frame is legal at `level` in the current state
    pub fn check_frame(&self, frame: &Frame, level: EncryptionLevel) -> Result<()> {
        if !frame.allowed_at(level) {
            return Err(ProtocolError::FrameNotAllowed { frame: frame.name(), level }.into());
        }
        if let Frame::HandshakeDone = frame {
            let state = self.state();
            let legal = self.role.is_client()
                && matches!(state, State::BeforeHandshake | State::BeforeDone | State::Done);
            if !legal {
                return Err(ProtocolError::FrameNotAllowedInState { frame: frame.name(), state }.into());
            }
        }
        Ok(())
    }
}
