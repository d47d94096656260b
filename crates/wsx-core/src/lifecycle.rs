//! Connection lifecycle state machine.
//!
//! `Connecting → Open → Closing → Closed`. `Closed` is terminal; a
//! connection may also go straight from `Open` or `Connecting` to `Closed`
//! when the peer drops it.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

/// Lifecycle state of one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    /// Created, capabilities not yet resolved.
    Connecting = 0,
    /// Messages may flow in both directions.
    Open = 1,
    /// A local close was requested; waiting for the transport to finish.
    Closing = 2,
    /// Terminal.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }

    /// Lowercase name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic holder for a [`ConnectionState`].
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    /// Start in `Connecting`.
    pub fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Connecting as u8))
    }

    /// Current state.
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `Connecting → Open`.
    pub fn open(&self) -> bool {
        self.transition(ConnectionState::Connecting, ConnectionState::Open)
    }

    /// `Open → Closing`.
    pub fn begin_close(&self) -> bool {
        self.transition(ConnectionState::Open, ConnectionState::Closing)
    }

    /// Any non-terminal state → `Closed`.
    ///
    /// Returns the previous state, or `None` if already closed.
    pub fn finish(&self) -> Option<ConnectionState> {
        let previous = self.0.swap(ConnectionState::Closed as u8, Ordering::AcqRel);
        match ConnectionState::from_u8(previous) {
            ConnectionState::Closed => None,
            state => Some(state),
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
