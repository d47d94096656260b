//! The narrow interface the routing engine uses to talk to a socket.
//!
//! Adapters own the actual socket. They hand the engine a [`Transport`] for
//! writing and report open/message/close/error events by calling into
//! [`Hub`](crate::hub::Hub) or [`PeerLink`](crate::link::PeerLink).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::codec::{Frame, PreparedMessage};
use crate::errors::TransportError;

/// Write side of one socket.
pub trait Transport: Send + Sync {
    /// Queue a frame for delivery.
    fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Queue a frame that was encoded once for many recipients.
    fn send_prepared(&self, message: &PreparedMessage) -> Result<(), TransportError> {
        self.send(message.frame().clone())
    }

    /// Ask the socket to close. The close event is reported separately once
    /// the transport has finished.
    fn close(&self, code: Option<u16>, reason: Option<&str>);
}

/// Close status reported with the `disconnect` notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CloseInfo {
    /// WebSocket close code.
    pub code: u16,
    /// Human-readable close reason (may be empty).
    pub reason: String,
    /// Whether the closing handshake completed.
    pub was_clean: bool,
}

impl CloseInfo {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint going away (server shutdown).
    pub const GOING_AWAY: u16 = 1001;
    /// Close frame carried no status code.
    pub const NO_STATUS: u16 = 1005;
    /// Connection dropped without a close frame.
    pub const ABNORMAL: u16 = 1006;

    /// Build a close status.
    pub fn new(code: u16, reason: impl Into<String>, was_clean: bool) -> Self {
        Self {
            code,
            reason: reason.into(),
            was_clean,
        }
    }

    /// The socket went away without a closing handshake.
    pub fn abnormal() -> Self {
        Self::new(Self::ABNORMAL, "", false)
    }

    /// A close frame arrived without a status code.
    pub fn no_status() -> Self {
        Self::new(Self::NO_STATUS, "", true)
    }
}

/// A pending close request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseRequest {
    /// Close code to send, if any.
    pub code: Option<u16>,
    /// Close reason to send, if any.
    pub reason: Option<String>,
}

/// Item drained by an adapter's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outgoing {
    /// Write this frame.
    Frame(Frame),
    /// Send a close frame and stop writing.
    Close(CloseRequest),
}

/// Channel-backed transport shared by the server and client adapters.
///
/// Frames go through a bounded queue and are never awaited on; a full queue
/// drops the frame and reports [`TransportError::QueueFull`]. Close requests
/// travel on a separate one-shot so they cannot be lost to a full queue.
pub struct QueuedTransport {
    frames: mpsc::Sender<Frame>,
    close: Mutex<Option<oneshot::Sender<CloseRequest>>>,
    is_alive: AtomicBool,
    last_pong: Mutex<Instant>,
    dropped: AtomicU64,
}

impl QueuedTransport {
    /// Create a transport and the queue its writer task drains.
    pub fn channel(capacity: usize) -> (Self, OutboundQueue) {
        let (frames_tx, frames_rx) = mpsc::channel(capacity.max(1));
        let (close_tx, close_rx) = oneshot::channel();
        let transport = Self {
            frames: frames_tx,
            close: Mutex::new(Some(close_tx)),
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(Instant::now()),
            dropped: AtomicU64::new(0),
        };
        let queue = OutboundQueue {
            frames: frames_rx,
            close: Some(close_rx),
        };
        (transport, queue)
    }

    /// Record activity from the peer (pong or any inbound frame).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Check and reset the alive flag.
    ///
    /// Returns `true` if the peer showed activity since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the peer last showed activity.
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Frames dropped because the queue was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Whether a close has been requested.
    pub fn close_requested(&self) -> bool {
        self.close.lock().is_none()
    }
}

impl Transport for QueuedTransport {
    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        match self.frames.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    fn close(&self, code: Option<u16>, reason: Option<&str>) {
        if let Some(tx) = self.close.lock().take() {
            let _ = tx.send(CloseRequest {
                code,
                reason: reason.map(str::to_owned),
            });
        }
    }
}

/// Receiving half of a [`QueuedTransport`].
pub struct OutboundQueue {
    frames: mpsc::Receiver<Frame>,
    close: Option<oneshot::Receiver<CloseRequest>>,
}

impl OutboundQueue {
    /// Next item to write. Frames queued before a close request are
    /// yielded first. Returns `None` once the transport is dropped.
    pub async fn next(&mut self) -> Option<Outgoing> {
        loop {
            let Some(close) = self.close.as_mut() else {
                return self.frames.recv().await.map(Outgoing::Frame);
            };
            tokio::select! {
                biased;
                frame = self.frames.recv() => return frame.map(Outgoing::Frame),
                request = close => {
                    self.close = None;
                    if let Ok(request) = request {
                        return Some(Outgoing::Close(request));
                    }
                }
            }
        }
    }
}
