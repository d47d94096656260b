//! In-memory transport for tests.

use parking_lot::Mutex;

use crate::codec::Frame;
use crate::errors::TransportError;
use crate::transport::Transport;

/// Records every frame and close request instead of writing to a socket.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    frames: Mutex<Vec<Frame>>,
    closes: Mutex<Vec<(Option<u16>, Option<String>)>>,
    failure: Mutex<Option<TransportError>>,
}

impl RecordingTransport {
    /// A transport that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following send fail with `error` (or succeed again with
    /// `None`).
    pub fn fail_with(&self, error: Option<TransportError>) {
        *self.failure.lock() = error;
    }

    /// Frames sent so far.
    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().clone()
    }

    /// Text frames sent so far, as strings.
    pub fn texts(&self) -> Vec<String> {
        self.frames
            .lock()
            .iter()
            .filter_map(|frame| match frame {
                Frame::Text(text) => Some(text.to_string()),
                Frame::Binary(_) => None,
            })
            .collect()
    }

    /// Close requests received so far.
    pub fn closes(&self) -> Vec<(Option<u16>, Option<String>)> {
        self.closes.lock().clone()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        self.frames.lock().push(frame);
        Ok(())
    }

    fn close(&self, code: Option<u16>, reason: Option<&str>) {
        self.closes.lock().push((code, reason.map(str::to_owned)));
    }
}
