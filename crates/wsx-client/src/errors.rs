//! Client error types.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors from [`Client`](crate::Client) operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The handshake failed (network, HTTP status, protocol).
    #[error("connect failed: {0}")]
    Connect(#[from] tungstenite::Error),
    /// The handshake did not finish in time.
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    /// The URL or headers could not form a handshake request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// `connect` was called while a connection is live.
    #[error("already connected")]
    AlreadyConnected,
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
