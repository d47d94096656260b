//! Error types shared by the codec, the router and the transport adapters.

use thiserror::Error;

use crate::ids::{ConnectionId, GroupId};

/// Failure to turn an envelope into a frame or a frame into an envelope.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The text frame was not valid JSON, or the payload failed to serialize.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A typed envelope was built with an empty type string.
    #[error("message type must be a non-empty string")]
    EmptyType,
}

/// Failure reported by the underlying socket.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The socket is gone; nothing more can be written.
    #[error("transport closed")]
    Closed,
    /// The outbound queue is full and the frame was dropped.
    #[error("send queue full")]
    QueueFull,
    /// Read or write failure on the socket.
    #[error("transport I/O error: {0}")]
    Io(String),
}

/// Umbrella error for everything the routing engine can report.
#[derive(Debug, Error)]
pub enum WsxError {
    /// Encoding or decoding failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A typed message was rejected by the type policy.
    #[error("message type '{0}' is not allowed")]
    DisallowedType(String),
    /// The connection is closing or closed.
    #[error("connection {0} is not open")]
    ConnectionClosed(ConnectionId),
    /// The connection is not registered with the hub.
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
    /// No capability with this name was resolved for the connection.
    #[error("unknown capability '{0}'")]
    UnknownCapability(String),
    /// The group handle refers to an incarnation that no longer exists.
    #[error("group '{0}' no longer exists")]
    GroupDetached(GroupId),
    /// The owning hub has been dropped, or there never was one.
    #[error("no hub is attached to this connection")]
    HubGone,
    /// The client has no established connection.
    #[error("not connected")]
    NotConnected,
}

/// Result alias for routing-engine operations.
pub type Result<T> = std::result::Result<T, WsxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_error_wraps_into_wsx_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad").unwrap_err();
        let err: WsxError = CodecError::from(json_err).into();
        assert!(matches!(err, WsxError::Codec(CodecError::Json(_))));
        assert!(err.to_string().starts_with("invalid JSON"));
    }

    #[test]
    fn transport_error_display() {
        let err: WsxError = TransportError::QueueFull.into();
        assert_eq!(err.to_string(), "send queue full");
    }

    #[test]
    fn disallowed_type_display() {
        let err = WsxError::DisallowedType("admin".into());
        assert_eq!(err.to_string(), "message type 'admin' is not allowed");
    }

    #[test]
    fn connection_closed_names_the_connection() {
        let err = WsxError::ConnectionClosed(ConnectionId::from("c1"));
        assert_eq!(err.to_string(), "connection c1 is not open");
    }
}
