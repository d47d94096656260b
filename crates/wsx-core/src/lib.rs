//! # wsx-core
//!
//! Transport-independent routing engine for typed publish/subscribe over
//! WebSocket connections.
//!
//! - **Codec**: `{"type", "payload"}` text envelopes, raw binary passthrough,
//!   encode-once [`PreparedMessage`] for fan-out
//! - **Extensions**: ordered decorator layers resolved once per connection
//!   into an immutable [`CapabilityTable`]
//! - **Hub**: connection registry, named groups with automatic cleanup, and
//!   batched broadcast for the server side
//! - **Dispatcher**: generic and type-scoped notifications with an optional
//!   allow-list of message types
//! - **`PeerLink`**: the same lifecycle for the client's single connection
//!
//! Sockets are not handled here. Adapters implement [`Transport`] and feed
//! open/message/close/error events into a [`Hub`] or [`PeerLink`].

#![deny(unsafe_code)]

pub mod codec;
pub mod connection;
pub mod dispatch;
pub mod errors;
pub mod extension;
pub mod group;
pub mod hub;
pub mod ids;
pub mod lifecycle;
pub mod link;
pub mod logging;
pub mod registry;
pub mod test_utils;
pub mod transport;

pub use codec::{Envelope, Frame, PreparedMessage, Utf8Text, decode, encode};
pub use connection::Connection;
pub use dispatch::{Dispatcher, ListenerId, TypePolicy};
pub use errors::{CodecError, Result, TransportError, WsxError};
pub use extension::{
    BroadcastExtension, Capability, CapabilityTable, Extension, ExtensionContext, ExtensionSet,
    FnExtension, Outbound, SendExtension,
};
pub use group::{Group, GroupSummary};
pub use hub::{Hub, WeakHub};
pub use ids::{ConnectionId, GroupId};
pub use lifecycle::ConnectionState;
pub use link::PeerLink;
pub use transport::{
    CloseInfo, CloseRequest, OutboundQueue, Outgoing, QueuedTransport, Transport,
};

/// One-shot hook run at the end of building a server or client.
pub type Plugin<T> = Box<dyn FnOnce(&mut T) + Send>;
