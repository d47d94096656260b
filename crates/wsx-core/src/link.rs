//! Client-side lifecycle for a single peer.
//!
//! [`PeerLink`] is the client counterpart of [`Hub`](crate::hub::Hub): it
//! tracks one connection at a time and dispatches with `()` as the peer, so
//! client listeners never see a connection argument.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::codec::Frame;
use crate::connection::Connection;
use crate::dispatch::{Dispatcher, TypePolicy};
use crate::errors::{TransportError, WsxError};
use crate::extension::ExtensionSet;
use crate::lifecycle::ConnectionState;
use crate::transport::{CloseInfo, Transport};

/// Lifecycle and routing for the client's one connection.
#[derive(Debug)]
pub struct PeerLink {
    dispatcher: Dispatcher<()>,
    extensions: ExtensionSet,
    current: RwLock<Option<Connection>>,
}

impl PeerLink {
    /// A link that applies `extensions` when a transport is attached.
    pub fn new(extensions: ExtensionSet, policy: TypePolicy) -> Self {
        Self {
            dispatcher: Dispatcher::with_policy(policy),
            extensions,
            current: RwLock::new(None),
        }
    }

    /// Listener registration.
    pub fn dispatcher(&self) -> &Dispatcher<()> {
        &self.dispatcher
    }

    /// The current (or most recent) connection.
    pub fn connection(&self) -> Option<Connection> {
        self.current.read().clone()
    }

    /// State of the current connection; `Closed` if there never was one.
    pub fn state(&self) -> ConnectionState {
        self.connection()
            .map_or(ConnectionState::Closed, |conn| conn.state())
    }

    /// The transport finished its handshake.
    pub fn attach(&self, transport: Arc<dyn Transport>) -> Connection {
        let connection = Connection::establish(transport, None, &self.extensions);
        *self.current.write() = Some(connection.clone());
        debug!(conn_id = %connection.id(), "connected");
        self.dispatcher.emit_connect(&());
        connection
    }

    /// A frame arrived.
    pub fn receive(&self, frame: &Frame) {
        match self.connection() {
            Some(conn) if conn.state() != ConnectionState::Closed => {
                self.dispatcher.route(&(), frame);
            }
            _ => debug!("frame without an open connection ignored"),
        }
    }

    /// The transport reported an error. Suppressed once a local disconnect
    /// has been requested.
    pub fn fail(&self, error: TransportError) {
        if self.state() == ConnectionState::Closing {
            debug!(error = %error, "transport error after disconnect suppressed");
            return;
        }
        self.dispatcher
            .emit_error(&WsxError::Transport(error), None);
    }

    /// The transport closed. Returns `false` if there was nothing to close.
    pub fn close(&self, info: CloseInfo) -> bool {
        let Some(conn) = self.connection() else {
            return false;
        };
        if conn.finish().is_none() {
            return false;
        }
        debug!(conn_id = %conn.id(), code = info.code, was_clean = info.was_clean, "disconnected");
        self.dispatcher.emit_disconnect(&(), &info);
        true
    }
}

impl Default for PeerLink {
    fn default() -> Self {
        Self::new(ExtensionSet::client_defaults(), TypePolicy::AllowAll)
    }
}
