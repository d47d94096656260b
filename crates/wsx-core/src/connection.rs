//! Connection handle.
//!
//! A [`Connection`] is a cheap clone of one accepted (server) or established
//! (client) transport session. Every outbound operation goes through the
//! capability table resolved when the connection opened.
//!
//! Each connection also carries its own message listeners. The hub notifies
//! them after its own listeners, and drops them when the connection closes.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::codec::Envelope;
use crate::dispatch::{Dispatcher, ListenerId};
use crate::errors::{Result, WsxError};
use crate::extension::{BROADCAST, CapabilityTable, ExtensionContext, ExtensionSet, Outbound, SEND};
use crate::hub::{Hub, WeakHub};
use crate::ids::{ConnectionId, GroupId};
use crate::lifecycle::{ConnectionState, StateCell};
use crate::transport::Transport;

struct ConnectionInner {
    id: ConnectionId,
    transport: Arc<dyn Transport>,
    capabilities: CapabilityTable,
    state: StateCell,
    hub: Option<WeakHub>,
    listeners: Dispatcher<Connection>,
    connected_at: Instant,
}

/// Handle to one live (or formerly live) connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Resolve capabilities for a new transport and move it to `Open`.
    pub(crate) fn establish(
        transport: Arc<dyn Transport>,
        hub: Option<WeakHub>,
        extensions: &ExtensionSet,
    ) -> Self {
        let ctx = ExtensionContext {
            connection_id: ConnectionId::generate(),
            transport,
            hub,
        };
        let capabilities = extensions.resolve(&ctx);
        let ExtensionContext {
            connection_id,
            transport,
            hub,
        } = ctx;
        let connection = Self {
            inner: Arc::new(ConnectionInner {
                id: connection_id,
                transport,
                capabilities,
                state: StateCell::new(),
                hub,
                listeners: Dispatcher::new(),
                connected_at: Instant::now(),
            }),
        };
        let _ = connection.inner.state.open();
        connection
    }

    /// Unique id.
    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    /// Whether messages may be sent.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Time since the connection opened.
    pub fn age(&self) -> Duration {
        self.inner.connected_at.elapsed()
    }

    /// Resolved capabilities.
    pub fn capabilities(&self) -> &CapabilityTable {
        &self.inner.capabilities
    }

    /// The owning hub, if this is a server-side connection and the hub is
    /// still alive.
    pub fn hub(&self) -> Option<Hub> {
        self.inner.hub.as_ref().and_then(WeakHub::upgrade)
    }

    /// Invoke a named capability.
    pub fn invoke(&self, name: &str, outbound: Outbound) -> Result<usize> {
        if !self.is_open() {
            return Err(WsxError::ConnectionClosed(self.id().clone()));
        }
        self.inner.capabilities.call(name, outbound)
    }

    /// Send a typed message to this connection.
    pub fn send(&self, kind: impl Into<String>, payload: impl Serialize) -> Result<()> {
        self.send_envelope(Envelope::typed(kind, payload)?)
    }

    /// Send a prepared envelope to this connection.
    pub fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        let _ = self.invoke(SEND, Outbound::new(envelope))?;
        Ok(())
    }

    /// Send raw bytes as a binary frame.
    pub fn send_raw(&self, bytes: impl Into<bytes::Bytes>) -> Result<()> {
        self.send_envelope(Envelope::raw(bytes))
    }

    /// Send an arbitrary JSON value as a text frame.
    pub fn send_value(&self, value: Value) -> Result<()> {
        self.send_envelope(Envelope::Untyped(value))
    }

    /// Send a typed message to every other connection on the hub.
    pub fn broadcast(&self, kind: impl Into<String>, payload: impl Serialize) -> Result<usize> {
        let envelope = Envelope::typed(kind, payload)?;
        self.invoke(BROADCAST, Outbound::new(envelope))
    }

    /// Send a typed message to every other member of `group`.
    pub fn broadcast_to(
        &self,
        group: &GroupId,
        kind: impl Into<String>,
        payload: impl Serialize,
    ) -> Result<usize> {
        let envelope = Envelope::typed(kind, payload)?;
        self.invoke(BROADCAST, Outbound::to_group(envelope, group.clone()))
    }

    /// Request an orderly close. Returns `false` if the connection was not
    /// open.
    pub fn disconnect(&self, code: u16, reason: &str) -> bool {
        if !self.inner.state.begin_close() {
            return false;
        }
        debug!(conn_id = %self.id(), code, reason, "disconnect requested");
        self.inner.transport.close(Some(code), Some(reason));
        true
    }

    /// Listen for every message from this connection only.
    pub fn on_message(
        &self,
        f: impl Fn(&Connection, &Envelope) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.listeners.on_message(f)
    }

    /// Listen for one message type from this connection only.
    pub fn on(
        &self,
        kind: impl Into<String>,
        f: impl Fn(&Connection, Option<&Value>) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.listeners.on(kind, f)
    }

    /// Listen for the next message of one type from this connection.
    pub fn once(
        &self,
        kind: impl Into<String>,
        f: impl FnOnce(&Connection, Option<&Value>) + Send + 'static,
    ) -> ListenerId {
        self.inner.listeners.once(kind, f)
    }

    /// Remove a listener registered on this connection.
    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.listeners.off(id)
    }

    /// Groups this connection currently belongs to, sorted by id.
    pub fn groups(&self) -> Vec<GroupId> {
        self.hub()
            .map(|hub| hub.groups_of(self.id()))
            .unwrap_or_default()
    }

    pub(crate) fn listeners(&self) -> &Dispatcher<Connection> {
        &self.inner.listeners
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Move to `Closed`. Returns the previous state, or `None` if already
    /// closed.
    pub(crate) fn finish(&self) -> Option<ConnectionState> {
        self.inner.state.finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("capabilities", &self.inner.capabilities)
            .finish_non_exhaustive()
    }
}
