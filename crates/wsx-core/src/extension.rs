//! Extension composer.
//!
//! An [`ExtensionSet`] is an ordered list of decorators. When a connection is
//! accepted (server) or established (client) the set is resolved once into an
//! immutable [`CapabilityTable`]. Each layer receives the capability already
//! resolved under its name, so a later `send` can wrap an earlier one.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::codec::{Envelope, encode};
use crate::errors::{Result, WsxError};
use crate::hub::WeakHub;
use crate::ids::{ConnectionId, GroupId};
use crate::transport::Transport;

/// Name of the built-in unicast capability.
pub const SEND: &str = "send";
/// Name of the built-in fan-out capability.
pub const BROADCAST: &str = "broadcast";

/// A message handed to a capability.
#[derive(Clone, Debug, PartialEq)]
pub struct Outbound {
    /// What to send.
    pub envelope: Envelope,
    /// Target group for fan-out capabilities; `None` means everyone.
    pub group: Option<GroupId>,
}

impl Outbound {
    /// An outbound message with no group target.
    pub fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            group: None,
        }
    }

    /// An outbound message aimed at one group.
    pub fn to_group(envelope: Envelope, group: GroupId) -> Self {
        Self {
            envelope,
            group: Some(group),
        }
    }
}

/// A resolved operation on a connection. Returns the number of transport
/// deliveries made.
pub type Capability = Arc<dyn Fn(Outbound) -> Result<usize> + Send + Sync>;

/// What an extension can see while building its capability.
#[derive(Clone)]
pub struct ExtensionContext {
    /// The connection being set up.
    pub connection_id: ConnectionId,
    /// Its write side.
    pub transport: Arc<dyn Transport>,
    /// The owning hub; `None` on the client.
    pub hub: Option<WeakHub>,
}

impl fmt::Debug for ExtensionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionContext")
            .field("connection_id", &self.connection_id)
            .field("has_hub", &self.hub.is_some())
            .finish_non_exhaustive()
    }
}

/// One decorator layer.
pub trait Extension: Send + Sync {
    /// Capability name this layer resolves.
    fn name(&self) -> &str;

    /// Build the capability for one connection. `previous` is whatever an
    /// earlier layer resolved under the same name.
    fn build(&self, ctx: &ExtensionContext, previous: Option<Capability>) -> Capability;
}

/// Immutable name → capability map for one connection.
#[derive(Clone, Default)]
pub struct CapabilityTable {
    entries: HashMap<String, Capability>,
}

impl CapabilityTable {
    /// Look up a capability.
    pub fn get(&self, name: &str) -> Option<&Capability> {
        self.entries.get(name)
    }

    /// Whether a capability is present.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Sorted capability names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Invoke a capability by name.
    pub fn call(&self, name: &str, outbound: Outbound) -> Result<usize> {
        let capability = self
            .get(name)
            .ok_or_else(|| WsxError::UnknownCapability(name.to_owned()))?;
        capability(outbound)
    }
}

impl fmt::Debug for CapabilityTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

/// Ordered list of extensions applied to every new connection.
#[derive(Clone, Default)]
pub struct ExtensionSet {
    layers: Vec<Arc<dyn Extension>>,
}

impl ExtensionSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// `send` and `broadcast`.
    pub fn server_defaults() -> Self {
        Self::new().with(SendExtension).with(BroadcastExtension)
    }

    /// `send` only.
    pub fn client_defaults() -> Self {
        Self::new().with(SendExtension)
    }

    /// Append a layer.
    pub fn push(&mut self, extension: impl Extension + 'static) -> &mut Self {
        self.layers.push(Arc::new(extension));
        self
    }

    /// Builder form of [`push`](Self::push).
    #[must_use]
    pub fn with(mut self, extension: impl Extension + 'static) -> Self {
        let _ = self.push(extension);
        self
    }

    /// Append a closure-backed layer.
    #[must_use]
    pub fn with_fn<F>(self, name: impl Into<String>, build: F) -> Self
    where
        F: Fn(&ExtensionContext, Option<Capability>) -> Capability + Send + Sync + 'static,
    {
        self.with(FnExtension::new(name, build))
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether there are no layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Layer names in application order.
    pub fn names(&self) -> Vec<&str> {
        self.layers.iter().map(|layer| layer.name()).collect()
    }

    /// Apply every layer in order and freeze the result.
    pub fn resolve(&self, ctx: &ExtensionContext) -> CapabilityTable {
        let mut entries: HashMap<String, Capability> = HashMap::new();
        for layer in &self.layers {
            let name = layer.name().to_owned();
            let previous = entries.remove(&name);
            let capability = layer.build(ctx, previous);
            let _ = entries.insert(name, capability);
        }
        trace!(conn_id = %ctx.connection_id, layers = self.layers.len(), "resolved capabilities");
        CapabilityTable { entries }
    }
}

impl fmt::Debug for ExtensionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Encodes and writes to the connection's own transport.
#[derive(Clone, Copy, Debug, Default)]
pub struct SendExtension;

impl Extension for SendExtension {
    fn name(&self) -> &str {
        SEND
    }

    fn build(&self, ctx: &ExtensionContext, _previous: Option<Capability>) -> Capability {
        let transport = Arc::clone(&ctx.transport);
        Arc::new(move |outbound: Outbound| -> Result<usize> {
            let frame = encode(&outbound.envelope)?;
            transport.send(frame)?;
            Ok(1)
        })
    }
}

/// Fans out to a group (or everyone) except the sending connection.
#[derive(Clone, Copy, Debug, Default)]
pub struct BroadcastExtension;

impl Extension for BroadcastExtension {
    fn name(&self) -> &str {
        BROADCAST
    }

    fn build(&self, ctx: &ExtensionContext, _previous: Option<Capability>) -> Capability {
        let hub = ctx.hub.clone();
        let sender = ctx.connection_id.clone();
        Arc::new(move |outbound: Outbound| -> Result<usize> {
            let hub = hub
                .as_ref()
                .and_then(WeakHub::upgrade)
                .ok_or(WsxError::HubGone)?;
            hub.fan_out(&outbound.envelope, outbound.group.as_ref(), Some(&sender))
        })
    }
}

/// An extension backed by a closure.
pub struct FnExtension<F> {
    name: String,
    build: F,
}

impl<F> FnExtension<F>
where
    F: Fn(&ExtensionContext, Option<Capability>) -> Capability + Send + Sync,
{
    /// Wrap `build` under `name`.
    pub fn new(name: impl Into<String>, build: F) -> Self {
        Self {
            name: name.into(),
            build,
        }
    }
}

impl<F> Extension for FnExtension<F>
where
    F: Fn(&ExtensionContext, Option<Capability>) -> Capability + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn build(&self, ctx: &ExtensionContext, previous: Option<Capability>) -> Capability {
        (self.build)(ctx, previous)
    }
}
