//! Server-side routing hub.
//!
//! One [`Hub`] per listener. It owns the connection registry, the group
//! table and the dispatcher. Registry and groups live behind a single mutex
//! that is never held across an await, a transport call or a listener call.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace};

use crate::codec::{Envelope, Frame, PreparedMessage};
use crate::connection::Connection;
use crate::dispatch::{Dispatcher, ListenerId, TypePolicy};
use crate::errors::{Result, TransportError, WsxError};
use crate::extension::ExtensionSet;
use crate::group::{Group, GroupSummary, GroupTable};
use crate::ids::{ConnectionId, GroupId};
use crate::lifecycle::ConnectionState;
use crate::registry::ConnectionRegistry;
use crate::transport::{CloseInfo, Transport};

#[derive(Debug, Default)]
pub(crate) struct HubState {
    pub(crate) registry: ConnectionRegistry,
    pub(crate) groups: GroupTable,
}

struct HubInner {
    state: Mutex<HubState>,
    dispatcher: Dispatcher<Connection>,
    extensions: ExtensionSet,
}

/// Connection registry, group manager and router for one server.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

/// Non-owning reference to a [`Hub`].
#[derive(Clone, Default)]
pub struct WeakHub(Weak<HubInner>);

impl WeakHub {
    /// Get the hub back, if it is still alive.
    pub fn upgrade(&self) -> Option<Hub> {
        self.0.upgrade().map(|inner| Hub { inner })
    }
}

impl fmt::Debug for WeakHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WeakHub")
            .field(&(self.0.strong_count() > 0))
            .finish()
    }
}

impl Hub {
    /// A hub that applies `extensions` to every accepted connection.
    pub fn new(extensions: ExtensionSet) -> Self {
        Self::with_policy(extensions, TypePolicy::AllowAll)
    }

    /// A hub with an explicit type policy.
    pub fn with_policy(extensions: ExtensionSet, policy: TypePolicy) -> Self {
        Self {
            inner: Arc::new(HubInner {
                state: Mutex::new(HubState::default()),
                dispatcher: Dispatcher::with_policy(policy),
                extensions,
            }),
        }
    }

    /// Non-owning reference.
    pub fn downgrade(&self) -> WeakHub {
        WeakHub(Arc::downgrade(&self.inner))
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, HubState> {
        self.inner.state.lock()
    }

    /// The dispatcher, for listener registration.
    pub fn dispatcher(&self) -> &Dispatcher<Connection> {
        &self.inner.dispatcher
    }

    /// Replace the type policy.
    pub fn set_type_policy(&self, policy: TypePolicy) {
        self.inner.dispatcher.set_policy(policy);
    }

    // ── Transport events ───────────────────────────────────────────────

    /// A transport opened: resolve capabilities, register, fire `connect`.
    pub fn accept(&self, transport: Arc<dyn Transport>) -> Connection {
        let connection =
            Connection::establish(transport, Some(self.downgrade()), &self.inner.extensions);
        let _ = self.state().registry.insert(connection.clone());
        debug!(conn_id = %connection.id(), "connection accepted");
        self.inner.dispatcher.emit_connect(&connection);
        connection
    }

    /// A frame arrived on `connection`. Hub listeners run first, then the
    /// connection's own.
    pub fn receive(&self, connection: &Connection, frame: &Frame) {
        if connection.state() == ConnectionState::Closed {
            trace!(conn_id = %connection.id(), "frame after close ignored");
            return;
        }
        match self.inner.dispatcher.dispatch(connection, frame) {
            Ok(envelope) => connection.listeners().notify(connection, &envelope),
            Err(error) => self.inner.dispatcher.emit_error(&error, Some(connection)),
        }
    }

    /// The transport for `connection` closed. Deregisters it, removes it
    /// from every group and fires `disconnect`. Returns `false` if it was
    /// already closed.
    pub fn close(&self, connection: &Connection, info: CloseInfo) -> bool {
        if connection.finish().is_none() {
            return false;
        }
        let left = {
            let mut state = self.state();
            let _ = state.registry.remove(connection.id());
            state.groups.remove_everywhere(connection.id())
        };
        debug!(
            conn_id = %connection.id(),
            code = info.code,
            was_clean = info.was_clean,
            groups_left = left.len(),
            "connection closed"
        );
        self.inner.dispatcher.emit_disconnect(connection, &info);
        connection.listeners().clear();
        true
    }

    /// The transport for `connection` reported an error. A close follows
    /// separately.
    pub fn fail(&self, connection: &Connection, error: TransportError) {
        self.inner
            .dispatcher
            .emit_error(&WsxError::Transport(error), Some(connection));
    }

    /// Surface an error that is not tied to a connection.
    pub fn report_error(&self, error: &WsxError) {
        self.inner.dispatcher.emit_error(error, None);
    }

    // ── Groups ─────────────────────────────────────────────────────────

    /// Get or create a group. The group is visible immediately.
    pub fn group(&self, id: impl Into<GroupId>) -> Group {
        let id = id.into();
        let epoch = self.state().groups.get_or_create(&id);
        Group::new(id, epoch, self.downgrade())
    }

    /// Add `connection` to group `id`, creating the group if needed. The
    /// lookup and the insert happen under one lock, so a concurrent removal
    /// of the last member cannot leave the join on a dropped incarnation.
    pub fn join(&self, id: impl Into<GroupId>, connection: &Connection) -> Result<Group> {
        let id = id.into();
        let (epoch, added) = {
            let mut state = self.state();
            if !state.registry.contains(connection.id()) {
                return Err(WsxError::UnknownConnection(connection.id().clone()));
            }
            state.groups.join(&id, connection.id().clone())
        };
        if added {
            debug!(group_id = %id, conn_id = %connection.id(), "joined group");
        }
        Ok(Group::new(id, epoch, self.downgrade()))
    }

    /// Look up a group without creating it.
    pub fn find_group(&self, id: &GroupId) -> Option<Group> {
        let epoch = self.state().groups.epoch(id)?;
        Some(Group::new(id.clone(), epoch, self.downgrade()))
    }

    /// Sorted ids of every live group.
    pub fn group_ids(&self) -> Vec<GroupId> {
        self.state().groups.ids()
    }

    /// Number of live groups.
    pub fn group_count(&self) -> usize {
        self.state().groups.len()
    }

    /// Member counts per group.
    pub fn group_summaries(&self) -> Vec<GroupSummary> {
        self.state().groups.summaries()
    }

    /// Sorted ids of the groups `id` belongs to.
    pub fn groups_of(&self, id: &ConnectionId) -> Vec<GroupId> {
        self.state().groups.groups_of(id)
    }

    // ── Connections ────────────────────────────────────────────────────

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.state().registry.len()
    }

    /// Snapshot of registered connections in accept order.
    pub fn connections(&self) -> Vec<Connection> {
        self.state().registry.iter().cloned().collect()
    }

    /// Look up a connection.
    pub fn get(&self, id: &ConnectionId) -> Option<Connection> {
        self.state().registry.get(id).cloned()
    }

    // ── Fan-out ────────────────────────────────────────────────────────

    /// Send a typed message to every registered connection.
    pub fn send_all(&self, kind: impl Into<String>, payload: impl Serialize) -> Result<usize> {
        self.fan_out(&Envelope::typed(kind, payload)?, None, None)
    }

    /// Send `envelope` to every member of `group` (or every connection when
    /// `None`), skipping `except`. Returns the number of deliveries.
    pub fn fan_out(
        &self,
        envelope: &Envelope,
        group: Option<&GroupId>,
        except: Option<&ConnectionId>,
    ) -> Result<usize> {
        let targets: Vec<Connection> = {
            let state = self.state();
            match group {
                Some(id) => state
                    .groups
                    .current_members(id)
                    .iter()
                    .filter(|member| Some(*member) != except)
                    .filter_map(|member| state.registry.get(member).cloned())
                    .collect(),
                None => state
                    .registry
                    .iter()
                    .filter(|conn| Some(conn.id()) != except)
                    .cloned()
                    .collect(),
            }
        };
        self.deliver(envelope, &targets)
    }

    /// Encode once and hand the shared frame to each open target.
    pub(crate) fn deliver(&self, envelope: &Envelope, targets: &[Connection]) -> Result<usize> {
        let prepared = PreparedMessage::new(envelope)?;
        let mut delivered = 0;
        let mut failures = Vec::new();
        for target in targets {
            if !target.is_open() {
                continue;
            }
            match target.transport().send_prepared(&prepared) {
                Ok(()) => delivered += 1,
                Err(error) => failures.push((target, error)),
            }
        }
        prepared.finalize();
        trace!(
            kind = envelope.kind().unwrap_or("-"),
            recipients = targets.len(),
            delivered,
            "fan-out complete"
        );
        for (target, error) in failures {
            self.fail(target, error);
        }
        Ok(delivered)
    }

    // ── Listeners ──────────────────────────────────────────────────────

    /// See [`Dispatcher::on_connect`].
    pub fn on_connect(&self, f: impl Fn(&Connection) + Send + Sync + 'static) -> ListenerId {
        self.inner.dispatcher.on_connect(f)
    }

    /// See [`Dispatcher::on_disconnect`].
    pub fn on_disconnect(
        &self,
        f: impl Fn(&Connection, &CloseInfo) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.dispatcher.on_disconnect(f)
    }

    /// See [`Dispatcher::on_error`].
    pub fn on_error(
        &self,
        f: impl Fn(&WsxError, Option<&Connection>) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.dispatcher.on_error(f)
    }

    /// See [`Dispatcher::on_message`].
    pub fn on_message(
        &self,
        f: impl Fn(&Connection, &Envelope) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.dispatcher.on_message(f)
    }

    /// See [`Dispatcher::on`].
    pub fn on(
        &self,
        kind: impl Into<String>,
        f: impl Fn(&Connection, Option<&Value>) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.dispatcher.on(kind, f)
    }

    /// See [`Dispatcher::once`].
    pub fn once(
        &self,
        kind: impl Into<String>,
        f: impl FnOnce(&Connection, Option<&Value>) + Send + 'static,
    ) -> ListenerId {
        self.inner.dispatcher.once(kind, f)
    }

    /// See [`Dispatcher::off`].
    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.dispatcher.off(id)
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(ExtensionSet::server_defaults())
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Hub")
            .field("connections", &state.registry.len())
            .field("groups", &state.groups.len())
            .field("extensions", &self.inner.extensions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingTransport;
    use assert_matches::assert_matches;
    use parking_lot::Mutex as PlMutex;
    use serde_json::json;

    fn join(hub: &Hub) -> (Connection, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::new());
        let conn = hub.accept(Arc::clone(&transport) as Arc<dyn Transport>);
        (conn, transport)
    }

    #[test]
    fn accept_registers_and_fires_connect() {
        let hub = Hub::default();
        let count = Arc::new(PlMutex::new(0));
        let c = Arc::clone(&count);
        let _ = hub.on_connect(move |conn| {
            assert!(conn.is_open());
            *c.lock() += 1;
        });
        let (conn, _t) = join(&hub);
        assert_eq!(*count.lock(), 1);
        assert_eq!(hub.connection_count(), 1);
        assert_eq!(hub.get(conn.id()), Some(conn.clone()));
        assert!(conn.hub().is_some());
    }

    #[test]
    fn broadcast_excludes_sender() {
        let hub = Hub::default();
        let (a, ta) = join(&hub);
        let (b, tb) = join(&hub);
        let (c, tc) = join(&hub);
        let room = hub.group("room");
        for conn in [&a, &b, &c] {
            assert!(room.add(conn).unwrap());
        }

        assert_eq!(a.broadcast_to(room.id(), "say", "hi").unwrap(), 2);

        assert!(ta.frames().is_empty());
        assert_eq!(tb.texts(), vec![r#"{"type":"say","payload":"hi"}"#.to_owned()]);
        assert_eq!(tc.texts(), vec![r#"{"type":"say","payload":"hi"}"#.to_owned()]);
    }

    #[test]
    fn broadcast_without_group_reaches_everyone_else() {
        let hub = Hub::default();
        let (a, ta) = join(&hub);
        let (_b, tb) = join(&hub);
        assert_eq!(a.broadcast("ping", ()).unwrap(), 1);
        assert!(ta.frames().is_empty());
        assert_eq!(tb.texts(), vec![r#"{"type":"ping"}"#.to_owned()]);
    }

    #[test]
    fn fan_out_encodes_once() {
        let hub = Hub::default();
        let (_a, ta) = join(&hub);
        let (_b, tb) = join(&hub);
        assert_eq!(hub.send_all("tick", 1).unwrap(), 2);
        match (&ta.frames()[0], &tb.frames()[0]) {
            (Frame::Text(x), Frame::Text(y)) => {
                assert_eq!(x.as_bytes().as_ptr(), y.as_bytes().as_ptr());
            }
            other => panic!("unexpected frames {other:?}"),
        }
    }

    #[test]
    fn group_send_reaches_members_only() {
        let hub = Hub::default();
        let (a, ta) = join(&hub);
        let (_b, tb) = join(&hub);
        let g = hub.group("g");
        let _ = g.add(&a).unwrap();
        assert_eq!(g.send("news", json!({"n": 1})).unwrap(), 1);
        assert_eq!(ta.frames().len(), 1);
        assert!(tb.frames().is_empty());
    }

    #[test]
    fn g1_scenario() {
        let hub = Hub::default();
        let (x, _tx) = join(&hub);
        let (y, _ty) = join(&hub);
        let g1 = hub.group("g1");
        let _ = g1.add(&x).unwrap();
        let _ = g1.add(&y).unwrap();

        assert!(g1.delete(x.id()));
        assert_eq!(g1.len(), 1);
        assert!(hub.find_group(&GroupId::from("g1")).is_some());

        assert!(g1.delete(y.id()));
        assert!(hub.find_group(&GroupId::from("g1")).is_none());
        assert!(!g1.is_attached());

        let fresh = hub.group("g1");
        assert!(fresh.is_empty());
        assert!(fresh.is_attached());
        assert!(!g1.is_attached());
    }

    #[test]
    fn stale_handle_never_touches_new_incarnation() {
        let hub = Hub::default();
        let (x, _tx) = join(&hub);
        let old = hub.group("g1");
        let _ = old.add(&x).unwrap();
        old.clear();
        assert_eq!(hub.group_count(), 0);

        let new = hub.group("g1");
        let _ = new.add(&x).unwrap();

        assert_eq!(old.len(), 0);
        assert!(!old.delete(x.id()));
        old.clear();
        assert_matches!(old.add(&x), Err(WsxError::GroupDetached(_)));
        assert!(new.contains(x.id()));
        assert_eq!(new.len(), 1);
    }

    #[test]
    fn join_survives_the_last_member_leaving_concurrently() {
        let hub = Hub::default();
        let (a, _ta) = join(&hub);
        let (b, _tb) = join(&hub);
        let _ = hub.join("lobby", &a).unwrap();

        // A handle fetched before the lobby emptied points at a dropped incarnation.
        let stale = hub.group("lobby");
        assert!(hub.find_group(&GroupId::from("lobby")).unwrap().delete(a.id()));
        assert_matches!(stale.add(&b), Err(WsxError::GroupDetached(id)) if id.as_str() == "lobby");

        let lobby = hub.join("lobby", &b).unwrap();
        assert!(lobby.is_attached());
        assert_eq!(lobby.member_ids(), vec![b.id().clone()]);
        assert_eq!(b.groups(), vec![GroupId::from("lobby")]);
    }

    #[test]
    fn join_racing_leave_never_loses_the_joiner() {
        let hub = Hub::default();
        let (a, _ta) = join(&hub);
        let (b, _tb) = join(&hub);
        for _ in 0..200 {
            let _ = hub.join("hot", &a).unwrap();
            std::thread::scope(|s| {
                let _ = s.spawn(|| {
                    if let Some(g) = hub.find_group(&GroupId::from("hot")) {
                        let _ = g.delete(a.id());
                    }
                });
                let _ = s.spawn(|| hub.join("hot", &b).unwrap());
            });
            assert!(hub.groups_of(b.id()).contains(&GroupId::from("hot")));
            hub.find_group(&GroupId::from("hot")).unwrap().clear();
        }
    }

    #[test]
    fn join_requires_registered_connection() {
        let hub = Hub::default();
        let (stranger, _t) = join(&Hub::default());
        assert_matches!(hub.join("g", &stranger), Err(WsxError::UnknownConnection(_)));
        assert_eq!(hub.group_count(), 0);
    }

    #[test]
    fn add_requires_registered_connection() {
        let hub = Hub::default();
        let other = Hub::default();
        let (stranger, _t) = join(&other);
        let g = hub.group("g");
        assert_matches!(g.add(&stranger), Err(WsxError::UnknownConnection(_)));
    }

    #[test]
    fn closed_connection_cannot_rejoin() {
        let hub = Hub::default();
        let (x, _t) = join(&hub);
        assert!(hub.close(&x, CloseInfo::new(1000, "", true)));
        let g = hub.group("g");
        assert_matches!(g.add(&x), Err(WsxError::UnknownConnection(_)));
    }

    #[test]
    fn four_disconnects_leave_nothing_behind() {
        let hub = Hub::default();
        let conns: Vec<_> = (0..4).map(|_| join(&hub).0).collect();
        let shared = hub.group("all");
        for (i, conn) in conns.iter().enumerate() {
            let _ = shared.add(conn).unwrap();
            let _ = hub.group(format!("solo-{i}")).add(conn).unwrap();
        }
        assert_eq!(hub.group_count(), 5);

        for (i, conn) in conns.iter().enumerate() {
            let before = hub.connection_count();
            assert!(hub.close(conn, CloseInfo::new(1000, "", true)));
            assert_eq!(hub.connection_count(), before - 1);
            assert!(hub.groups_of(conn.id()).is_empty());
            assert!(hub.group_summaries().iter().all(|s| s.members > 0));
            assert_eq!(i + 1 + hub.connection_count(), 4);
        }
        assert_eq!(hub.group_count(), 0);
        assert!(hub.connections().is_empty());
    }

    #[test]
    fn close_is_idempotent() {
        let hub = Hub::default();
        let fired = Arc::new(PlMutex::new(Vec::new()));
        let f = Arc::clone(&fired);
        let _ = hub.on_disconnect(move |_, info| f.lock().push(info.code));
        let (x, _t) = join(&hub);
        assert!(hub.close(&x, CloseInfo::new(4000, "custom", true)));
        assert!(!hub.close(&x, CloseInfo::abnormal()));
        assert_eq!(*fired.lock(), vec![4000]);
    }

    #[test]
    fn frames_after_close_are_ignored() {
        let hub = Hub::default();
        let hits = Arc::new(PlMutex::new(0));
        let h = Arc::clone(&hits);
        let _ = hub.on_message(move |_, _| *h.lock() += 1);
        let (x, _t) = join(&hub);
        hub.receive(&x, &Frame::text(r#"{"type":"a"}"#));
        let _ = hub.close(&x, CloseInfo::abnormal());
        hub.receive(&x, &Frame::text(r#"{"type":"a"}"#));
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn typed_message_ordering_with_connection() {
        let hub = Hub::default();
        let log = Arc::new(PlMutex::new(Vec::new()));
        let l = Arc::clone(&log);
        let _ = hub.on_message(move |conn, env| {
            l.lock().push(format!("message:{}:{}", conn.id(), env.kind().unwrap_or("-")));
        });
        let l = Arc::clone(&log);
        let _ = hub.on("echo", move |conn, payload| {
            l.lock().push(format!("echo:{}:{}", conn.id(), payload.is_some()));
        });
        let (x, _t) = join(&hub);
        hub.receive(&x, &Frame::text(r#"{"type":"echo","payload":{"text":"hi"}}"#));
        assert_eq!(
            *log.lock(),
            vec![format!("message:{}:echo", x.id()), format!("echo:{}:true", x.id())]
        );
    }

    #[test]
    fn hub_once_fires_for_one_connection_only() {
        let hub = Hub::default();
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _ = hub.once("hello", move |conn, _| s.lock().push(conn.id().clone()));
        let (x, _tx) = join(&hub);
        let (y, _ty) = join(&hub);
        hub.receive(&x, &Frame::text(r#"{"type":"hello"}"#));
        hub.receive(&y, &Frame::text(r#"{"type":"hello"}"#));
        assert_eq!(*seen.lock(), vec![x.id().clone()]);
    }

    #[test]
    fn connection_listeners_run_after_hub_listeners() {
        let hub = Hub::default();
        let log = Arc::new(PlMutex::new(Vec::new()));
        let l = Arc::clone(&log);
        let _ = hub.on("ping", move |_, _| l.lock().push("hub".to_owned()));
        let (x, _tx) = join(&hub);
        let (y, _ty) = join(&hub);
        let l = Arc::clone(&log);
        let _ = x.on("ping", move |conn, payload| {
            l.lock().push(format!("conn:{}:{}", conn.id(), payload.map_or(0, |p| p.as_i64().unwrap_or(0))));
        });
        let l = Arc::clone(&log);
        let _ = x.once("ping", move |_, _| l.lock().push("once".to_owned()));

        hub.receive(&x, &Frame::text(r#"{"type":"ping","payload":1}"#));
        hub.receive(&y, &Frame::text(r#"{"type":"ping","payload":2}"#));
        hub.receive(&x, &Frame::text(r#"{"type":"ping","payload":3}"#));
        assert_eq!(
            *log.lock(),
            vec![
                "hub".to_owned(),
                format!("conn:{}:1", x.id()),
                "once".to_owned(),
                "hub".to_owned(),
                "hub".to_owned(),
                format!("conn:{}:3", x.id()),
            ]
        );
    }

    #[test]
    fn connection_listeners_skip_rejected_frames_and_end_at_close() {
        let hub = Hub::with_policy(ExtensionSet::server_defaults(), TypePolicy::from_list(["ok"]));
        let hits = Arc::new(PlMutex::new(0));
        let (x, _tx) = join(&hub);
        let h = Arc::clone(&hits);
        let id = x.on_message(move |_, _| *h.lock() += 1);
        hub.receive(&x, &Frame::text(r#"{"type":"nope"}"#));
        hub.receive(&x, &Frame::text("{broken"));
        hub.receive(&x, &Frame::text(r#"{"type":"ok"}"#));
        assert_eq!(*hits.lock(), 1);

        let _ = hub.close(&x, CloseInfo::abnormal());
        assert!(!x.off(id));
    }

    #[test]
    fn listener_can_reply_and_mutate_groups() {
        let hub = Hub::default();
        let _ = hub.on("join", |conn, payload| {
            let Some(id) = payload.and_then(Value::as_str) else {
                return;
            };
            if let Some(hub) = conn.hub() {
                let _ = hub.join(id, conn);
            }
            let _ = conn.send("joined", id);
        });
        let (x, tx) = join(&hub);
        hub.receive(&x, &Frame::text(r#"{"type":"join","payload":"lobby"}"#));
        assert_eq!(x.groups(), vec![GroupId::from("lobby")]);
        assert_eq!(tx.texts(), vec![r#"{"type":"joined","payload":"lobby"}"#.to_owned()]);
    }

    #[test]
    fn transport_failure_during_fan_out_is_reported() {
        let hub = Hub::default();
        let errors = Arc::new(PlMutex::new(Vec::new()));
        let e = Arc::clone(&errors);
        let _ = hub.on_error(move |err, conn| {
            e.lock().push((err.to_string(), conn.map(|c| c.id().clone())));
        });
        let (a, _ta) = join(&hub);
        let (b, tb) = join(&hub);
        tb.fail_with(Some(TransportError::QueueFull));

        assert_eq!(hub.send_all("x", 1).unwrap(), 1);
        assert_eq!(
            *errors.lock(),
            vec![("send queue full".to_owned(), Some(b.id().clone()))]
        );
        assert!(a.is_open());
    }

    #[test]
    fn fan_out_skips_closing_members() {
        let hub = Hub::default();
        let (a, ta) = join(&hub);
        let (_b, tb) = join(&hub);
        assert!(a.disconnect(1000, "bye"));
        assert_eq!(hub.send_all("x", 1).unwrap(), 1);
        assert!(ta.frames().is_empty());
        assert_eq!(tb.frames().len(), 1);
    }

    #[test]
    fn dropped_hub_detaches_groups_and_broadcast() {
        let hub = Hub::default();
        let (a, _t) = join(&hub);
        let g = hub.group("g");
        let _ = g.add(&a).unwrap();
        drop(hub);
        assert!(!g.is_attached());
        assert_eq!(g.len(), 0);
        assert_matches!(a.broadcast("x", 1), Err(WsxError::HubGone));
        assert_matches!(g.add(&a), Err(WsxError::GroupDetached(_)));
    }
}
