//! Router and dispatcher.
//!
//! Inbound frames are decoded, checked against the [`TypePolicy`], and then
//! announced twice: first on the generic `message` notification with the
//! whole envelope, then on the type-scoped notification with the payload
//! only. Listener lists are cloned under a read lock and invoked after it is
//! released, so a listener may register other listeners or mutate groups.
//!
//! Type-scoped listeners registered with [`Dispatcher::once`] are
//! unregistered before they run and fire at most once.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{trace, warn};

use crate::codec::{Envelope, Frame, decode};
use crate::errors::{Result, WsxError};
use crate::transport::CloseInfo;

/// Handle returned by every `on_*` registration, accepted by
/// [`Dispatcher::off`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ConnectHandler<P> = Arc<dyn Fn(&P) + Send + Sync>;
type DisconnectHandler<P> = Arc<dyn Fn(&P, &CloseInfo) + Send + Sync>;
type ErrorHandler<P> = Arc<dyn Fn(&WsxError, Option<&P>) + Send + Sync>;
type MessageHandler<P> = Arc<dyn Fn(&P, &Envelope) + Send + Sync>;
type TypedHandler<P> = Arc<dyn Fn(&P, Option<&Value>) + Send + Sync>;

struct Listeners<P> {
    next_id: u64,
    connect: Vec<(ListenerId, ConnectHandler<P>)>,
    disconnect: Vec<(ListenerId, DisconnectHandler<P>)>,
    error: Vec<(ListenerId, ErrorHandler<P>)>,
    message: Vec<(ListenerId, MessageHandler<P>)>,
    typed: HashMap<String, Vec<(ListenerId, TypedHandler<P>)>>,
    once: HashSet<ListenerId>,
}

impl<P> Listeners<P> {
    fn next_id(&mut self) -> ListenerId {
        self.next_id += 1;
        ListenerId(self.next_id)
    }
}

impl<P> Default for Listeners<P> {
    fn default() -> Self {
        Self {
            next_id: 0,
            connect: Vec::new(),
            disconnect: Vec::new(),
            error: Vec::new(),
            message: Vec::new(),
            typed: HashMap::new(),
            once: HashSet::new(),
        }
    }
}

fn handlers<H: Clone>(list: &[(ListenerId, H)]) -> Vec<H> {
    list.iter().map(|(_, handler)| handler.clone()).collect()
}

fn remove_typed<H>(typed: &mut HashMap<String, Vec<(ListenerId, H)>>, id: ListenerId) -> bool {
    let mut removed = false;
    typed.retain(|_, list| {
        removed |= remove(list, id);
        !list.is_empty()
    });
    removed
}

fn remove<H>(list: &mut Vec<(ListenerId, H)>, id: ListenerId) -> bool {
    let before = list.len();
    list.retain(|(existing, _)| *existing != id);
    list.len() != before
}

/// Which message types are accepted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TypePolicy {
    /// Every type is accepted.
    #[default]
    AllowAll,
    /// Only the listed types are accepted.
    AllowList(HashSet<String>),
}

impl TypePolicy {
    /// Build a policy from a configured list; an empty list allows all.
    pub fn from_list<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: HashSet<String> = types.into_iter().map(Into::into).collect();
        if set.is_empty() {
            Self::AllowAll
        } else {
            Self::AllowList(set)
        }
    }

    /// Whether `kind` is accepted.
    pub fn allows(&self, kind: &str) -> bool {
        match self {
            Self::AllowAll => true,
            Self::AllowList(set) => set.contains(kind),
        }
    }
}

/// Listener registry and inbound router for peers of type `P`.
pub struct Dispatcher<P> {
    listeners: RwLock<Listeners<P>>,
    policy: RwLock<TypePolicy>,
}

impl<P> Dispatcher<P> {
    /// A dispatcher with no listeners that accepts every type.
    pub fn new() -> Self {
        Self::with_policy(TypePolicy::AllowAll)
    }

    /// A dispatcher with the given type policy.
    pub fn with_policy(policy: TypePolicy) -> Self {
        Self {
            listeners: RwLock::new(Listeners::default()),
            policy: RwLock::new(policy),
        }
    }

    /// Replace the type policy.
    pub fn set_policy(&self, policy: TypePolicy) {
        *self.policy.write() = policy;
    }

    /// Current type policy.
    pub fn policy(&self) -> TypePolicy {
        self.policy.read().clone()
    }

    /// Register a `connect` listener.
    pub fn on_connect(&self, f: impl Fn(&P) + Send + Sync + 'static) -> ListenerId {
        let handler: ConnectHandler<P> = Arc::new(f);
        let mut listeners = self.listeners.write();
        let id = listeners.next_id();
        listeners.connect.push((id, handler));
        id
    }

    /// Register a `disconnect` listener.
    pub fn on_disconnect(&self, f: impl Fn(&P, &CloseInfo) + Send + Sync + 'static) -> ListenerId {
        let handler: DisconnectHandler<P> = Arc::new(f);
        let mut listeners = self.listeners.write();
        let id = listeners.next_id();
        listeners.disconnect.push((id, handler));
        id
    }

    /// Register an `error` listener.
    pub fn on_error(
        &self,
        f: impl Fn(&WsxError, Option<&P>) + Send + Sync + 'static,
    ) -> ListenerId {
        let handler: ErrorHandler<P> = Arc::new(f);
        let mut listeners = self.listeners.write();
        let id = listeners.next_id();
        listeners.error.push((id, handler));
        id
    }

    /// Register a generic `message` listener.
    pub fn on_message(&self, f: impl Fn(&P, &Envelope) + Send + Sync + 'static) -> ListenerId {
        let handler: MessageHandler<P> = Arc::new(f);
        let mut listeners = self.listeners.write();
        let id = listeners.next_id();
        listeners.message.push((id, handler));
        id
    }

    /// Register a listener for one message type.
    pub fn on(
        &self,
        kind: impl Into<String>,
        f: impl Fn(&P, Option<&Value>) + Send + Sync + 'static,
    ) -> ListenerId {
        let handler: TypedHandler<P> = Arc::new(f);
        let mut listeners = self.listeners.write();
        let id = listeners.next_id();
        listeners
            .typed
            .entry(kind.into())
            .or_default()
            .push((id, handler));
        id
    }

    /// Register a listener for the next message of one type only.
    pub fn once(
        &self,
        kind: impl Into<String>,
        f: impl FnOnce(&P, Option<&Value>) + Send + 'static,
    ) -> ListenerId {
        let slot = Mutex::new(Some(f));
        let id = self.on(kind, move |peer, payload| {
            let f = slot.lock().take();
            if let Some(f) = f {
                f(peer, payload);
            }
        });
        let _ = self.listeners.write().once.insert(id);
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let listeners = &mut *listeners;
        let _ = listeners.once.remove(&id);
        remove(&mut listeners.connect, id)
            || remove(&mut listeners.disconnect, id)
            || remove(&mut listeners.error, id)
            || remove(&mut listeners.message, id)
            || remove_typed(&mut listeners.typed, id)
    }

    /// Remove every listener.
    pub fn clear(&self) {
        *self.listeners.write() = Listeners::default();
    }

    /// Whether any error listener is registered.
    pub fn has_error_listeners(&self) -> bool {
        !self.listeners.read().error.is_empty()
    }

    /// Fire `connect`.
    pub fn emit_connect(&self, peer: &P) {
        let list = handlers(&self.listeners.read().connect);
        for handler in list {
            handler(peer);
        }
    }

    /// Fire `disconnect`.
    pub fn emit_disconnect(&self, peer: &P, info: &CloseInfo) {
        let list = handlers(&self.listeners.read().disconnect);
        for handler in list {
            handler(peer, info);
        }
    }

    /// Fire `error`. Logged at `warn` when nobody is listening.
    pub fn emit_error(&self, error: &WsxError, peer: Option<&P>) {
        let list = handlers(&self.listeners.read().error);
        if list.is_empty() {
            warn!(error = %error, "unhandled error");
            return;
        }
        for handler in list {
            handler(error, peer);
        }
    }

    /// Decode a frame, check the policy and notify listeners. Returns the
    /// envelope so further listener sets can be notified. Errors are
    /// returned, not emitted.
    pub fn dispatch(&self, peer: &P, frame: &Frame) -> Result<Envelope> {
        let envelope = decode(frame)?;
        if let Some(kind) = envelope.kind() {
            if !self.policy.read().allows(kind) {
                return Err(WsxError::DisallowedType(kind.to_owned()));
            }
        }
        self.notify(peer, &envelope);
        Ok(envelope)
    }

    /// Fire `message`, then the listeners for the envelope's type. No
    /// decoding and no policy check.
    pub fn notify(&self, peer: &P, envelope: &Envelope) {
        let (generic, typed, has_once) = {
            let listeners = self.listeners.read();
            let typed: Vec<(ListenerId, TypedHandler<P>)> = envelope
                .kind()
                .and_then(|kind| listeners.typed.get(kind))
                .cloned()
                .unwrap_or_default();
            let has_once = typed.iter().any(|(id, _)| listeners.once.contains(id));
            (handlers(&listeners.message), typed, has_once)
        };
        if has_once {
            let mut listeners = self.listeners.write();
            let listeners = &mut *listeners;
            for (id, _) in &typed {
                if listeners.once.remove(id) {
                    let _ = remove_typed(&mut listeners.typed, *id);
                }
            }
        }
        trace!(
            kind = envelope.kind().unwrap_or("-"),
            generic = generic.len(),
            typed = typed.len(),
            "dispatching message"
        );

        for handler in generic {
            handler(peer, envelope);
        }
        for (_, handler) in typed {
            handler(peer, envelope.payload());
        }
    }

    /// [`dispatch`](Self::dispatch), surfacing any error on the `error`
    /// notification with the peer attached.
    pub fn route(&self, peer: &P, frame: &Frame) {
        if let Err(error) = self.dispatch(peer, frame) {
            self.emit_error(&error, Some(peer));
        }
    }
}

impl<P> Default for Dispatcher<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> fmt::Debug for Dispatcher<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.read();
        f.debug_struct("Dispatcher")
            .field("connect", &listeners.connect.len())
            .field("disconnect", &listeners.disconnect.len())
            .field("error", &listeners.error.len())
            .field("message", &listeners.message.len())
            .field("typed", &listeners.typed.keys().collect::<Vec<_>>())
            .field("policy", &*self.policy.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording() -> (Dispatcher<()>, Log) {
        let dispatcher = Dispatcher::new();
        let log: Log = Arc::default();
        let l = Arc::clone(&log);
        let _ = dispatcher.on_message(move |_, env| {
            l.lock().push(format!("message:{}", env.kind().unwrap_or("-")));
        });
        let l = Arc::clone(&log);
        let _ = dispatcher.on("echo", move |_, payload| {
            l.lock().push(format!("echo:{}", payload.map_or("none".into(), Value::to_string)));
        });
        let l = Arc::clone(&log);
        let _ = dispatcher.on_error(move |err, _| {
            l.lock().push(format!("error:{err}"));
        });
        (dispatcher, log)
    }

    #[test]
    fn generic_fires_before_typed() {
        let (dispatcher, log) = recording();
        dispatcher.route(&(), &Frame::text(r#"{"type":"echo","payload":{"text":"hi"}}"#));
        assert_eq!(
            *log.lock(),
            vec!["message:echo".to_owned(), r#"echo:{"text":"hi"}"#.to_owned()]
        );
    }

    #[test]
    fn typed_listener_gets_none_without_payload() {
        let (dispatcher, log) = recording();
        dispatcher.route(&(), &Frame::text(r#"{"type":"echo"}"#));
        assert_eq!(log.lock()[1], "echo:none");
    }

    #[test]
    fn binary_only_fires_generic() {
        let (dispatcher, log) = recording();
        dispatcher.route(&(), &Frame::binary(vec![1u8, 2]));
        assert_eq!(*log.lock(), vec!["message:-".to_owned()]);
    }

    #[test]
    fn invalid_json_is_surfaced_and_later_frames_still_dispatch() {
        let (dispatcher, log) = recording();
        dispatcher.route(&(), &Frame::text("{nope"));
        dispatcher.route(&(), &Frame::text(r#"{"type":"echo","payload":1}"#));
        let log = log.lock();
        assert!(log[0].starts_with("error:invalid JSON"));
        assert_eq!(log[1..], ["message:echo".to_owned(), "echo:1".to_owned()]);
    }

    #[test]
    fn disallowed_type_fires_neither_notification() {
        let (dispatcher, log) = recording();
        dispatcher.set_policy(TypePolicy::from_list(["chat"]));
        assert_matches!(
            dispatcher.dispatch(&(), &Frame::text(r#"{"type":"echo"}"#)),
            Err(WsxError::DisallowedType(kind)) if kind == "echo"
        );
        dispatcher.route(&(), &Frame::text(r#"{"type":"echo"}"#));
        assert_eq!(*log.lock(), vec!["error:message type 'echo' is not allowed".to_owned()]);
    }

    #[test]
    fn policy_does_not_apply_to_untyped_or_raw() {
        let (dispatcher, log) = recording();
        dispatcher.set_policy(TypePolicy::from_list(["chat"]));
        dispatcher.route(&(), &Frame::text(r#"{"free":"form"}"#));
        dispatcher.route(&(), &Frame::binary(vec![0u8]));
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn empty_list_allows_all() {
        assert_eq!(TypePolicy::from_list(Vec::<String>::new()), TypePolicy::AllowAll);
        assert!(TypePolicy::AllowAll.allows("anything"));
    }

    #[test]
    fn off_removes_listener() {
        let dispatcher: Dispatcher<()> = Dispatcher::new();
        let hits = Arc::new(Mutex::new(0));
        let h = Arc::clone(&hits);
        let id = dispatcher.on("tick", move |_, _| *h.lock() += 1);
        dispatcher.route(&(), &Frame::text(r#"{"type":"tick"}"#));
        assert!(dispatcher.off(id));
        assert!(!dispatcher.off(id));
        dispatcher.route(&(), &Frame::text(r#"{"type":"tick"}"#));
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn once_fires_for_the_first_match_only() {
        let (dispatcher, log) = recording();
        let l = Arc::clone(&log);
        let id = dispatcher.once("echo", move |_, payload| {
            l.lock().push(format!("once:{}", payload.map_or("none".into(), Value::to_string)));
        });
        dispatcher.route(&(), &Frame::text(r#"{"type":"echo","payload":1}"#));
        dispatcher.route(&(), &Frame::text(r#"{"type":"echo","payload":2}"#));

        assert_eq!(
            *log.lock(),
            vec!["message:echo", "echo:1", "once:1", "message:echo", "echo:2"]
        );
        assert!(!dispatcher.off(id));
        assert!(dispatcher.listeners.read().once.is_empty());
    }

    #[test]
    fn once_can_be_cancelled_before_it_fires() {
        let dispatcher: Dispatcher<()> = Dispatcher::new();
        let hits = Arc::new(Mutex::new(0));
        let h = Arc::clone(&hits);
        let id = dispatcher.once("tick", move |_, _| *h.lock() += 1);
        assert!(dispatcher.off(id));
        dispatcher.route(&(), &Frame::text(r#"{"type":"tick"}"#));
        assert_eq!(*hits.lock(), 0);
    }

    #[test]
    fn once_ignores_other_types_and_disallowed_messages() {
        let dispatcher: Dispatcher<()> = Dispatcher::with_policy(TypePolicy::from_list(["ready"]));
        let hits = Arc::new(Mutex::new(0));
        let h = Arc::clone(&hits);
        let _ = dispatcher.once("ready", move |_, _| *h.lock() += 1);
        dispatcher.route(&(), &Frame::text(r#"{"type":"other"}"#));
        assert_eq!(*hits.lock(), 0);
        dispatcher.route(&(), &Frame::text(r#"{"type":"ready"}"#));
        dispatcher.route(&(), &Frame::text(r#"{"type":"ready"}"#));
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn clear_drops_every_listener() {
        let (dispatcher, log) = recording();
        dispatcher.clear();
        dispatcher.route(&(), &Frame::text(r#"{"type":"echo"}"#));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn listener_may_register_listeners() {
        let dispatcher: Arc<Dispatcher<()>> = Arc::new(Dispatcher::new());
        let inner = Arc::clone(&dispatcher);
        let _ = dispatcher.on_connect(move |()| {
            let _ = inner.on_connect(|()| {});
        });
        dispatcher.emit_connect(&());
        assert_eq!(dispatcher.listeners.read().connect.len(), 2);
    }

    #[test]
    fn error_without_listener_is_logged() {
        let (logs, _guard) = crate::logging::capture_logs();
        let dispatcher: Dispatcher<()> = Dispatcher::new();
        assert!(!dispatcher.has_error_listeners());
        dispatcher.route(&(), &Frame::text("garbage"));
        assert!(logs.has_event(tracing::Level::WARN, "unhandled error"));
    }

    #[test]
    fn disconnect_receives_close_info() {
        let dispatcher: Dispatcher<()> = Dispatcher::new();
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        let _ = dispatcher.on_disconnect(move |(), info| *s.lock() = Some(info.clone()));
        dispatcher.emit_disconnect(&(), &CloseInfo::new(1000, "bye", true));
        assert_eq!(*seen.lock(), Some(CloseInfo::new(1000, "bye", true)));
    }
}
