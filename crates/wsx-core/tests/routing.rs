//! Hub routing through the queued transport used by the adapters.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};
use wsx_core::{
    CloseInfo, Envelope, ExtensionSet, Frame, GroupId, Hub, Outgoing, QueuedTransport, Transport,
    TypePolicy, WsxError, decode,
};

fn next_envelope(item: Option<Outgoing>) -> Envelope {
    match item {
        Some(Outgoing::Frame(frame)) => decode(&frame).unwrap(),
        other => panic!("expected a frame, got {other:?}"),
    }
}

#[tokio::test]
async fn chat_room_round_trip() {
    let hub = Hub::new(ExtensionSet::server_defaults());
    let _ = hub.on("join", |conn, payload| {
        if let (Some(hub), Some(room)) = (conn.hub(), payload.and_then(Value::as_str)) {
            let _ = hub.join(room, conn);
        }
    });
    let _ = hub.on("say", |conn, payload| {
        let Some(payload) = payload else { return };
        let room = payload["room"].as_str().map(GroupId::from);
        let text = payload["text"].clone();
        let _ = match room {
            Some(room) => conn.broadcast_to(&room, "said", text),
            None => conn.broadcast("said", text),
        };
    });

    let (ta, mut qa) = QueuedTransport::channel(16);
    let (tb, mut qb) = QueuedTransport::channel(16);
    let (tc, mut qc) = QueuedTransport::channel(16);
    let a = hub.accept(Arc::new(ta));
    let b = hub.accept(Arc::new(tb));
    let c = hub.accept(Arc::new(tc));

    hub.receive(&a, &Frame::text(r#"{"type":"join","payload":"lobby"}"#));
    hub.receive(&b, &Frame::text(r#"{"type":"join","payload":"lobby"}"#));
    hub.receive(
        &a,
        &Frame::text(r#"{"type":"say","payload":{"room":"lobby","text":"hi"}}"#),
    );

    let got = next_envelope(qb.next().await);
    assert_eq!(got.kind(), Some("said"));
    assert_eq!(got.payload(), Some(&json!("hi")));

    assert!(a.disconnect(1000, "bye"));
    assert_eq!(
        qa.next().await,
        Some(Outgoing::Close(wsx_core::CloseRequest {
            code: Some(1000),
            reason: Some("bye".into()),
        }))
    );
    assert!(hub.close(&a, CloseInfo::new(1000, "bye", true)));
    assert!(hub.close(&b, CloseInfo::abnormal()));
    assert_eq!(hub.group_count(), 0);
    assert_eq!(hub.connection_count(), 1);

    drop(hub);
    drop(c);
    assert!(qc.next().await.is_none());
}

#[tokio::test]
async fn disallowed_types_are_reported_with_the_connection() {
    let hub = Hub::with_policy(ExtensionSet::server_defaults(), TypePolicy::from_list(["chat"]));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    let _ = hub.on_error(move |err, conn| {
        let is_disallowed = matches!(err, WsxError::DisallowedType(kind) if kind == "admin");
        s.lock().push((is_disallowed, conn.is_some()));
    });
    let s = Arc::clone(&seen);
    let _ = hub.on_message(move |_, _| s.lock().push((false, false)));

    let (transport, _queue) = QueuedTransport::channel(4);
    let conn = hub.accept(Arc::new(transport));
    hub.receive(&conn, &Frame::text(r#"{"type":"admin"}"#));

    assert_eq!(*seen.lock(), vec![(true, true)]);
}

#[tokio::test]
async fn full_queue_surfaces_as_error_and_counts_drops() {
    let hub = Hub::default();
    let errors = Arc::new(Mutex::new(0));
    let e = Arc::clone(&errors);
    let _ = hub.on_error(move |err, _| {
        if matches!(err, WsxError::Transport(wsx_core::TransportError::QueueFull)) {
            *e.lock() += 1;
        }
    });

    let (transport, _queue) = QueuedTransport::channel(1);
    let transport = Arc::new(transport);
    let _conn = hub.accept(Arc::clone(&transport) as Arc<dyn Transport>);

    assert_eq!(hub.send_all("tick", 1).unwrap(), 1);
    assert_eq!(hub.send_all("tick", 2).unwrap(), 0);
    assert_eq!(*errors.lock(), 1);
    assert_eq!(transport.drop_count(), 1);
}
