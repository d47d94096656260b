//! Demo handlers for `wsx serve`: echo plus rooms.
//!
//! - `echo {text}` replies `echo {text}` to the sender; ignored unless
//!   `text` is a string
//! - `join {id}` / `leave {id}` manage room membership and confirm with
//!   `joined` / `left`
//! - `say {id?, text}` sends `said {from, text}` to the room (or everyone),
//!   excluding the sender

use serde_json::{Value, json};
use tracing::{info, warn};
use wsx_core::{Connection, GroupId, Hub};

/// Register the demo listeners on `hub`.
pub fn install(hub: &Hub) {
    let _ = hub.on_connect(|conn| info!(conn_id = %conn.id(), "client joined"));
    let _ = hub.on_disconnect(|conn, status| {
        info!(conn_id = %conn.id(), code = status.code, "client left");
    });
    let _ = hub.on_error(|err, conn| match conn {
        Some(conn) => warn!(conn_id = %conn.id(), error = %err, "connection error"),
        None => warn!(error = %err, "server error"),
    });
    let _ = hub.on("echo", on_echo);
    let _ = hub.on("join", on_join);
    let _ = hub.on("leave", on_leave);
    let _ = hub.on("say", on_say);
}

fn field<'a>(payload: Option<&'a Value>, name: &str) -> Option<&'a str> {
    payload?.get(name)?.as_str()
}

fn on_echo(conn: &Connection, payload: Option<&Value>) {
    let Some(text) = field(payload, "text") else {
        return;
    };
    if let Err(e) = conn.send("echo", json!({ "text": text })) {
        warn!(conn_id = %conn.id(), error = %e, "echo failed");
    }
}

fn on_join(conn: &Connection, payload: Option<&Value>) {
    let (Some(hub), Some(id)) = (conn.hub(), field(payload, "id")) else {
        return;
    };
    match hub.join(id, conn) {
        Ok(_) => {
            let _ = conn.send("joined", json!({ "id": id }));
        }
        Err(e) => warn!(conn_id = %conn.id(), group_id = id, error = %e, "join failed"),
    }
}

fn on_leave(conn: &Connection, payload: Option<&Value>) {
    let (Some(hub), Some(id)) = (conn.hub(), field(payload, "id")) else {
        return;
    };
    let left = hub
        .find_group(&GroupId::from(id))
        .is_some_and(|group| group.delete(conn.id()));
    if left {
        let _ = conn.send("left", json!({ "id": id }));
    }
}

fn on_say(conn: &Connection, payload: Option<&Value>) {
    let Some(text) = field(payload, "text") else {
        return;
    };
    let message = json!({ "from": conn.id(), "text": text });
    let result = match field(payload, "id") {
        Some(id) => conn.broadcast_to(&GroupId::from(id), "said", message),
        None => conn.broadcast("said", message),
    };
    if let Err(e) = result {
        warn!(conn_id = %conn.id(), error = %e, "say failed");
    }
}
