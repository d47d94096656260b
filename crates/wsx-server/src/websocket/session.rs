//! WebSocket session lifecycle. Drives a single upgraded socket from accept
//! through close, feeding events into the [`Hub`].

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use wsx_core::{
    CloseInfo, CloseRequest, Frame, Hub, OutboundQueue, Outgoing, QueuedTransport, Transport,
    TransportError,
};

use super::heartbeat::{Heartbeat, HeartbeatAction};
use crate::config::ServerConfig;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL, WS_FRAMES_DROPPED_TOTAL, WS_FRAMES_RECEIVED_TOTAL,
    WS_HEARTBEAT_TIMEOUTS_TOTAL,
};

/// How long to wait for the peer's close frame after sending ours.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-session knobs taken from [`ServerConfig`].
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Outbound queue length.
    pub send_queue_capacity: usize,
    /// Ping period.
    pub heartbeat_interval: Duration,
    /// Silence allowed before the connection is dropped.
    pub heartbeat_timeout: Duration,
}

impl From<&ServerConfig> for SessionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            send_queue_capacity: config.send_queue_capacity,
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
        }
    }
}

/// Why the writer task stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
enum WriterExit {
    /// A close frame was sent (or the queue ended).
    Closed,
    /// The peer missed too many heartbeats.
    TimedOut { silent: Duration },
    /// Writing to the socket failed.
    SocketError(String),
}

/// Run a WebSocket session for one upgraded socket.
///
/// 1. Registers a connection with the hub (fires `connect`)
/// 2. Spawns a writer that drains the outbound queue and sends pings
/// 3. Routes inbound text and binary frames through the hub
/// 4. Sends `1001` when `cancel` fires
/// 5. Reports the close status and deregisters on exit
#[instrument(skip_all, fields(conn_id = tracing::field::Empty))]
pub async fn run_ws_session(
    ws: WebSocket,
    hub: Hub,
    settings: SessionSettings,
    cancel: CancellationToken,
) {
    let (sink, mut stream) = ws.split();
    let (transport, queue) = QueuedTransport::channel(settings.send_queue_capacity);
    let transport = Arc::new(transport);

    let connection = hub.accept(Arc::clone(&transport) as Arc<dyn Transport>);
    let _ = tracing::Span::current().record("conn_id", tracing::field::display(connection.id()));
    info!("client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let heartbeat = Heartbeat::new(settings.heartbeat_interval, settings.heartbeat_timeout);
    let mut writer: JoinHandle<WriterExit> =
        tokio::spawn(write_loop(sink, queue, Arc::clone(&transport), heartbeat));
    let mut writer_done = false;
    let mut shutdown_sent = false;
    let mut close_deadline: Option<Instant> = None;
    let mut close_info: Option<CloseInfo> = None;

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(msg)) => {
                    transport.mark_alive();
                    match msg {
                        Message::Text(text) => {
                            counter!(WS_FRAMES_RECEIVED_TOTAL, "kind" => "text").increment(1);
                            hub.receive(&connection, &Frame::text(text.as_str()));
                        }
                        Message::Binary(bytes) => {
                            counter!(WS_FRAMES_RECEIVED_TOTAL, "kind" => "binary").increment(1);
                            hub.receive(&connection, &Frame::Binary(bytes));
                        }
                        Message::Close(frame) => {
                            debug!(?frame, "close frame received");
                            close_info = Some(frame.map_or_else(CloseInfo::no_status, |f| {
                                CloseInfo::new(f.code, f.reason.as_str(), true)
                            }));
                        }
                        Message::Ping(_) | Message::Pong(_) => {}
                    }
                }
                Some(Err(e)) => {
                    debug!(error = %e, "socket read failed");
                    hub.fail(&connection, TransportError::Io(e.to_string()));
                    break;
                }
                None => break,
            },
            exit = &mut writer, if !writer_done => {
                writer_done = true;
                match exit {
                    Ok(WriterExit::Closed) => {
                        close_deadline = Some(Instant::now() + CLOSE_HANDSHAKE_TIMEOUT);
                    }
                    Ok(WriterExit::TimedOut { silent }) => {
                        warn!(?silent, "client unresponsive, disconnecting");
                        counter!(WS_HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
                        break;
                    }
                    Ok(WriterExit::SocketError(e)) => {
                        hub.fail(&connection, TransportError::Io(e));
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "writer task failed");
                        break;
                    }
                }
            },
            () = cancel.cancelled(), if !shutdown_sent => {
                shutdown_sent = true;
                let _ = connection.disconnect(CloseInfo::GOING_AWAY, "server shutting down");
            },
            () = sleep_until(close_deadline) => {
                debug!("close handshake timed out");
                break;
            },
        }
    }

    if !writer_done {
        writer.abort();
    }

    let status = close_info.unwrap_or_else(CloseInfo::abnormal);
    info!(code = status.code, was_clean = status.was_clean, "client disconnected");
    let _ = hub.close(&connection, status);

    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection.age().as_secs_f64());
    let dropped = transport.drop_count();
    if dropped > 0 {
        counter!(WS_FRAMES_DROPPED_TOTAL).increment(dropped);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Drain the outbound queue onto the socket and send heartbeat pings.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: OutboundQueue,
    transport: Arc<QueuedTransport>,
    mut heartbeat: Heartbeat,
) -> WriterExit {
    let mut ticker = tokio::time::interval(heartbeat.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            item = queue.next() => match item {
                Some(Outgoing::Frame(frame)) => {
                    if let Err(e) = sink.send(frame_message(frame)).await {
                        return WriterExit::SocketError(e.to_string());
                    }
                }
                Some(Outgoing::Close(request)) => {
                    if let Err(e) = sink.send(close_message(request)).await {
                        debug!(error = %e, "close frame not sent");
                    }
                    return WriterExit::Closed;
                }
                None => return WriterExit::Closed,
            },
            _ = ticker.tick() => match heartbeat.tick(transport.check_alive()) {
                HeartbeatAction::Ping => {
                    if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                        return WriterExit::SocketError(e.to_string());
                    }
                }
                HeartbeatAction::TimedOut => {
                    return WriterExit::TimedOut { silent: transport.last_pong_elapsed() };
                }
            },
        }
    }
}

/// Every recipient of a broadcast gets the same buffer; only the UTF-8
/// check runs per socket.
fn frame_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => {
            let bytes = text.into_bytes();
            Utf8Bytes::try_from(bytes.clone()).map_or(Message::Binary(bytes), Message::Text)
        }
        Frame::Binary(bytes) => Message::Binary(bytes),
    }
}

fn close_message(request: CloseRequest) -> Message {
    match (request.code, request.reason) {
        (None, None) => Message::Close(None),
        (code, reason) => Message::Close(Some(CloseFrame {
            code: code.unwrap_or(CloseInfo::NORMAL),
            reason: reason.unwrap_or_default().into(),
        })),
    }
}
