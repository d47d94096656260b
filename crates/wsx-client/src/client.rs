//! The wsx client: one outbound connection driven by an I/O task.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{Instrument, debug, info, info_span};
use wsx_core::{
    CloseInfo, CloseRequest, Connection, ConnectionId, ConnectionState, Envelope, ExtensionSet,
    Frame, ListenerId, OutboundQueue, Outgoing, PeerLink, Plugin, QueuedTransport, Transport,
    TransportError, WsxError,
};

use crate::config::ClientConfig;
use crate::errors::{ClientError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long to wait for the server's close frame after sending ours.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to build a [`Client`].
pub struct ClientOptions {
    /// Queue, sub-protocol and type settings.
    pub config: ClientConfig,
    /// Layers applied to each connection.
    pub extensions: ExtensionSet,
    /// Run once, in order, at the end of [`Client::new`].
    pub plugins: Vec<Plugin<Client>>,
}

impl ClientOptions {
    /// Options with `config` and the default extensions.
    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Add a plugin.
    #[must_use]
    pub fn plugin(mut self, plugin: impl FnOnce(&mut Client) + Send + 'static) -> Self {
        self.plugins.push(Box::new(plugin));
        self
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            config: ClientConfig::default(),
            extensions: ExtensionSet::client_defaults(),
            plugins: Vec::new(),
        }
    }
}

/// A WebSocket client speaking the wsx envelope.
///
/// Listeners never receive a connection argument; the peer is always the
/// server this client connected to.
pub struct Client {
    url: String,
    config: ClientConfig,
    link: Arc<PeerLink>,
    closed: Arc<watch::Sender<bool>>,
    protocol: Mutex<Option<String>>,
    io: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Build a client for `url`. Nothing connects until [`Client::connect`].
    pub fn new(url: impl Into<String>, options: ClientOptions) -> Self {
        let ClientOptions {
            config,
            extensions,
            plugins,
        } = options;
        let (closed, _) = watch::channel(true);
        let mut client = Self {
            url: url.into(),
            link: Arc::new(PeerLink::new(extensions, config.type_policy())),
            config,
            closed: Arc::new(closed),
            protocol: Mutex::new(None),
            io: Mutex::new(None),
        };
        for plugin in plugins {
            plugin(&mut client);
        }
        client
    }

    /// Target URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Active configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Perform the handshake and start the I/O task. Fires `connect`.
    pub async fn connect(&self) -> Result<()> {
        if self.io.lock().as_ref().is_some_and(|task| !task.is_finished()) {
            return Err(ClientError::AlreadyConnected);
        }

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;
        if !self.config.protocols.is_empty() {
            let value = HeaderValue::from_str(&self.config.protocols.join(", "))
                .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;
            let _ = request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }

        debug!(url = %self.url, "connecting");
        let deadline = self.config.connect_timeout();
        let (ws, response) = tokio::time::timeout(deadline, connect_async(request))
            .await
            .map_err(|_| ClientError::Timeout(deadline))??;
        *self.protocol.lock() = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let (transport, queue) = QueuedTransport::channel(self.config.send_queue_capacity);
        let transport = Arc::new(transport);
        let _ = self.closed.send_replace(false);
        let connection = self.link.attach(Arc::clone(&transport) as Arc<dyn Transport>);
        info!(url = %self.url, conn_id = %connection.id(), "connected");

        let span = info_span!("wsx_client", conn_id = %connection.id());
        let task = tokio::spawn(
            run_io(
                ws,
                queue,
                transport,
                Arc::clone(&self.link),
                Arc::clone(&self.closed),
            )
            .instrument(span),
        );
        *self.io.lock() = Some(task);
        Ok(())
    }

    /// Sub-protocol the server selected, if any.
    pub fn protocol(&self) -> Option<String> {
        self.protocol.lock().clone()
    }

    /// State of the current connection; `Closed` before the first connect.
    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    /// Id of the current (or last) connection.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.link.connection().map(|conn| conn.id().clone())
    }

    fn connection(&self) -> wsx_core::Result<Connection> {
        self.link.connection().ok_or(WsxError::NotConnected)
    }

    /// Send a typed message.
    pub fn send(&self, kind: impl Into<String>, payload: impl Serialize) -> wsx_core::Result<()> {
        self.connection()?.send(kind, payload)
    }

    /// Send raw bytes as a binary frame.
    pub fn send_raw(&self, bytes: impl Into<Bytes>) -> wsx_core::Result<()> {
        self.connection()?.send_raw(bytes)
    }

    /// Send a JSON value as-is.
    pub fn send_value(&self, value: Value) -> wsx_core::Result<()> {
        self.connection()?.send_value(value)
    }

    /// Start an orderly close. Returns `false` if not open.
    pub fn disconnect(&self, code: u16, reason: &str) -> bool {
        self.link
            .connection()
            .is_some_and(|conn| conn.disconnect(code, reason))
    }

    /// Resolves once the connection has fully closed (immediately if there
    /// is none).
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    // ── Listeners ──────────────────────────────────────────────────────

    /// Handshake completed.
    pub fn on_connect(&self, f: impl Fn() + Send + Sync + 'static) -> ListenerId {
        self.link.dispatcher().on_connect(move |()| f())
    }

    /// Connection closed.
    pub fn on_disconnect(&self, f: impl Fn(&CloseInfo) + Send + Sync + 'static) -> ListenerId {
        self.link.dispatcher().on_disconnect(move |(), info| f(info))
    }

    /// Transport, codec or policy error.
    pub fn on_error(&self, f: impl Fn(&WsxError) + Send + Sync + 'static) -> ListenerId {
        self.link.dispatcher().on_error(move |err, _| f(err))
    }

    /// Every accepted message.
    pub fn on_message(&self, f: impl Fn(&Envelope) + Send + Sync + 'static) -> ListenerId {
        self.link.dispatcher().on_message(move |(), envelope| f(envelope))
    }

    /// Typed messages of `kind`.
    pub fn on(
        &self,
        kind: impl Into<String>,
        f: impl Fn(Option<&Value>) + Send + Sync + 'static,
    ) -> ListenerId {
        self.link.dispatcher().on(kind, move |(), payload| f(payload))
    }

    /// The next typed message of `kind` only.
    pub fn once(
        &self,
        kind: impl Into<String>,
        f: impl FnOnce(Option<&Value>) + Send + 'static,
    ) -> ListenerId {
        self.link.dispatcher().once(kind, move |(), payload| f(payload))
    }

    /// Remove a listener.
    pub fn off(&self, id: ListenerId) -> bool {
        self.link.dispatcher().off(id)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.disconnect(CloseInfo::GOING_AWAY, "client dropped");
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("url", &self.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Pump frames both ways until the socket closes.
async fn run_io(
    ws: WsStream,
    mut queue: OutboundQueue,
    transport: Arc<QueuedTransport>,
    link: Arc<PeerLink>,
    closed: Arc<watch::Sender<bool>>,
) {
    let (mut sink, mut stream) = ws.split();
    let mut writing = true;
    let mut close_deadline: Option<Instant> = None;
    let mut close_info: Option<CloseInfo> = None;

    loop {
        tokio::select! {
            item = queue.next(), if writing => match item {
                Some(Outgoing::Frame(frame)) => {
                    if let Err(e) = sink.send(frame_message(frame)).await {
                        link.fail(TransportError::Io(e.to_string()));
                        break;
                    }
                }
                Some(Outgoing::Close(request)) => {
                    writing = false;
                    if let Err(e) = sink.send(close_message(request)).await {
                        debug!(error = %e, "close frame not sent");
                    }
                    close_deadline = Some(Instant::now() + CLOSE_HANDSHAKE_TIMEOUT);
                }
                None => writing = false,
            },
            msg = stream.next() => match msg {
                Some(Ok(msg)) => {
                    transport.mark_alive();
                    match msg {
                        Message::Text(text) => link.receive(&Frame::text(text.as_str())),
                        Message::Binary(bytes) => link.receive(&Frame::Binary(bytes)),
                        Message::Close(frame) => {
                            debug!(?frame, "close frame received");
                            close_info = Some(frame.map_or_else(CloseInfo::no_status, |f| {
                                CloseInfo::new(u16::from(f.code), f.reason.as_str(), true)
                            }));
                        }
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                    }
                }
                Some(Err(e)) => {
                    link.fail(TransportError::Io(e.to_string()));
                    break;
                }
                None => break,
            },
            () = sleep_until(close_deadline) => {
                debug!("close handshake timed out");
                break;
            },
        }
    }

    let _ = link.close(close_info.unwrap_or_else(CloseInfo::abnormal));
    let _ = closed.send_replace(true);
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

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
            code: CloseCode::from(code.unwrap_or(CloseInfo::NORMAL)),
            reason: reason.unwrap_or_default().into(),
        })),
    }
}
