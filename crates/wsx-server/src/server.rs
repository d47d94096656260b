//! Server assembly: router, upgrade handler, listener and handle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use chrono::{DateTime, Utc};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use wsx_core::{ExtensionSet, Hub, Plugin};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::metrics::WS_UPGRADES_REJECTED_TOTAL;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::session::{SessionSettings, run_ws_session};

/// Everything needed to build a [`Server`].
pub struct ServerOptions {
    /// Listener and session settings.
    pub config: ServerConfig,
    /// Layers applied to every accepted connection.
    pub extensions: ExtensionSet,
    /// Run once, in order, at the end of [`Server::new`].
    pub plugins: Vec<Plugin<Server>>,
}

impl ServerOptions {
    /// Options with `config` and the default extensions.
    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Add a plugin.
    #[must_use]
    pub fn plugin(mut self, plugin: impl FnOnce(&mut Server) + Send + 'static) -> Self {
        self.plugins.push(Box::new(plugin));
        self
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            config: ServerConfig::default(),
            extensions: ExtensionSet::server_defaults(),
            plugins: Vec::new(),
        }
    }
}

/// Shared state passed to axum handlers.
#[derive(Clone)]
struct AppState {
    hub: Hub,
    shutdown: Arc<ShutdownCoordinator>,
    slots: Arc<Semaphore>,
    settings: SessionSettings,
    max_message_size: usize,
    protocols: Arc<[String]>,
    start_time: Instant,
    started_at: DateTime<Utc>,
    metrics: Option<PrometheusHandle>,
}

/// A wsx WebSocket server.
pub struct Server {
    config: ServerConfig,
    hub: Hub,
    shutdown: Arc<ShutdownCoordinator>,
    slots: Arc<Semaphore>,
    start_time: Instant,
    started_at: DateTime<Utc>,
    metrics: Option<PrometheusHandle>,
}

impl Server {
    /// Build a server. Plugins run after everything else is in place.
    pub fn new(options: ServerOptions) -> Self {
        let ServerOptions {
            config,
            extensions,
            plugins,
        } = options;
        let hub = Hub::with_policy(extensions, config.type_policy());
        let mut server = Self {
            slots: Arc::new(Semaphore::new(
                config.max_connections.min(Semaphore::MAX_PERMITS),
            )),
            config,
            hub,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            started_at: Utc::now(),
            metrics: None,
        };
        for plugin in plugins {
            plugin(&mut server);
        }
        server
    }

    /// A server with `config` and default extensions.
    pub fn with_config(config: ServerConfig) -> Self {
        Self::new(ServerOptions::with_config(config))
    }

    /// The routing hub.
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Active configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Serve `/metrics` from `handle`.
    pub fn set_metrics_handle(&mut self, handle: PrometheusHandle) {
        self.metrics = Some(handle);
    }

    /// Build the axum router.
    pub fn router(&self) -> Router {
        let state = AppState {
            hub: self.hub.clone(),
            shutdown: Arc::clone(&self.shutdown),
            slots: Arc::clone(&self.slots),
            settings: SessionSettings::from(&self.config),
            max_message_size: self.config.max_message_size,
            protocols: self.config.protocols.clone().into(),
            start_time: self.start_time,
            started_at: self.started_at,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route(&self.config.path, get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind and start serving in the background.
    pub async fn listen(self) -> std::io::Result<ServerHandle> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        let task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "server error");
            }
        });

        info!(%addr, path = %self.config.path, "wsx server listening");
        Ok(ServerHandle {
            addr,
            path: self.config.path,
            hub: self.hub,
            shutdown: self.shutdown,
            task,
        })
    }
}

/// A running server.
pub struct ServerHandle {
    addr: SocketAddr,
    path: String,
    hub: Hub,
    shutdown: Arc<ShutdownCoordinator>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The routing hub.
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// `ws://` URL of the upgrade route.
    pub fn url(&self) -> String {
        format!("ws://{}{}", self.addr, self.path)
    }

    /// Send 1001 to every session, stop accepting, and wait for sessions to
    /// end. Returns `false` if `timeout` (default 30s) elapsed first.
    pub async fn shutdown(self, timeout: Option<Duration>) -> bool {
        info!("shutting down");
        self.shutdown.drain(self.task, timeout).await
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.shutdown.is_shutting_down() {
        counter!(WS_UPGRADES_REJECTED_TOTAL, "reason" => "shutting_down").increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "server shutting down").into_response();
    }
    let Ok(permit) = Arc::clone(&state.slots).try_acquire_owned() else {
        warn!(
            connections = state.hub.connection_count(),
            "connection limit reached, refusing upgrade"
        );
        counter!(WS_UPGRADES_REJECTED_TOTAL, "reason" => "capacity").increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    };

    debug!("upgrading connection");
    let AppState {
        hub,
        shutdown,
        settings,
        max_message_size,
        protocols,
        ..
    } = state;
    ws.max_message_size(max_message_size)
        .protocols(protocols.iter().cloned())
        .on_upgrade(move |socket| {
            let cancel = shutdown.token();
            shutdown.track_session(async move {
                run_ws_session(socket, hub, settings, cancel).await;
                drop(permit);
            })
        })
        .into_response()
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.started_at,
        &state.hub,
        &state.shutdown,
    ))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    async fn get_status(router: Router, uri: &str) -> StatusCode {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        router.oneshot(req).await.unwrap().status()
    }

    #[test]
    fn default_options() {
        let server = Server::new(ServerOptions::default());
        assert_eq!(server.config().path, "/ws");
        assert_eq!(server.hub().connection_count(), 0);
        assert!(!server.shutdown().is_shutting_down());
    }

    #[test]
    fn plugins_run_once_in_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let first = Arc::clone(&calls);
        let second = Arc::clone(&calls);
        let server = Server::new(
            ServerOptions::default()
                .plugin(move |server| {
                    assert_eq!(first.fetch_add(1, Ordering::SeqCst), 0);
                    let _ = server.hub().group("lobby");
                })
                .plugin(move |_| {
                    assert_eq!(second.fetch_add(1, Ordering::SeqCst), 1);
                }),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(server.hub().group_count(), 1);
    }

    #[tokio::test]
    async fn health_endpoint_reports_counts() {
        let server = Server::with_config(ServerConfig::default());
        let _ = server.hub().group("lobby");
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 0);
        assert_eq!(parsed["groups"], 1);
        assert!(parsed["started_at"].is_string());
    }

    #[tokio::test]
    async fn plain_get_on_ws_path_is_a_client_error() {
        let server = Server::with_config(ServerConfig::default());
        assert!(get_status(server.router(), "/ws").await.is_client_error());
    }

    #[tokio::test]
    async fn custom_path_is_routed() {
        let server = Server::with_config(ServerConfig {
            path: "/socket".into(),
            ..ServerConfig::default()
        });
        assert!(get_status(server.router(), "/socket").await.is_client_error());
        assert_eq!(get_status(server.router(), "/ws").await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = Server::with_config(ServerConfig::default());
        assert_eq!(
            get_status(server.router(), "/nonexistent").await,
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn metrics_endpoint_needs_a_recorder() {
        let mut server = Server::with_config(ServerConfig::default());
        assert_eq!(get_status(server.router(), "/metrics").await, StatusCode::NOT_FOUND);

        server.set_metrics_handle(PrometheusBuilder::new().build_recorder().handle());
        assert_eq!(get_status(server.router(), "/metrics").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn listen_on_port_zero() {
        let server = Server::with_config(ServerConfig {
            port: 0,
            ..ServerConfig::default()
        });
        let handle = server.listen().await.unwrap();
        assert_ne!(handle.addr().port(), 0);
        assert!(handle.url().starts_with("ws://127.0.0.1:"));
        assert!(handle.url().ends_with("/ws"));
        assert!(handle.shutdown(Some(Duration::from_secs(5))).await);
    }
}
