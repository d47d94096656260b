//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use wsx_core::TypePolicy;
use wsx_core::logging::LogFormat;

/// Configuration for a wsx server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `8080`; `0` picks a free port).
    pub port: u16,
    /// Route that upgrades to a WebSocket (default `"/ws"`).
    pub path: String,
    /// Upgrades beyond this many live connections are refused with 503.
    pub max_connections: usize,
    /// Seconds between server pings.
    pub heartbeat_interval_secs: u64,
    /// Seconds of silence after which a connection is dropped.
    pub heartbeat_timeout_secs: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Per-connection outbound queue length.
    pub send_queue_capacity: usize,
    /// Sub-protocols the server may select, in preference order.
    pub protocols: Vec<String>,
    /// Accepted message types; empty accepts everything.
    pub allowed_types: Vec<String>,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            path: "/ws".into(),
            max_connections: 1024,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            send_queue_capacity: 256,
            protocols: Vec::new(),
            allowed_types: Vec::new(),
            log_level: "info".into(),
            log_format: LogFormat::Compact,
        }
    }
}

impl ServerConfig {
    /// `host:port` for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Ping interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// Silence allowed before a connection is dropped.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs.max(1))
    }

    /// Type policy built from `allowed_types`.
    pub fn type_policy(&self) -> TypePolicy {
        TypePolicy::from_list(self.allowed_types.iter().cloned())
    }
}
