//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use wsx_core::TypePolicy;

/// Configuration for a wsx client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Outbound queue length.
    pub send_queue_capacity: usize,
    /// Requested sub-protocols (`Sec-WebSocket-Protocol`).
    pub protocols: Vec<String>,
    /// Accepted message types; empty accepts everything.
    pub allowed_types: Vec<String>,
    /// Handshake deadline in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: 256,
            protocols: Vec::new(),
            allowed_types: Vec::new(),
            connect_timeout_secs: 10,
        }
    }
}

impl ClientConfig {
    /// Handshake deadline.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    /// Type policy built from `allowed_types`.
    pub fn type_policy(&self) -> TypePolicy {
        TypePolicy::from_list(self.allowed_types.iter().cloned())
    }
}
