//! `/health` endpoint body.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use wsx_core::Hub;

use crate::shutdown::ShutdownCoordinator;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"draining"` once shutdown has begun.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Start time, RFC 3339.
    pub started_at: String,
    /// Connections registered with the hub.
    pub connections: usize,
    /// Session tasks still running, including ones mid close handshake.
    pub sessions: usize,
    /// Live groups.
    pub groups: usize,
}

/// Snapshot the hub and shutdown state.
pub fn health_check(
    start_time: Instant,
    started_at: DateTime<Utc>,
    hub: &Hub,
    shutdown: &ShutdownCoordinator,
) -> HealthResponse {
    HealthResponse {
        status: if shutdown.is_shutting_down() { "draining" } else { "ok" },
        uptime_secs: start_time.elapsed().as_secs(),
        started_at: started_at.to_rfc3339(),
        connections: hub.connection_count(),
        sessions: shutdown.active_sessions(),
        groups: hub.group_count(),
    }
}
