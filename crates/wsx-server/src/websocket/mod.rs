//! WebSocket session handling.

pub mod heartbeat;
pub mod session;
