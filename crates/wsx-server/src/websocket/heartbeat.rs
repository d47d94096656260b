//! Ping/pong liveness tracking.

use std::time::Duration;

/// What the writer should do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a ping and keep going.
    Ping,
    /// The peer missed too many pings in a row.
    TimedOut,
}

/// Missed-ping counter driven by the session writer.
///
/// On each `interval` tick the writer reports whether the peer showed any
/// activity since the previous tick. After `max_missed` consecutive silent
/// ticks the connection is considered dead. `max_missed` is
/// `timeout / interval`, clamped to at least 1.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    interval: Duration,
    max_missed: u32,
    missed: u32,
}

impl Heartbeat {
    /// Build from the configured interval and timeout.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        let interval = interval.max(Duration::from_secs(1));
        let ratio = timeout.as_millis() / interval.as_millis();
        Self {
            interval,
            max_missed: u32::try_from(ratio).unwrap_or(u32::MAX).max(1),
            missed: 0,
        }
    }

    /// Tick period.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Consecutive silent ticks allowed.
    pub fn max_missed(&self) -> u32 {
        self.max_missed
    }

    /// Record a tick.
    pub fn tick(&mut self, alive: bool) -> HeartbeatAction {
        if alive {
            self.missed = 0;
            return HeartbeatAction::Ping;
        }
        self.missed += 1;
        if self.missed >= self.max_missed {
            HeartbeatAction::TimedOut
        } else {
            HeartbeatAction::Ping
        }
    }
}
