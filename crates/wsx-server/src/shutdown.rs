//! Server shutdown: one token that every session watches, plus a tracker so
//! the listener can wait for sessions to finish their close handshakes.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tokio_util::task::task_tracker::TrackedFuture;
use tracing::{debug, info, warn};

/// How long [`ShutdownCoordinator::drain`] waits when no timeout is given.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared between the listener and the upgrade handler.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    sessions: TaskTracker,
}

impl ShutdownCoordinator {
    /// Create a coordinator with no sessions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when shutdown begins. Sessions answer it with 1001.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether [`trigger`](Self::trigger) has run.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Begin shutdown. Safe to call more than once.
    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            debug!(sessions = self.sessions.len(), "shutdown triggered");
        }
        self.token.cancel();
    }

    /// Wrap a session future so [`drain`](Self::drain) waits for it.
    pub fn track_session<F: Future>(&self, session: F) -> TrackedFuture<F> {
        self.sessions.track_future(session)
    }

    /// Sessions that have not finished yet.
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Trigger shutdown, then wait for `listener` and every tracked session.
    ///
    /// Returns `false` if `timeout` (default 30s) elapsed first; unfinished
    /// sessions are left running.
    pub async fn drain(&self, listener: JoinHandle<()>, timeout: Option<Duration>) -> bool {
        let timeout = timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT);
        self.trigger();
        let _ = self.sessions.close();
        info!(
            sessions = self.sessions.len(),
            timeout_secs = timeout.as_secs(),
            "draining sessions"
        );

        let all_done = async {
            if let Err(e) = listener.await {
                warn!(error = %e, "listener task failed");
            }
            self.sessions.wait().await;
        };
        if tokio::time::timeout(timeout, all_done).await.is_err() {
            warn!(
                remaining = self.sessions.len(),
                "drain timed out after {timeout:?}"
            );
            return false;
        }
        true
    }
}
