//! Server shutdown: stop accepting, close every session, then wait for the
//! session tasks and background jobs to finish.
//!
//! Every WebSocket session runs inside a [`TaskTracker`], so shutdown can
//! tell a drained server from one that still has sessions unwinding.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TrackedFuture;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::registry::SessionRegistry;

/// How long to wait for sessions and tasks before giving up.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// What a [`ShutdownCoordinator::shutdown`] call did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
    /// Client sockets force-closed by the registry sweep.
    pub clients_closed: usize,
    /// Target connections destroyed by the registry sweep.
    pub targets_destroyed: usize,
    /// Session tasks still running when the timeout hit.
    pub sessions_left: usize,
    /// `false` if the timeout hit first.
    pub drained: bool,
}

/// Owns the process-wide cancellation token and the set of live session
/// tasks.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    sessions: TaskTracker,
    registry: Arc<SessionRegistry>,
}

impl ShutdownCoordinator {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            token: CancellationToken::new(),
            sessions: TaskTracker::new(),
            registry,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wrap a session future so shutdown waits for it.
    pub fn track_session<F: Future>(&self, session: F) -> TrackedFuture<F> {
        self.sessions.track_future(session)
    }

    /// Session tasks that have not returned yet.
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Cancel the token, close every registered client and target, then
    /// wait up to `timeout` for the sessions and `tasks` to finish.
    ///
    /// Calling it again is harmless; the second sweep finds nothing.
    pub async fn shutdown(
        &self,
        tasks: Vec<JoinHandle<()>>,
        timeout: Option<Duration>,
    ) -> ShutdownReport {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        self.token.cancel();
        let _ = self.sessions.close();
        let swept = self.registry.cleanup_all();
        info!(
            sessions = self.sessions.len(),
            task_count = tasks.len(),
            clients_closed = swept.clients_removed,
            targets_destroyed = swept.targets_removed,
            timeout_ms = timeout.as_millis() as u64,
            "waiting for sessions to finish"
        );

        let drain = async {
            let _ = futures::future::join_all(tasks).await;
            self.sessions.wait().await;
        };
        let drained = tokio::time::timeout(timeout, drain).await.is_ok();
        let report = ShutdownReport {
            clients_closed: swept.clients_removed,
            targets_destroyed: swept.targets_removed,
            sessions_left: self.sessions.len(),
            drained,
        };
        if !drained {
            warn!(
                sessions_left = report.sessions_left,
                "shutdown timed out after {timeout:?}"
            );
        }
        report
    }
}
