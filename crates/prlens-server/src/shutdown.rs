//! Graceful shutdown via `CancellationToken`.

use std::time::Duration;

use prlens_router::SessionRouter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Stops the connector, the HTTP server and every open session stream.
///
/// Open SSE responses only end when their subscription is retired, so
/// shutting the router down is what lets the server drain.
#[derive(Clone, Debug)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    router: SessionRouter,
}

impl ShutdownCoordinator {
    /// Coordinator for `router`.
    pub fn new(router: SessionRouter) -> Self {
        Self {
            token: CancellationToken::new(),
            router,
        }
    }

    /// Token cancelled on shutdown.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("shutting down");
        }
        self.token.cancel();
        self.router.shutdown();
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown begins, with the router already shut down.
    pub async fn wait(&self) {
        self.token.cancelled().await;
        self.router.shutdown();
    }

    /// Shut down and wait up to `timeout` for `handles`.
    pub async fn graceful_shutdown(&self, handles: Vec<JoinHandle<()>>, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        self.shutdown();
        info!(task_count = handles.len(), timeout_secs = timeout.as_secs(), "waiting for tasks");
        if tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!("shutdown timed out after {timeout:?}, some tasks may still be running");
        }
    }
}
