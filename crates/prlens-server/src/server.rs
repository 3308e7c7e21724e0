//! Axum router, shared state and the serve loop.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use prlens_router::SessionRouter;
use prlens_settings::PrlensSettings;
use prlens_upstream::{AgentControl, ConnectorState};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers;
use crate::shutdown::ShutdownCoordinator;

/// Shared state accessible from handlers.
#[derive(Clone)]
pub struct AppState {
    /// Per-session fan-out.
    pub router: SessionRouter,
    /// Send / abort surface of the agent runtime.
    pub control: Arc<dyn AgentControl>,
    /// Upstream connector state, for `/health`.
    pub upstream: watch::Receiver<ConnectorState>,
    /// Prometheus handle; `/metrics` answers 503 without one.
    pub metrics: Option<PrometheusHandle>,
    /// Where handlers read live settings (keep-alive, send wait) per request.
    pub settings: fn() -> Arc<PrlensSettings>,
    /// When the server started.
    pub start_time: Instant,
}

impl AppState {
    /// State reading the process-wide settings, with no metrics handle.
    pub fn new(
        router: SessionRouter,
        control: Arc<dyn AgentControl>,
        upstream: watch::Receiver<ConnectorState>,
    ) -> Self {
        Self {
            router,
            control,
            upstream,
            metrics: None,
            settings: prlens_settings::get_settings,
            start_time: Instant::now(),
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Read settings from `source` instead of the process-wide cache.
    #[must_use]
    pub fn with_settings(mut self, source: fn() -> Arc<PrlensSettings>) -> Self {
        self.settings = source;
        self
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("router", &self.router)
            .field("upstream", &*self.upstream.borrow())
            .finish_non_exhaustive()
    }
}

/// Build the router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/sessions/{id}/events",
            get(handlers::session_events).delete(handlers::close_session_events),
        )
        .route("/api/sessions/{id}/messages", post(handlers::send_message))
        .route("/api/sessions/{id}/abort", post(handlers::abort))
        .route("/api/parse", post(handlers::parse))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serve `app` on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: ShutdownCoordinator,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;
    info!("server stopped");
    Ok(())
}
