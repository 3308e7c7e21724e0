//! Route handlers.

use std::convert::Infallible;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use prlens_core::Event;
use prlens_router::{RouterError, SessionRouter};
use prlens_tokens::ParsedMessage;
use prlens_upstream::{PromptRequest, SendOutcome};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::health::{HealthResponse, health_check};
use crate::metrics::StreamGauge;
use crate::server::AppState;

/// How often a send re-checks for the session's event stream.
const SUBSCRIBE_POLL: Duration = Duration::from_millis(25);

fn frame(event: &Event) -> Option<SseEvent> {
    match SseEvent::default().json_data(event) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(error = %e, event_type = event.event_type(), "failed to encode event");
            None
        }
    }
}

fn require_session(session_id: &str) -> Result<(), ApiError> {
    if session_id.trim().is_empty() {
        return Err(ApiError::BadRequest("session id is empty".into()));
    }
    Ok(())
}

/// `GET /api/sessions/{id}/events`: the session's event stream.
///
/// The first frame is `connected`. The subscription lives inside the
/// response stream, so it is released when the client goes away.
pub(crate) async fn session_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    require_session(&session_id)?;
    let mut subscription = state.router.subscribe(&session_id).map_err(|e| match e {
        RouterError::ShutDown => ApiError::Unavailable("server is shutting down".into()),
    })?;
    info!(session_id, sub_id = subscription.id(), "event stream opened");

    let stream = async_stream::stream! {
        let _gauge = StreamGauge::open();
        if let Some(first) = frame(&Event::Connected) {
            yield Ok(first);
        }
        while let Some(event) = subscription.recv().await {
            if let Some(frame) = frame(&event) {
                yield Ok(frame);
            }
        }
        debug!(
            session_id = subscription.session_id(),
            dropped = subscription.dropped(),
            "event stream closed"
        );
    };
    let keep_alive = (state.settings)().server.keep_alive();
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(keep_alive)))
}

/// `DELETE /api/sessions/{id}/events`: retire the session's subscription.
pub(crate) async fn close_session_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> StatusCode {
    if state.router.unsubscribe(&session_id) {
        info!(session_id, "event stream closed by request");
    }
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MessageBody {
    text: String,
    #[serde(default)]
    agent_mode: Option<String>,
}

/// Wait until `session_id` has a live subscription, or `timeout` elapses.
async fn wait_subscribed(router: &SessionRouter, session_id: &str, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while !router.is_subscribed(session_id) {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(SUBSCRIBE_POLL).await;
    }
    true
}

/// `POST /api/sessions/{id}/messages`.
///
/// Gives the caller's event stream up to the configured send wait to attach
/// so the response's first events are not lost, then sends regardless.
pub(crate) async fn send_message(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<MessageBody>,
) -> Result<Response, ApiError> {
    require_session(&session_id)?;
    if body.text.trim().is_empty() {
        return Err(ApiError::BadRequest("message text is empty".into()));
    }
    let wait = (state.settings)().client.send_wait_timeout();
    if !wait_subscribed(&state.router, &session_id, wait).await {
        warn!(
            session_id,
            wait_ms = wait.as_millis(),
            "no event stream attached, sending anyway"
        );
    }
    let request = PromptRequest {
        text: body.text,
        agent_mode: body.agent_mode,
    };
    match state.control.send_message(&session_id, &request).await? {
        outcome @ SendOutcome::Accepted => Ok((StatusCode::ACCEPTED, Json(outcome)).into_response()),
        SendOutcome::Rejected { reason } => Err(ApiError::Rejected(reason)),
    }
}

/// `POST /api/sessions/{id}/abort`.
pub(crate) async fn abort(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    require_session(&session_id)?;
    state.control.abort(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub(crate) struct ParseBody {
    content: String,
}

/// `POST /api/parse`: run the token parser over `content`.
pub(crate) async fn parse(Json(body): Json<ParseBody>) -> Json<ParsedMessage> {
    Json(prlens_tokens::parse(&body.content))
}

/// `GET /health`.
pub(crate) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let upstream = *state.upstream.borrow();
    Json(health_check(
        state.start_time,
        upstream,
        state.router.subscription_count(),
    ))
}

/// `GET /metrics`: Prometheus text format.
pub(crate) async fn metrics(State(state): State<AppState>) -> Result<Response, ApiError> {
    let handle = state
        .metrics
        .as_ref()
        .ok_or_else(|| ApiError::Unavailable("metrics recorder not installed".into()))?;
    Ok((
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
        .into_response())
}
