//! Sources of a session's event stream.

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use futures::stream::BoxStream;
use prlens_core::text::encode_path_segment;
use prlens_core::{ConnectionError, Event};
use prlens_router::{RouterError, SessionRouter};
use reqwest::header::ACCEPT;
use tracing::{debug, warn};

/// Events for one session. The stream ending, or yielding an error, means
/// the link was interrupted.
pub type EventStream = BoxStream<'static, Result<Event, ConnectionError>>;

/// Something a [`crate::SessionClient`] can attach to.
#[async_trait]
pub trait EventFeed: Send + Sync {
    /// Open the event stream for `session_id`.
    async fn attach(&self, session_id: &str) -> Result<EventStream, ConnectionError>;
}

/// Attaches directly to an in-process [`SessionRouter`].
#[derive(Clone, Debug)]
pub struct RouterFeed {
    router: SessionRouter,
}

impl RouterFeed {
    /// Feed over `router`.
    pub fn new(router: SessionRouter) -> Self {
        Self { router }
    }
}

#[async_trait]
impl EventFeed for RouterFeed {
    async fn attach(&self, session_id: &str) -> Result<EventStream, ConnectionError> {
        let mut subscription = self.router.subscribe(session_id).map_err(|e| match e {
            RouterError::ShutDown => ConnectionError::Closed,
        })?;
        let stream = async_stream::stream! {
            while let Some(event) = subscription.recv().await {
                yield Ok(event);
            }
        };
        Ok(stream.boxed())
    }
}

/// Attaches to the server's SSE endpoint, `GET {base}/api/sessions/{id}/events`.
#[derive(Clone, Debug)]
pub struct HttpFeed {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFeed {
    /// Feed against the server at `base_url`.
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> Result<Self, ConnectionError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        let base_url: String = base_url.into();
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn events_url(&self, session_id: &str) -> String {
        format!(
            "{}/api/sessions/{}/events",
            self.base_url,
            encode_path_segment(session_id)
        )
    }
}

#[async_trait]
impl EventFeed for HttpFeed {
    async fn attach(&self, session_id: &str) -> Result<EventStream, ConnectionError> {
        let response = self
            .client
            .get(self.events_url(session_id))
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| ConnectionError::Unreachable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ConnectionError::Status {
                status: status.as_u16(),
            });
        }

        let mut frames = response.bytes_stream().eventsource();
        let stream = async_stream::stream! {
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(frame) => match serde_json::from_str::<Event>(&frame.data) {
                        Ok(event) => yield Ok(event),
                        Err(e) => warn!(error = %e, "skipping undecodable frame"),
                    },
                    Err(e) => {
                        debug!(error = %e, "event stream broke");
                        yield Err(ConnectionError::Transport(e.to_string()));
                        break;
                    }
                }
            }
        };
        Ok(stream.boxed())
    }
}
