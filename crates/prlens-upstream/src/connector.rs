//! The single physical connection to the agent runtime.

use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use metrics::counter;
use prlens_core::retry::BackoffPolicy;
use prlens_core::text::preview;
use prlens_core::{ConnectionError, Event};
use prlens_router::SessionRouter;
use prlens_settings::UpstreamSettings;
use reqwest::header::ACCEPT;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::decoder::FrameDecoder;

/// Link state, observable through [`UpstreamConnector::watch_state`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorState {
    /// No live stream.
    Disconnected,
    /// Opening the stream.
    Connecting,
    /// Stream open and being read.
    Connected,
}

impl ConnectorState {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

/// Connection parameters.
#[derive(Clone, Debug)]
pub struct UpstreamConfig {
    /// Runtime base URL, without trailing slash.
    pub base_url: String,
    /// Project directory passed as `?directory=`.
    pub directory: Option<String>,
    /// Timeout for the TCP/TLS connect.
    pub connect_timeout: Duration,
    /// Reconnect policy.
    pub backoff: BackoffPolicy,
}

impl UpstreamConfig {
    /// Config for `base_url` with default timing.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            directory: None,
            connect_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
        }
    }

    /// Config from the `upstream` settings section.
    pub fn from_settings(settings: &UpstreamSettings) -> Self {
        Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            directory: settings.directory.clone(),
            connect_timeout: settings.connect_timeout(),
            backoff: settings.backoff.policy(),
        }
    }

    /// URL of the native event feed.
    pub fn event_url(&self) -> String {
        format!("{}/event", self.base_url)
    }
}

/// Reads the runtime's event feed and publishes decoded events to the router.
pub struct UpstreamConnector {
    config: UpstreamConfig,
    client: reqwest::Client,
    router: SessionRouter,
    state: watch::Sender<ConnectorState>,
}

impl UpstreamConnector {
    /// Build a connector. No I/O happens until [`run`](Self::run).
    pub fn new(config: UpstreamConfig, router: SessionRouter) -> Result<Self, ConnectionError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        let (state, _) = watch::channel(ConnectorState::Disconnected);
        Ok(Self {
            config,
            client,
            router,
            state,
        })
    }

    /// Current link state.
    pub fn state(&self) -> ConnectorState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectorState> {
        self.state.subscribe()
    }

    /// Connection parameters.
    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// Connect, read and reconnect until `cancel` fires or the backoff
    /// policy runs out of attempts. A rejected connect (4xx other than 429)
    /// is returned at once.
    ///
    /// A dropped stream is not reported to sessions; they only see
    /// `Connected` again once the link is back.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ConnectionError> {
        let mut failures = 0u32;
        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }

            self.set_state(ConnectorState::Connecting);
            let opened = tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                opened = self.open() => opened,
            };

            match opened {
                Ok(response) => {
                    failures = 0;
                    self.set_state(ConnectorState::Connected);
                    info!(url = %self.config.event_url(), "upstream connected");
                    let _ = self.router.publish(&Event::Connected);

                    let outcome = self.pump(response, &cancel).await;
                    self.set_state(ConnectorState::Disconnected);
                    if cancel.is_cancelled() {
                        break Ok(());
                    }
                    match outcome {
                        Ok(()) => info!("upstream stream ended, reconnecting"),
                        Err(e) => warn!(error = %e, kind = e.kind(), "upstream stream failed, reconnecting"),
                    }
                }
                Err(e) => {
                    self.set_state(ConnectorState::Disconnected);
                    failures += 1;
                    if !e.is_retryable() {
                        error!(attempt = failures, error = %e, kind = e.kind(), "upstream connect rejected");
                        break Err(e);
                    }
                    if self.config.backoff.exhausted(failures) {
                        error!(attempts = failures, error = %e, "giving up on upstream");
                        break Err(ConnectionError::RetriesExhausted { attempts: failures });
                    }
                    warn!(attempt = failures, error = %e, "upstream connect failed");
                }
            }

            counter!("upstream_reconnects_total").increment(1);
            let delay = self.config.backoff.delay_for(failures.saturating_sub(1));
            debug!(delay_ms = delay.as_millis() as u64, attempt = failures, "upstream backoff");
            tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                () = tokio::time::sleep(delay) => {}
            }
        };
        self.set_state(ConnectorState::Disconnected);
        result
    }

    async fn open(&self) -> Result<reqwest::Response, ConnectionError> {
        let mut request = self
            .client
            .get(self.config.event_url())
            .header(ACCEPT, "text/event-stream");
        if let Some(directory) = &self.config.directory {
            request = request.query(&[("directory", directory)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ConnectionError::Unreachable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ConnectionError::Status {
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    /// Read frames until the stream ends, fails or `cancel` fires.
    async fn pump(
        &self,
        response: reqwest::Response,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        let mut decoder = FrameDecoder::new();
        let mut frames = response.bytes_stream().eventsource();

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                next = frames.next() => next,
            };
            let frame = match next {
                None => return Ok(()),
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return Err(ConnectionError::Transport(e.to_string())),
            };
            if frame.data.trim().is_empty() {
                continue;
            }
            counter!("upstream_frames_total").increment(1);

            match decoder.decode(&frame.data) {
                Ok(events) => {
                    for event in &events {
                        let report = self.router.publish(event);
                        debug!(
                            event_type = event.event_type(),
                            session_id = event.session_id().unwrap_or(""),
                            delivered = report.delivered,
                            "published upstream event"
                        );
                    }
                }
                Err(e) => {
                    counter!("upstream_decode_failures_total").increment(1);
                    warn!(error = %e, data = %preview(&frame.data, 200), "skipping undecodable frame");
                }
            }
        }
    }

    fn set_state(&self, state: ConnectorState) {
        let _ = self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}
