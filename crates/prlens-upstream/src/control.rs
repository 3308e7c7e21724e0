//! Send-message / abort control surface of the agent runtime.

use async_trait::async_trait;
use prlens_core::ControlError;
use prlens_core::text::{encode_path_segment, truncate_str};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::connector::UpstreamConfig;

/// Longest error body kept in a [`ControlError::Server`] or rejection reason.
const MAX_BODY_BYTES: usize = 512;

/// A user message for a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptRequest {
    /// Message text.
    pub text: String,
    /// Agent mode to run the prompt with (e.g. `plan`, `build`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_mode: Option<String>,
}

impl PromptRequest {
    /// Prompt without an agent mode.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            agent_mode: None,
        }
    }

    /// Set the agent mode.
    #[must_use]
    pub fn with_agent_mode(mut self, mode: impl Into<String>) -> Self {
        self.agent_mode = Some(mode.into());
        self
    }
}

/// Whether the runtime took the prompt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SendOutcome {
    /// Queued; the response arrives on the event stream.
    Accepted,
    /// Refused by the runtime (unknown session, busy, invalid agent).
    Rejected {
        /// Runtime-provided reason.
        reason: String,
    },
}

/// Control operations on a running agent session.
#[async_trait]
pub trait AgentControl: Send + Sync {
    /// Submit a user message. The reply streams in as events.
    async fn send_message(
        &self,
        session_id: &str,
        request: &PromptRequest,
    ) -> Result<SendOutcome, ControlError>;

    /// Stop whatever the session is doing.
    async fn abort(&self, session_id: &str) -> Result<(), ControlError>;
}

#[derive(Serialize)]
struct PromptBody<'a> {
    parts: [TextPart<'a>; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    agent: Option<&'a str>,
}

#[derive(Serialize)]
struct TextPart<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

/// HTTP implementation against an OpenCode-style runtime.
#[derive(Clone, Debug)]
pub struct OpencodeControl {
    client: reqwest::Client,
    base_url: String,
    directory: Option<String>,
}

impl OpencodeControl {
    /// Client for the runtime described by `config`.
    pub fn new(config: &UpstreamConfig) -> Result<Self, ControlError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ControlError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            directory: config.directory.clone(),
        })
    }

    fn session_url(&self, session_id: &str, action: &str) -> String {
        format!(
            "{}/session/{}/{action}",
            self.base_url,
            encode_path_segment(session_id)
        )
    }

    fn post(&self, url: String) -> reqwest::RequestBuilder {
        let request = self.client.post(url);
        match &self.directory {
            Some(directory) => request.query(&[("directory", directory)]),
            None => request,
        }
    }
}

#[async_trait]
impl AgentControl for OpencodeControl {
    async fn send_message(
        &self,
        session_id: &str,
        request: &PromptRequest,
    ) -> Result<SendOutcome, ControlError> {
        if session_id.is_empty() {
            return Err(ControlError::InvalidRequest("session id is empty".into()));
        }
        if request.text.trim().is_empty() {
            return Err(ControlError::InvalidRequest("message text is empty".into()));
        }

        let body = PromptBody {
            parts: [TextPart {
                kind: "text",
                text: &request.text,
            }],
            agent: request.agent_mode.as_deref(),
        };
        let response = self
            .post(self.session_url(session_id, "prompt_async"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ControlError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            info!(session_id, agent = ?request.agent_mode, "prompt accepted");
            return Ok(SendOutcome::Accepted);
        }

        let text = response.text().await.unwrap_or_default();
        let body = truncate_str(text.trim(), MAX_BODY_BYTES).to_string();
        if status.is_client_error() {
            let reason = if body.is_empty() {
                format!("runtime returned {}", status.as_u16())
            } else {
                body
            };
            warn!(session_id, status = status.as_u16(), %reason, "prompt rejected");
            return Ok(SendOutcome::Rejected { reason });
        }
        Err(ControlError::Server {
            status: status.as_u16(),
            body,
        })
    }

    async fn abort(&self, session_id: &str) -> Result<(), ControlError> {
        if session_id.is_empty() {
            return Err(ControlError::InvalidRequest("session id is empty".into()));
        }
        let response = self
            .post(self.session_url(session_id, "abort"))
            .send()
            .await
            .map_err(|e| ControlError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(session_id, "abort sent");
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(ControlError::Server {
            status: status.as_u16(),
            body: truncate_str(text.trim(), MAX_BODY_BYTES).to_string(),
        })
    }
}
