//! Canonical event model for the review pipeline.
//!
//! Every frame the agent runtime emits is decoded into one [`Event`]. All
//! variants except [`Event::Connected`] carry the `sessionId` the router
//! uses to pick a subscriber. `Connected` goes to every live subscriber.
//!
//! The serde representation is the consumer-facing wire format: an
//! internally tagged object with a snake_case `type` and camelCase fields.
//! [`Event::to_frame`] wraps it as a `data: <json>\n\n` SSE frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Agent activity state for a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// The agent is working on a prompt.
    Busy,
    /// The agent is waiting for input.
    Idle,
    /// The agent hit a retryable provider error and will try again.
    Retry,
}

impl SessionStatus {
    /// Wire name of the status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Busy => "busy",
            Self::Idle => "idle",
            Self::Retry => "retry",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of agent output, routed by session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Event {
    /// The stream is live. Carries no session and is broadcast to everyone.
    Connected,

    /// Incremental assistant text.
    TextDelta {
        /// Owning session.
        session_id: String,
        /// Assistant message the part belongs to.
        message_id: String,
        /// Text part being extended.
        part_id: String,
        /// Appended text.
        delta: String,
    },

    /// Incremental reasoning text.
    ReasoningDelta {
        /// Owning session.
        session_id: String,
        /// Assistant message the part belongs to.
        message_id: String,
        /// Reasoning part being extended.
        part_id: String,
        /// Appended text.
        delta: String,
    },

    /// A tool call was issued.
    ToolStart {
        /// Owning session.
        session_id: String,
        /// Assistant message the call belongs to.
        message_id: String,
        /// Tool part id.
        part_id: String,
        /// Tool name.
        tool: String,
        /// Tool call id, stable across the call lifecycle.
        call_id: String,
        /// Tool input as sent by the model.
        #[serde(default)]
        input: Value,
    },

    /// A tool call is executing.
    ToolRunning {
        /// Owning session.
        session_id: String,
        /// Assistant message the call belongs to.
        message_id: String,
        /// Tool part id.
        part_id: String,
        /// Tool name.
        tool: String,
        /// Tool call id.
        call_id: String,
        /// Human-readable progress title, when the runtime has one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },

    /// A tool call finished.
    ToolDone {
        /// Owning session.
        session_id: String,
        /// Assistant message the call belongs to.
        message_id: String,
        /// Tool part id.
        part_id: String,
        /// Tool name.
        tool: String,
        /// Tool call id.
        call_id: String,
        /// Tool output.
        output: String,
        /// Summary title.
        title: String,
    },

    /// A tool call failed.
    ToolError {
        /// Owning session.
        session_id: String,
        /// Assistant message the call belongs to.
        message_id: String,
        /// Tool part id.
        part_id: String,
        /// Tool name.
        tool: String,
        /// Tool call id.
        call_id: String,
        /// Failure description.
        error: String,
    },

    /// Session activity changed.
    StatusChanged {
        /// Owning session.
        session_id: String,
        /// New status.
        status: SessionStatus,
        /// Extra detail (retry reason).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// A session-scoped failure reported by the runtime.
    #[serde(rename = "error")]
    StreamError {
        /// Owning session.
        session_id: String,
        /// Error class name from the runtime.
        code: String,
        /// Error message.
        message: String,
    },

    /// An assistant message completed.
    Done {
        /// Owning session.
        session_id: String,
        /// Completed message.
        message_id: String,
    },
}

impl Event {
    /// Session this event is routed to. `None` for [`Event::Connected`].
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Connected => None,
            Self::TextDelta { session_id, .. }
            | Self::ReasoningDelta { session_id, .. }
            | Self::ToolStart { session_id, .. }
            | Self::ToolRunning { session_id, .. }
            | Self::ToolDone { session_id, .. }
            | Self::ToolError { session_id, .. }
            | Self::StatusChanged { session_id, .. }
            | Self::StreamError { session_id, .. }
            | Self::Done { session_id, .. } => Some(session_id),
        }
    }

    /// Wire `type` string.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::TextDelta { .. } => "text_delta",
            Self::ReasoningDelta { .. } => "reasoning_delta",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolRunning { .. } => "tool_running",
            Self::ToolDone { .. } => "tool_done",
            Self::ToolError { .. } => "tool_error",
            Self::StatusChanged { .. } => "status_changed",
            Self::StreamError { .. } => "error",
            Self::Done { .. } => "done",
        }
    }

    /// Whether this event is broadcast to every subscriber.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Whether this event ends the current assistant turn.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::StreamError { .. })
    }

    /// Whether this event is part of a tool call lifecycle.
    #[must_use]
    pub fn is_tool_event(&self) -> bool {
        matches!(
            self,
            Self::ToolStart { .. }
                | Self::ToolRunning { .. }
                | Self::ToolDone { .. }
                | Self::ToolError { .. }
        )
    }

    /// Serialize as a single SSE frame: `data: <json>\n\n`.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_string(self)?;
        Ok(format!("data: {json}\n\n"))
    }
}
