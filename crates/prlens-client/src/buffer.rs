//! Accumulated streaming state for the active session.

use std::collections::{HashMap, HashSet};

use prlens_core::{Event, SessionStatus};
use prlens_tokens::{StreamingParse, parse, parse_streaming};
use serde::Serialize;
use serde_json::Value;

/// Lifecycle of one tool call.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolCallStatus {
    /// Announced, not started.
    Pending,
    /// Executing.
    Running,
    /// Finished successfully.
    Completed {
        /// Tool output.
        output: String,
    },
    /// Finished with an error.
    Failed {
        /// Error text.
        error: String,
    },
}

impl ToolCallStatus {
    /// Whether the call has finished either way.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

/// One tool call seen on the stream.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    /// Call id.
    pub call_id: String,
    /// Message the call belongs to.
    pub message_id: String,
    /// Tool name.
    pub tool: String,
    /// Tool arguments.
    pub input: Value,
    /// Latest title, if any.
    pub title: Option<String>,
    /// Where the call stands.
    pub status: ToolCallStatus,
}

/// Last session-scoped error reported by the runtime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StreamFailure {
    /// Runtime error name.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

#[derive(Debug, Default)]
struct MessageText {
    message_id: String,
    /// Parts in first-seen order.
    parts: Vec<(String, String)>,
}

impl MessageText {
    fn push(&mut self, part_id: &str, delta: &str) {
        match self.parts.iter_mut().find(|(id, _)| id == part_id) {
            Some((_, text)) => text.push_str(delta),
            None => self.parts.push((part_id.to_string(), delta.to_string())),
        }
    }

    fn text(&self) -> String {
        self.parts.iter().map(|(_, text)| text.as_str()).collect()
    }
}

/// Folds a session's events into what a renderer needs: message text,
/// reasoning, tool calls and status.
///
/// Thrown away on session switch; nothing here outlives its session.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    messages: Vec<MessageText>,
    reasoning: HashMap<String, String>,
    tools: Vec<ToolCall>,
    status: Option<SessionStatus>,
    status_message: Option<String>,
    last_error: Option<StreamFailure>,
    completed: HashSet<String>,
    applied: u64,
}

impl StreamBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event in.
    pub fn apply(&mut self, event: &Event) {
        self.applied += 1;
        match event {
            Event::Connected => {}
            Event::TextDelta {
                message_id,
                part_id,
                delta,
                ..
            } => self.message_mut(message_id).push(part_id, delta),
            Event::ReasoningDelta {
                message_id, delta, ..
            } => self
                .reasoning
                .entry(message_id.clone())
                .or_default()
                .push_str(delta),
            Event::ToolStart {
                message_id,
                tool,
                call_id,
                input,
                ..
            } => {
                let call = self.tool_mut(call_id, message_id, tool);
                call.input = input.clone();
            }
            Event::ToolRunning {
                message_id,
                tool,
                call_id,
                title,
                ..
            } => {
                let call = self.tool_mut(call_id, message_id, tool);
                call.status = ToolCallStatus::Running;
                if title.is_some() {
                    call.title.clone_from(title);
                }
            }
            Event::ToolDone {
                message_id,
                tool,
                call_id,
                output,
                title,
                ..
            } => {
                let call = self.tool_mut(call_id, message_id, tool);
                call.status = ToolCallStatus::Completed {
                    output: output.clone(),
                };
                call.title = Some(title.clone());
            }
            Event::ToolError {
                message_id,
                tool,
                call_id,
                error,
                ..
            } => {
                let call = self.tool_mut(call_id, message_id, tool);
                call.status = ToolCallStatus::Failed {
                    error: error.clone(),
                };
            }
            Event::StatusChanged {
                status, message, ..
            } => {
                self.status = Some(*status);
                self.status_message.clone_from(message);
            }
            Event::StreamError { code, message, .. } => {
                self.last_error = Some(StreamFailure {
                    code: code.clone(),
                    message: message.clone(),
                });
            }
            Event::Done { message_id, .. } => {
                let _ = self.completed.insert(message_id.clone());
            }
        }
    }

    fn message_mut(&mut self, message_id: &str) -> &mut MessageText {
        let index = match self.messages.iter().position(|m| m.message_id == message_id) {
            Some(index) => index,
            None => {
                self.messages.push(MessageText {
                    message_id: message_id.to_string(),
                    parts: Vec::new(),
                });
                self.messages.len() - 1
            }
        };
        &mut self.messages[index]
    }

    fn tool_mut(&mut self, call_id: &str, message_id: &str, tool: &str) -> &mut ToolCall {
        let index = match self.tools.iter().position(|t| t.call_id == call_id) {
            Some(index) => index,
            None => {
                self.tools.push(ToolCall {
                    call_id: call_id.to_string(),
                    message_id: message_id.to_string(),
                    tool: tool.to_string(),
                    input: Value::Null,
                    title: None,
                    status: ToolCallStatus::Pending,
                });
                self.tools.len() - 1
            }
        };
        &mut self.tools[index]
    }

    /// Message ids with text, in first-seen order.
    pub fn message_ids(&self) -> Vec<&str> {
        self.messages.iter().map(|m| m.message_id.as_str()).collect()
    }

    /// Accumulated text of one message.
    pub fn message_text(&self, message_id: &str) -> Option<String> {
        self.messages
            .iter()
            .find(|m| m.message_id == message_id)
            .map(MessageText::text)
    }

    /// Id and text of the most recent message.
    pub fn latest(&self) -> Option<(&str, String)> {
        self.messages
            .last()
            .map(|m| (m.message_id.as_str(), m.text()))
    }

    /// Accumulated reasoning of one message.
    pub fn reasoning(&self, message_id: &str) -> Option<&str> {
        self.reasoning.get(message_id).map(String::as_str)
    }

    /// Every tool call seen, in first-seen order.
    pub fn tools(&self) -> &[ToolCall] {
        &self.tools
    }

    /// Tool calls that have not finished.
    pub fn pending_tools(&self) -> impl Iterator<Item = &ToolCall> {
        self.tools.iter().filter(|t| !t.status.is_finished())
    }

    /// One tool call by id.
    pub fn tool(&self, call_id: &str) -> Option<&ToolCall> {
        self.tools.iter().find(|t| t.call_id == call_id)
    }

    /// Latest reported session status.
    pub fn status(&self) -> Option<SessionStatus> {
        self.status
    }

    /// Message attached to the latest status (retry reason).
    pub fn status_message(&self) -> Option<&str> {
        self.status_message.as_deref()
    }

    /// Last runtime error for the session.
    pub fn last_error(&self) -> Option<&StreamFailure> {
        self.last_error.as_ref()
    }

    /// Whether the runtime has finished `message_id`.
    pub fn is_complete(&self, message_id: &str) -> bool {
        self.completed.contains(message_id)
    }

    /// Events applied so far.
    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Parse the latest message. A message still streaming keeps its
    /// unclosed directive tail aside as `pending`.
    pub fn parsed(&self) -> Option<StreamingParse> {
        let (message_id, text) = self.latest()?;
        if self.is_complete(message_id) {
            Some(StreamingParse {
                parsed: parse(&text),
                pending: String::new(),
            })
        } else {
            Some(parse_streaming(&text))
        }
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use prlens_tokens::{MessageSegment, Severity};
    use serde_json::json;

    use super::*;

    fn text(message: &str, part: &str, delta: &str) -> Event {
        Event::TextDelta {
            session_id: "ses_1".into(),
            message_id: message.into(),
            part_id: part.into(),
            delta: delta.into(),
        }
    }

    fn done(message: &str) -> Event {
        Event::Done {
            session_id: "ses_1".into(),
            message_id: message.into(),
        }
    }

    #[test]
    fn accumulates_parts_in_first_seen_order() {
        let mut buffer = StreamBuffer::new();
        buffer.apply(&text("msg_1", "prt_a", "Hello"));
        buffer.apply(&text("msg_1", "prt_b", " there"));
        buffer.apply(&text("msg_1", "prt_a", ", world."));
        assert_eq!(
            buffer.message_text("msg_1").as_deref(),
            Some("Hello, world. there")
        );
        assert_eq!(buffer.applied(), 3);
    }

    #[test]
    fn latest_message_wins() {
        let mut buffer = StreamBuffer::new();
        buffer.apply(&text("msg_1", "p", "first"));
        buffer.apply(&text("msg_2", "p", "second"));
        assert_eq!(buffer.message_ids(), vec!["msg_1", "msg_2"]);
        assert_eq!(buffer.latest(), Some(("msg_2", "second".to_string())));
    }

    #[test]
    fn reasoning_kept_separately() {
        let mut buffer = StreamBuffer::new();
        buffer.apply(&Event::ReasoningDelta {
            session_id: "ses_1".into(),
            message_id: "msg_1".into(),
            part_id: "prt_r".into(),
            delta: "thinking".into(),
        });
        assert_eq!(buffer.reasoning("msg_1"), Some("thinking"));
        assert!(buffer.message_text("msg_1").is_none());
    }

    #[test]
    fn tool_lifecycle() {
        let mut buffer = StreamBuffer::new();
        buffer.apply(&Event::ToolStart {
            session_id: "ses_1".into(),
            message_id: "msg_1".into(),
            part_id: "prt_t".into(),
            tool: "read".into(),
            call_id: "call_1".into(),
            input: json!({"path": "src/lib.rs"}),
        });
        assert_eq!(buffer.pending_tools().count(), 1);

        buffer.apply(&Event::ToolRunning {
            session_id: "ses_1".into(),
            message_id: "msg_1".into(),
            part_id: "prt_t".into(),
            tool: "read".into(),
            call_id: "call_1".into(),
            title: Some("Reading src/lib.rs".into()),
        });
        let call = buffer.tool("call_1").unwrap();
        assert_eq!(call.status, ToolCallStatus::Running);
        assert_eq!(call.input, json!({"path": "src/lib.rs"}));

        buffer.apply(&Event::ToolDone {
            session_id: "ses_1".into(),
            message_id: "msg_1".into(),
            part_id: "prt_t".into(),
            tool: "read".into(),
            call_id: "call_1".into(),
            output: "fn main() {}".into(),
            title: "src/lib.rs".into(),
        });
        let call = buffer.tool("call_1").unwrap();
        assert_matches!(&call.status, ToolCallStatus::Completed { output } if output == "fn main() {}");
        assert_eq!(call.title.as_deref(), Some("src/lib.rs"));
        assert_eq!(buffer.pending_tools().count(), 0);
    }

    #[test]
    fn tool_error_without_start() {
        let mut buffer = StreamBuffer::new();
        buffer.apply(&Event::ToolError {
            session_id: "ses_1".into(),
            message_id: "msg_1".into(),
            part_id: "prt_t".into(),
            tool: "bash".into(),
            call_id: "call_9".into(),
            error: "exit 1".into(),
        });
        assert_eq!(buffer.tools().len(), 1);
        assert!(buffer.tool("call_9").unwrap().status.is_finished());
    }

    #[test]
    fn status_and_errors() {
        let mut buffer = StreamBuffer::new();
        buffer.apply(&Event::StatusChanged {
            session_id: "ses_1".into(),
            status: SessionStatus::Retry,
            message: Some("rate limited".into()),
        });
        assert_eq!(buffer.status(), Some(SessionStatus::Retry));
        assert_eq!(buffer.status_message(), Some("rate limited"));

        buffer.apply(&Event::StatusChanged {
            session_id: "ses_1".into(),
            status: SessionStatus::Idle,
            message: None,
        });
        assert_eq!(buffer.status_message(), None);

        buffer.apply(&Event::StreamError {
            session_id: "ses_1".into(),
            code: "ProviderAuthError".into(),
            message: "bad key".into(),
        });
        assert_eq!(buffer.last_error().unwrap().code, "ProviderAuthError");
    }

    #[test]
    fn parsed_holds_back_unclosed_directive_while_streaming() {
        let mut buffer = StreamBuffer::new();
        buffer.apply(&text("msg_1", "p", "See [[file:src/a.rs:3]] and <<ANNOTATION file=\"a.rs\""));
        let streaming = buffer.parsed().unwrap();
        assert!(streaming.has_pending());
        assert_matches!(
            streaming.parsed.segments.first(),
            Some(MessageSegment::Text { content }) if content == "See "
        );

        buffer.apply(&text(
            "msg_1",
            "p",
            " line=\"3\" severity=\"warning\">>check this<</ANNOTATION>>",
        ));
        buffer.apply(&done("msg_1"));
        let finished = buffer.parsed().unwrap();
        assert!(!finished.has_pending());
        assert_eq!(finished.parsed.annotations.len(), 1);
        assert_eq!(finished.parsed.annotations[0].severity, Severity::Warning);
        assert!(buffer.is_complete("msg_1"));
    }

    #[test]
    fn parsed_empty_buffer() {
        assert!(StreamBuffer::new().parsed().is_none());
    }

    #[test]
    fn clear_resets() {
        let mut buffer = StreamBuffer::new();
        buffer.apply(&text("msg_1", "p", "x"));
        buffer.apply(&done("msg_1"));
        buffer.clear();
        assert!(buffer.latest().is_none());
        assert!(!buffer.is_complete("msg_1"));
        assert_eq!(buffer.applied(), 0);
    }
}
