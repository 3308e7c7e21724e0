//! Native frame decoding.
//!
//! The agent runtime publishes `{"type": ..., "properties": {...}}` objects.
//! Part updates repeat the full part on every change, so the decoder keeps
//! per-connection state to turn them into edge-triggered [`Event`]s.

use std::collections::{HashMap, HashSet, VecDeque};

use prlens_core::{Event, SessionStatus};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Completed message ids remembered for `Done` de-duplication.
const DONE_MEMORY: usize = 1024;

/// Frame that could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Payload or properties were not the expected JSON.
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    properties: Value,
}

#[derive(Deserialize)]
struct PartUpdated {
    part: Part,
    #[serde(default)]
    delta: Option<String>,
}

#[derive(Deserialize)]
struct Part {
    id: String,
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "messageID")]
    message_id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "callID", default)]
    call_id: Option<String>,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    state: Option<ToolState>,
}

#[derive(Deserialize)]
struct ToolState {
    status: String,
    #[serde(default)]
    input: Value,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct SessionStatusProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    status: StatusInfo,
}

#[derive(Deserialize)]
struct StatusInfo {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct SessionIdProps {
    #[serde(rename = "sessionID")]
    session_id: String,
}

#[derive(Deserialize)]
struct SessionErrorProps {
    #[serde(rename = "sessionID", default)]
    session_id: Option<String>,
    #[serde(default)]
    error: Option<RuntimeError>,
}

#[derive(Deserialize)]
struct RuntimeError {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct MessageUpdated {
    info: MessageInfo,
}

#[derive(Deserialize)]
struct MessageInfo {
    id: String,
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(default)]
    role: String,
    #[serde(default)]
    time: MessageTime,
}

#[derive(Default, Deserialize)]
struct MessageTime {
    #[serde(default)]
    completed: Option<Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ToolPhase {
    Pending,
    Running,
    Finished,
}

struct ToolTrack {
    session_id: String,
    message_id: String,
    phase: ToolPhase,
    title: Option<String>,
}

/// Stateful decoder, one per upstream connection.
#[derive(Default)]
pub struct FrameDecoder {
    tools: HashMap<String, ToolTrack>,
    done: HashSet<String>,
    done_order: VecDeque<String>,
}

impl FrameDecoder {
    /// Fresh decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one SSE `data:` payload into zero or more events.
    pub fn decode(&mut self, data: &str) -> Result<Vec<Event>, DecodeError> {
        let frame: RawFrame = serde_json::from_str(data)?;
        self.decode_frame(&frame.kind, frame.properties)
    }

    /// Tool calls currently tracked.
    pub fn tracked_tools(&self) -> usize {
        self.tools.len()
    }

    fn decode_frame(&mut self, kind: &str, properties: Value) -> Result<Vec<Event>, DecodeError> {
        let events = match kind {
            "message.part.updated" => {
                let update: PartUpdated = serde_json::from_value(properties)?;
                self.part_updated(update)
            }
            "session.status" => {
                let props: SessionStatusProps = serde_json::from_value(properties)?;
                status_changed(props).into_iter().collect()
            }
            "session.idle" => {
                let props: SessionIdProps = serde_json::from_value(properties)?;
                vec![Event::StatusChanged {
                    session_id: props.session_id,
                    status: SessionStatus::Idle,
                    message: None,
                }]
            }
            "session.error" => {
                let props: SessionErrorProps = serde_json::from_value(properties)?;
                session_error(props).into_iter().collect()
            }
            "message.updated" => {
                let update: MessageUpdated = serde_json::from_value(properties)?;
                self.message_updated(update.info).into_iter().collect()
            }
            other => {
                debug!(frame_type = other, "ignoring upstream frame");
                Vec::new()
            }
        };
        // Calls of a message that never completes (aborted) end with the session going idle.
        for event in &events {
            if let Event::StatusChanged {
                session_id,
                status: SessionStatus::Idle,
                ..
            } = event
            {
                self.tools.retain(|_, track| track.session_id != *session_id);
            }
        }
        Ok(events)
    }

    fn part_updated(&mut self, update: PartUpdated) -> Vec<Event> {
        let PartUpdated { part, delta } = update;
        match part.kind.as_str() {
            "text" | "reasoning" => {
                let Some(delta) = delta.filter(|d| !d.is_empty()) else {
                    return Vec::new();
                };
                let event = if part.kind == "text" {
                    Event::TextDelta {
                        session_id: part.session_id,
                        message_id: part.message_id,
                        part_id: part.id,
                        delta,
                    }
                } else {
                    Event::ReasoningDelta {
                        session_id: part.session_id,
                        message_id: part.message_id,
                        part_id: part.id,
                        delta,
                    }
                };
                vec![event]
            }
            "tool" => self.tool_updated(part),
            _ => Vec::new(),
        }
    }

    fn tool_updated(&mut self, part: Part) -> Vec<Event> {
        let (Some(call_id), Some(tool), Some(state)) = (part.call_id, part.tool, part.state) else {
            debug!(part_id = %part.id, "tool part without call id, tool or state");
            return Vec::new();
        };

        let target = match state.status.as_str() {
            "pending" => ToolPhase::Pending,
            "running" => ToolPhase::Running,
            "completed" | "error" => ToolPhase::Finished,
            other => {
                debug!(call_id = %call_id, status = other, "unknown tool status");
                return Vec::new();
            }
        };

        let previous = self.tools.get(&call_id).map(|t| (t.phase, t.title.clone()));
        let mut events = Vec::new();

        let start = || Event::ToolStart {
            session_id: part.session_id.clone(),
            message_id: part.message_id.clone(),
            part_id: part.id.clone(),
            tool: tool.clone(),
            call_id: call_id.clone(),
            input: state.input.clone(),
        };

        match (&previous, target) {
            (Some((ToolPhase::Finished, _)), _) => return Vec::new(),
            (None, _) => events.push(start()),
            _ => {}
        }

        match target {
            ToolPhase::Pending => {}
            ToolPhase::Running => {
                let emit = match &previous {
                    Some((ToolPhase::Running, title)) => {
                        state.title.is_some() && *title != state.title
                    }
                    _ => true,
                };
                if emit {
                    events.push(Event::ToolRunning {
                        session_id: part.session_id.clone(),
                        message_id: part.message_id.clone(),
                        part_id: part.id.clone(),
                        tool: tool.clone(),
                        call_id: call_id.clone(),
                        title: state.title.clone(),
                    });
                }
            }
            ToolPhase::Finished => {
                let event = if state.status == "error" {
                    Event::ToolError {
                        session_id: part.session_id.clone(),
                        message_id: part.message_id.clone(),
                        part_id: part.id.clone(),
                        tool: tool.clone(),
                        call_id: call_id.clone(),
                        error: state.error.clone().unwrap_or_else(|| "tool failed".into()),
                    }
                } else {
                    Event::ToolDone {
                        session_id: part.session_id.clone(),
                        message_id: part.message_id.clone(),
                        part_id: part.id.clone(),
                        tool: tool.clone(),
                        call_id: call_id.clone(),
                        output: state.output.clone().unwrap_or_default(),
                        title: state.title.clone().unwrap_or_default(),
                    }
                };
                events.push(event);
            }
        }

        let title = state.title.clone().or(previous.and_then(|(_, t)| t));
        let _ = self.tools.insert(
            call_id,
            ToolTrack {
                session_id: part.session_id,
                message_id: part.message_id,
                phase: target,
                title,
            },
        );
        events
    }

    fn message_updated(&mut self, info: MessageInfo) -> Option<Event> {
        if info.role != "assistant" || info.time.completed.as_ref().is_none_or(Value::is_null) {
            return None;
        }
        if !self.done.insert(info.id.clone()) {
            return None;
        }
        self.done_order.push_back(info.id.clone());
        if self.done_order.len() > DONE_MEMORY {
            if let Some(oldest) = self.done_order.pop_front() {
                let _ = self.done.remove(&oldest);
            }
        }
        self.tools.retain(|_, track| track.message_id != info.id);

        Some(Event::Done {
            session_id: info.session_id,
            message_id: info.id,
        })
    }
}

fn status_changed(props: SessionStatusProps) -> Option<Event> {
    let status = match props.status.kind.as_str() {
        "busy" => SessionStatus::Busy,
        "idle" => SessionStatus::Idle,
        "retry" => SessionStatus::Retry,
        other => {
            debug!(session_id = %props.session_id, status = other, "unknown session status");
            return None;
        }
    };
    let message = if status == SessionStatus::Retry {
        props.status.message
    } else {
        None
    };
    Some(Event::StatusChanged {
        session_id: props.session_id,
        status,
        message,
    })
}

fn session_error(props: SessionErrorProps) -> Option<Event> {
    let (code, message) = match props.error {
        Some(error) => {
            let message = error
                .data
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string);
            let code = error.name.unwrap_or_else(|| "UnknownError".into());
            let message = message.unwrap_or_else(|| code.clone());
            (code, message)
        }
        None => ("UnknownError".to_string(), "unknown error".to_string()),
    };
    let Some(session_id) = props.session_id else {
        warn!(code = %code, message = %message, "runtime error without session");
        return None;
    };
    Some(Event::StreamError {
        session_id,
        code,
        message,
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn frame(kind: &str, properties: Value) -> String {
        json!({"type": kind, "properties": properties}).to_string()
    }

    fn tool_frame(status: &str, extra: Value) -> String {
        let mut state = json!({"status": status, "input": {"filePath": "src/a.ts"}});
        if let (Some(state), Some(extra)) = (state.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                let _ = state.insert(k.clone(), v.clone());
            }
        }
        frame(
            "message.part.updated",
            json!({
                "part": {
                    "id": "prt_1",
                    "sessionID": "ses_1",
                    "messageID": "msg_1",
                    "type": "tool",
                    "callID": "call_1",
                    "tool": "read",
                    "state": state
                }
            }),
        )
    }

    fn text_frame(kind: &str, delta: Option<&str>) -> String {
        let mut props = json!({
            "part": {
                "id": "prt_t",
                "sessionID": "ses_1",
                "messageID": "msg_1",
                "type": kind,
                "text": "accumulated"
            }
        });
        if let Some(delta) = delta {
            props["delta"] = json!(delta);
        }
        frame("message.part.updated", props)
    }

    // ── Text parts ──

    #[test]
    fn text_delta() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.decode(&text_frame("text", Some("Hel"))).unwrap();
        assert_eq!(
            events,
            vec![Event::TextDelta {
                session_id: "ses_1".into(),
                message_id: "msg_1".into(),
                part_id: "prt_t".into(),
                delta: "Hel".into(),
            }]
        );
    }

    #[test]
    fn reasoning_delta() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.decode(&text_frame("reasoning", Some("hmm"))).unwrap();
        assert_matches!(&events[..], [Event::ReasoningDelta { delta, .. }] if delta == "hmm");
    }

    #[test]
    fn snapshot_without_delta_is_silent() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.decode(&text_frame("text", None)).unwrap().is_empty());
        assert!(decoder.decode(&text_frame("text", Some(""))).unwrap().is_empty());
    }

    // ── Tool parts ──

    #[test]
    fn tool_lifecycle() {
        let mut decoder = FrameDecoder::new();

        let events = decoder.decode(&tool_frame("pending", json!({}))).unwrap();
        assert_matches!(&events[..], [Event::ToolStart { tool, call_id, input, .. }]
            if tool == "read" && call_id == "call_1" && input["filePath"] == "src/a.ts");

        // Repeated pending: nothing.
        assert!(decoder.decode(&tool_frame("pending", json!({}))).unwrap().is_empty());

        let events = decoder.decode(&tool_frame("running", json!({}))).unwrap();
        assert_matches!(&events[..], [Event::ToolRunning { title: None, .. }]);

        let events = decoder
            .decode(&tool_frame("running", json!({"title": "src/a.ts"})))
            .unwrap();
        assert_matches!(&events[..], [Event::ToolRunning { title: Some(t), .. }] if t == "src/a.ts");

        // Same title again: nothing.
        assert!(
            decoder
                .decode(&tool_frame("running", json!({"title": "src/a.ts"})))
                .unwrap()
                .is_empty()
        );

        let events = decoder
            .decode(&tool_frame(
                "completed",
                json!({"title": "src/a.ts", "output": "file contents"}),
            ))
            .unwrap();
        assert_matches!(&events[..], [Event::ToolDone { output, title, .. }]
            if output == "file contents" && title == "src/a.ts");

        // Terminal status repeated: nothing.
        assert!(decoder.decode(&tool_frame("completed", json!({}))).unwrap().is_empty());
    }

    #[test]
    fn tool_first_seen_completed_emits_start_then_done() {
        let mut decoder = FrameDecoder::new();
        let events = decoder
            .decode(&tool_frame("completed", json!({"output": "ok"})))
            .unwrap();
        assert_matches!(&events[..], [Event::ToolStart { .. }, Event::ToolDone { .. }]);
    }

    #[test]
    fn tool_first_seen_running_emits_start_then_running() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.decode(&tool_frame("running", json!({}))).unwrap();
        assert_matches!(&events[..], [Event::ToolStart { .. }, Event::ToolRunning { .. }]);
    }

    #[test]
    fn tool_error() {
        let mut decoder = FrameDecoder::new();
        let _ = decoder.decode(&tool_frame("running", json!({}))).unwrap();
        let events = decoder
            .decode(&tool_frame("error", json!({"error": "ENOENT"})))
            .unwrap();
        assert_matches!(&events[..], [Event::ToolError { error, .. }] if error == "ENOENT");
    }

    // ── Session frames ──

    #[test]
    fn session_status_variants() {
        let mut decoder = FrameDecoder::new();
        let busy = frame(
            "session.status",
            json!({"sessionID": "ses_1", "status": {"type": "busy"}}),
        );
        assert_eq!(
            decoder.decode(&busy).unwrap(),
            vec![Event::StatusChanged {
                session_id: "ses_1".into(),
                status: SessionStatus::Busy,
                message: None,
            }]
        );

        let retry = frame(
            "session.status",
            json!({"sessionID": "ses_1", "status": {"type": "retry", "attempt": 2, "message": "rate limited"}}),
        );
        assert_matches!(
            &decoder.decode(&retry).unwrap()[..],
            [Event::StatusChanged { status: SessionStatus::Retry, message: Some(m), .. }] if m == "rate limited"
        );

        let idle = frame("session.idle", json!({"sessionID": "ses_1"}));
        assert_matches!(
            &decoder.decode(&idle).unwrap()[..],
            [Event::StatusChanged { status: SessionStatus::Idle, .. }]
        );
    }

    #[test]
    fn session_error_is_routed_to_its_session() {
        let mut decoder = FrameDecoder::new();
        let err = frame(
            "session.error",
            json!({"sessionID": "ses_1", "error": {"name": "ProviderAuthError", "data": {"message": "bad key"}}}),
        );
        assert_eq!(
            decoder.decode(&err).unwrap(),
            vec![Event::StreamError {
                session_id: "ses_1".into(),
                code: "ProviderAuthError".into(),
                message: "bad key".into(),
            }]
        );
    }

    #[test]
    fn session_error_without_session_is_not_routed() {
        let mut decoder = FrameDecoder::new();
        let err = frame("session.error", json!({"error": {"name": "X", "data": {}}}));
        assert!(decoder.decode(&err).unwrap().is_empty());
    }

    // ── Message completion ──

    #[test]
    fn done_once_per_completed_assistant_message() {
        let mut decoder = FrameDecoder::new();
        let _ = decoder.decode(&tool_frame("running", json!({}))).unwrap();
        assert_eq!(decoder.tracked_tools(), 1);

        let pending = frame(
            "message.updated",
            json!({"info": {"id": "msg_1", "sessionID": "ses_1", "role": "assistant", "time": {"created": 1}}}),
        );
        assert!(decoder.decode(&pending).unwrap().is_empty());

        let completed = frame(
            "message.updated",
            json!({"info": {"id": "msg_1", "sessionID": "ses_1", "role": "assistant", "time": {"created": 1, "completed": 2}}}),
        );
        assert_eq!(
            decoder.decode(&completed).unwrap(),
            vec![Event::Done {
                session_id: "ses_1".into(),
                message_id: "msg_1".into(),
            }]
        );
        assert!(decoder.decode(&completed).unwrap().is_empty());
        assert_eq!(decoder.tracked_tools(), 0);
    }

    #[test]
    fn idle_session_forgets_unfinished_tools() {
        let mut decoder = FrameDecoder::new();
        let _ = decoder.decode(&tool_frame("running", json!({}))).unwrap();
        let other = frame(
            "message.part.updated",
            json!({
                "part": {
                    "id": "prt_2",
                    "sessionID": "ses_2",
                    "messageID": "msg_2",
                    "type": "tool",
                    "callID": "call_2",
                    "tool": "grep",
                    "state": {"status": "pending", "input": {}}
                }
            }),
        );
        let _ = decoder.decode(&other).unwrap();
        assert_eq!(decoder.tracked_tools(), 2);

        let _ = decoder
            .decode(&frame("session.idle", json!({"sessionID": "ses_1"})))
            .unwrap();
        assert_eq!(decoder.tracked_tools(), 1);

        let idle = frame(
            "session.status",
            json!({"sessionID": "ses_2", "status": {"type": "idle"}}),
        );
        let _ = decoder.decode(&idle).unwrap();
        assert_eq!(decoder.tracked_tools(), 0);
    }

    #[test]
    fn user_messages_never_complete() {
        let mut decoder = FrameDecoder::new();
        let user = frame(
            "message.updated",
            json!({"info": {"id": "msg_u", "sessionID": "ses_1", "role": "user", "time": {"created": 1, "completed": 2}}}),
        );
        assert!(decoder.decode(&user).unwrap().is_empty());
    }

    #[test]
    fn ignored_frames() {
        let mut decoder = FrameDecoder::new();
        for kind in ["server.connected", "server.heartbeat", "file.edited", "lsp.updated"] {
            assert!(decoder.decode(&frame(kind, json!({}))).unwrap().is_empty(), "{kind}");
        }
    }

    #[test]
    fn malformed_frames_are_errors() {
        let mut decoder = FrameDecoder::new();
        assert_matches!(decoder.decode("not json"), Err(DecodeError::Json(_)));
        assert_matches!(decoder.decode(r#"{"properties": {}}"#), Err(DecodeError::Json(_)));
        assert_matches!(
            decoder.decode(&frame("message.part.updated", json!({"part": 3}))),
            Err(DecodeError::Json(_))
        );
    }
}
