//! Decoding of upstream event payloads into normalized fragments.
//!
//! Two payload families are understood: event-tagged records (an `event`
//! discriminator plus a top-level `conversation_id`) and completion chunks
//! (a `choices` array). Anything that decodes as JSON but matches neither is
//! classified [`EventKind::Unknown`]; anything that does not decode at all is
//! an [`InterpretError`] and the caller drops the record.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Content,
    Final,
    Lifecycle,
    Unknown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Content => "content",
            EventKind::Final => "final",
            EventKind::Lifecycle => "lifecycle",
            EventKind::Unknown => "unknown",
        }
    }
}

/// How a fragment's text relates to what came before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextMode {
    /// New text to be appended to the running answer.
    Delta,
    /// The whole answer so far, resent by the upstream.
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub text: String,
    pub kind: EventKind,
    pub mode: TextMode,
    pub upstream_session_id: Option<String>,
    /// Upstream event name, kept for logging.
    pub source_event: String,
}

impl Fragment {
    fn new(kind: EventKind, source_event: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            kind,
            mode: TextMode::Delta,
            upstream_session_id: None,
            source_event: source_event.into(),
        }
    }

    fn with_text(mut self, text: Option<String>, mode: TextMode) -> Self {
        self.text = text.unwrap_or_default();
        self.mode = mode;
        self
    }

    fn with_session(mut self, session_id: Option<String>) -> Self {
        self.upstream_session_id = session_id.filter(|value| !value.trim().is_empty());
        self
    }

    pub fn has_text(&self) -> bool {
        !self.text.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterpretError {
    #[error("payload is not valid json: {0}")]
    Json(String),
    #[error("payload for event {event} has unexpected shape: {reason}")]
    Shape { event: String, reason: String },
    #[error("payload is not a json object")]
    NotAnObject,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum TaggedEvent {
    Message(AnswerBody),
    AgentMessage(AnswerBody),
    MessageReplace(AnswerBody),
    TextChunk(TextChunkBody),
    WorkflowFinished(WorkflowFinishedBody),
    MessageEnd(SessionBody),
    WorkflowStarted(SessionBody),
    NodeStarted(SessionBody),
    NodeFinished(SessionBody),
    AgentThought(SessionBody),
    MessageFile(SessionBody),
    TtsMessage(SessionBody),
    TtsMessageEnd(SessionBody),
    Ping(SessionBody),
    Error(ErrorBody),
}

#[derive(Debug, Deserialize)]
struct AnswerBody {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TextChunkBody {
    #[serde(default)]
    data: Option<TextChunkData>,
    #[serde(default)]
    conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TextChunkData {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WorkflowFinishedBody {
    #[serde(default)]
    data: Option<WorkflowFinishedData>,
    #[serde(default)]
    conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WorkflowFinishedData {
    #[serde(default)]
    outputs: Option<WorkflowOutputs>,
}

#[derive(Debug, Deserialize)]
struct WorkflowOutputs {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionBody {
    #[serde(default)]
    conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    delta: Option<CompletionText>,
    #[serde(default)]
    message: Option<CompletionText>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionText {
    #[serde(default)]
    content: Option<String>,
}

pub fn interpret_payload(payload: &str) -> Result<Fragment, InterpretError> {
    let value: Value =
        serde_json::from_str(payload).map_err(|err| InterpretError::Json(err.to_string()))?;
    let object = value.as_object().ok_or(InterpretError::NotAnObject)?;

    if let Some(event) = object.get("event").and_then(Value::as_str) {
        let event = event.to_string();
        if !is_known_event(&event) {
            let session = object
                .get("conversation_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            tracing::debug!(event = "upstream_unknown_event", upstream_event = %event);
            return Ok(Fragment::new(EventKind::Unknown, event).with_session(session));
        }
        let tagged: TaggedEvent =
            serde_json::from_value(value).map_err(|err| InterpretError::Shape {
                event: event.clone(),
                reason: err.to_string(),
            })?;
        return Ok(classify_tagged(tagged, event));
    }

    if object.contains_key("choices") {
        let chunk: CompletionChunk =
            serde_json::from_value(value).map_err(|err| InterpretError::Shape {
                event: "completion_chunk".to_string(),
                reason: err.to_string(),
            })?;
        return Ok(classify_completion(chunk));
    }

    let session = object
        .get("conversation_id")
        .or_else(|| object.get("session_id"))
        .and_then(Value::as_str)
        .map(str::to_string);
    tracing::debug!(event = "upstream_unknown_event", upstream_event = "untagged");
    Ok(Fragment::new(EventKind::Unknown, "untagged").with_session(session))
}

fn is_known_event(event: &str) -> bool {
    matches!(
        event,
        "message"
            | "agent_message"
            | "message_replace"
            | "text_chunk"
            | "workflow_finished"
            | "message_end"
            | "workflow_started"
            | "node_started"
            | "node_finished"
            | "agent_thought"
            | "message_file"
            | "tts_message"
            | "tts_message_end"
            | "ping"
            | "error"
    )
}

fn classify_tagged(tagged: TaggedEvent, event: String) -> Fragment {
    match tagged {
        TaggedEvent::Message(body) | TaggedEvent::AgentMessage(body) => {
            Fragment::new(EventKind::Content, event)
                .with_text(body.answer, TextMode::Delta)
                .with_session(body.conversation_id)
        }
        TaggedEvent::MessageReplace(body) => Fragment::new(EventKind::Content, event)
            .with_text(body.answer, TextMode::Complete)
            .with_session(body.conversation_id),
        TaggedEvent::TextChunk(body) => Fragment::new(EventKind::Content, event)
            .with_text(body.data.and_then(|data| data.text), TextMode::Delta)
            .with_session(body.conversation_id),
        TaggedEvent::WorkflowFinished(body) => {
            let text = body
                .data
                .and_then(|data| data.outputs)
                .and_then(|outputs| outputs.answer.or(outputs.text));
            Fragment::new(EventKind::Content, event)
                .with_text(text, TextMode::Complete)
                .with_session(body.conversation_id)
        }
        TaggedEvent::MessageEnd(body) => {
            Fragment::new(EventKind::Final, event).with_session(body.conversation_id)
        }
        TaggedEvent::WorkflowStarted(body)
        | TaggedEvent::NodeStarted(body)
        | TaggedEvent::NodeFinished(body)
        | TaggedEvent::AgentThought(body)
        | TaggedEvent::MessageFile(body)
        | TaggedEvent::TtsMessage(body)
        | TaggedEvent::TtsMessageEnd(body)
        | TaggedEvent::Ping(body) => {
            Fragment::new(EventKind::Lifecycle, event).with_session(body.conversation_id)
        }
        TaggedEvent::Error(body) => {
            tracing::warn!(
                event = "upstream_error_event",
                code = body.code.as_deref().unwrap_or(""),
                message = body.message.as_deref().unwrap_or("")
            );
            Fragment::new(EventKind::Unknown, event).with_session(body.conversation_id)
        }
    }
}

fn classify_completion(chunk: CompletionChunk) -> Fragment {
    let session = chunk.conversation_id.or(chunk.session_id);
    let Some(choice) = chunk.choices.into_iter().next() else {
        return Fragment::new(EventKind::Lifecycle, "completion_chunk").with_session(session);
    };
    let finished = choice.finish_reason.is_some();
    let (text, mode) = match (choice.delta, choice.message) {
        (Some(delta), _) if delta.content.is_some() => (delta.content, TextMode::Delta),
        (_, Some(message)) => (message.content, TextMode::Complete),
        _ => (None, TextMode::Delta),
    };
    let kind = if finished {
        EventKind::Final
    } else if text.is_some() {
        EventKind::Content
    } else {
        EventKind::Lifecycle
    };
    Fragment::new(kind, "completion_chunk")
        .with_text(text, mode)
        .with_session(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_events_are_delta_content_with_session() {
        let fragment = interpret_payload(
            r#"{"event":"message","task_id":"t","message_id":"m","conversation_id":"up-1","answer":"Hel","created_at":1}"#,
        )
        .expect("interpret");
        assert_eq!(fragment.kind, EventKind::Content);
        assert_eq!(fragment.mode, TextMode::Delta);
        assert_eq!(fragment.text, "Hel");
        assert_eq!(fragment.upstream_session_id.as_deref(), Some("up-1"));

        let agent = interpret_payload(r#"{"event":"agent_message","answer":"lo"}"#)
            .expect("interpret");
        assert_eq!(agent.kind, EventKind::Content);
        assert_eq!(agent.upstream_session_id, None);
    }

    #[test]
    fn complete_output_events_are_marked_complete() {
        let replace = interpret_payload(r#"{"event":"message_replace","answer":"Hello world"}"#)
            .expect("interpret");
        assert_eq!(replace.mode, TextMode::Complete);
        assert_eq!(replace.text, "Hello world");

        let finished = interpret_payload(
            r#"{"event":"workflow_finished","conversation_id":"up-2","data":{"outputs":{"answer":"Done."}}}"#,
        )
        .expect("interpret");
        assert_eq!(finished.kind, EventKind::Content);
        assert_eq!(finished.mode, TextMode::Complete);
        assert_eq!(finished.text, "Done.");

        let chunk = interpret_payload(r#"{"event":"text_chunk","data":{"text":"abc"}}"#)
            .expect("interpret");
        assert_eq!(chunk.mode, TextMode::Delta);
        assert_eq!(chunk.text, "abc");
    }

    #[test]
    fn lifecycle_and_final_events_surface_session_without_text() {
        let started = interpret_payload(
            r#"{"event":"workflow_started","conversation_id":"up-3","data":{"id":"wf"}}"#,
        )
        .expect("interpret");
        assert_eq!(started.kind, EventKind::Lifecycle);
        assert!(!started.has_text());
        assert_eq!(started.upstream_session_id.as_deref(), Some("up-3"));

        let end = interpret_payload(
            r#"{"event":"message_end","conversation_id":"up-3","metadata":{"usage":{}}}"#,
        )
        .expect("interpret");
        assert_eq!(end.kind, EventKind::Final);
        assert_eq!(end.upstream_session_id.as_deref(), Some("up-3"));
    }

    #[test]
    fn unknown_and_error_events_fail_closed() {
        let unknown = interpret_payload(r#"{"event":"brand_new_thing","conversation_id":"up-4"}"#)
            .expect("interpret");
        assert_eq!(unknown.kind, EventKind::Unknown);
        assert_eq!(unknown.upstream_session_id.as_deref(), Some("up-4"));

        let error =
            interpret_payload(r#"{"event":"error","status":400,"code":"bad","message":"nope"}"#)
                .expect("interpret");
        assert_eq!(error.kind, EventKind::Unknown);

        let untagged = interpret_payload(r#"{"hello":"world"}"#).expect("interpret");
        assert_eq!(untagged.kind, EventKind::Unknown);
    }

    #[test]
    fn malformed_payloads_are_errors() {
        assert!(matches!(
            interpret_payload("{\"event\":\"message\""),
            Err(InterpretError::Json(_))
        ));
        assert!(matches!(
            interpret_payload("[1,2,3]"),
            Err(InterpretError::NotAnObject)
        ));
        assert!(matches!(
            interpret_payload(r#"{"event":"message","answer":42}"#),
            Err(InterpretError::Shape { .. })
        ));
    }

    #[test]
    fn completion_chunks_are_understood() {
        let delta = interpret_payload(
            r#"{"id":"c","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#,
        )
        .expect("interpret");
        assert_eq!(delta.kind, EventKind::Content);
        assert_eq!(delta.mode, TextMode::Delta);
        assert_eq!(delta.text, "Hi");

        let last = interpret_payload(
            r#"{"session_id":"s-1","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
        )
        .expect("interpret");
        assert_eq!(last.kind, EventKind::Final);
        assert!(!last.has_text());
        assert_eq!(last.upstream_session_id.as_deref(), Some("s-1"));

        let whole = interpret_payload(
            r#"{"choices":[{"message":{"role":"assistant","content":"All of it"},"finish_reason":"stop"}]}"#,
        )
        .expect("interpret");
        assert_eq!(whole.kind, EventKind::Final);
        assert_eq!(whole.mode, TextMode::Complete);
        assert_eq!(whole.text, "All of it");
    }

    #[test]
    fn blank_session_ids_are_ignored() {
        let fragment = interpret_payload(r#"{"event":"ping","conversation_id":"  "}"#)
            .expect("interpret");
        assert_eq!(fragment.upstream_session_id, None);
    }
}
