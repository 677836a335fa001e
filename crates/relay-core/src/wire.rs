use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{ConversationRecord, MessageRecord};

pub const DEFAULT_MAX_INBOUND_BYTES: usize = 256 * 1024;

/// Suffix that turns a message record id into the id of its assistant turn.
pub const ANSWER_ID_SUFFIX: &str = ":answer";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    NewMessage(NewMessagePayload),
    GetConversations(UserScopePayload),
    GetMessages(ConversationScopePayload),
    CreateConversation(CreateConversationPayload),
    DeleteConversation(DeleteConversationPayload),
    RenameConversation(RenameConversationPayload),
}

impl ClientRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientRequest::NewMessage(_) => "new_message",
            ClientRequest::GetConversations(_) => "get_conversations",
            ClientRequest::GetMessages(_) => "get_messages",
            ClientRequest::CreateConversation(_) => "create_conversation",
            ClientRequest::DeleteConversation(_) => "delete_conversation",
            ClientRequest::RenameConversation(_) => "rename_conversation",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewMessagePayload {
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub message: String,
    pub user_id: String,
    #[serde(default)]
    pub helper: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserScopePayload {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationScopePayload {
    pub conversation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationPayload {
    pub user_id: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteConversationPayload {
    pub conversation_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RenameConversationPayload {
    pub conversation_id: String,
    pub user_id: String,
    pub title: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One chat turn as the browser renders it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub thinks: Vec<String>,
    pub is_streaming: bool,
    pub created_at: String,
}

impl MessageView {
    pub fn user_turn(record: &MessageRecord) -> Self {
        Self {
            id: record.id.clone(),
            conversation_id: record.conversation_id.clone(),
            role: MessageRole::User,
            content: record.query.clone(),
            thinks: Vec::new(),
            is_streaming: false,
            created_at: format_ts(record.created_at),
        }
    }

    /// `None` while the answer has not been finalized. Shares the record's
    /// `created_at` so history matches what was streamed under the same id.
    pub fn assistant_turn(record: &MessageRecord) -> Option<Self> {
        record.answered_at?;
        Some(Self {
            id: answer_id(&record.id),
            conversation_id: record.conversation_id.clone(),
            role: MessageRole::Assistant,
            content: record.answer.clone(),
            thinks: record.reasoning.clone().unwrap_or_default(),
            is_streaming: false,
            created_at: format_ts(record.created_at),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub upstream_session_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&ConversationRecord> for ConversationView {
    fn from(record: &ConversationRecord) -> Self {
        Self {
            id: record.id.clone(),
            title: record.title.clone(),
            upstream_session_id: record.upstream_session_id.clone(),
            created_at: format_ts(record.created_at),
            updated_at: format_ts(record.updated_at),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationsPayload {
    pub conversations: Vec<ConversationView>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessagesPayload {
    pub conversation_id: String,
    pub messages: Vec<MessageView>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRefPayload {
    pub conversation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRenamedPayload {
    pub conversation_id: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Message(MessageView),
    StreamingMessage(MessageView),
    Conversations(ConversationsPayload),
    Messages(MessagesPayload),
    ConversationCreated(ConversationRefPayload),
    ConversationRenamed(ConversationRenamedPayload),
    ConversationDeleted(ConversationRefPayload),
    Error(ErrorPayload),
}

impl ServerEvent {
    pub fn error(message: impl Into<String>, details: Option<String>) -> Self {
        ServerEvent::Error(ErrorPayload {
            message: message.into(),
            details,
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Message(_) => "message",
            ServerEvent::StreamingMessage(_) => "streaming_message",
            ServerEvent::Conversations(_) => "conversations",
            ServerEvent::Messages(_) => "messages",
            ServerEvent::ConversationCreated(_) => "conversation_created",
            ServerEvent::ConversationRenamed(_) => "conversation_renamed",
            ServerEvent::ConversationDeleted(_) => "conversation_deleted",
            ServerEvent::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("message exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
    #[error("unparseable request: {0}")]
    Decode(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("encode failed: {0}")]
    Encode(String),
}

pub fn decode_request(bytes: &[u8], max_bytes: usize) -> Result<ClientRequest, WireError> {
    if bytes.len() > max_bytes {
        return Err(WireError::Oversized {
            size: bytes.len(),
            max: max_bytes,
        });
    }
    let request: ClientRequest =
        serde_json::from_slice(bytes).map_err(|err| WireError::Decode(err.to_string()))?;
    validate_request(&request)?;
    Ok(request)
}

pub fn encode_event(event: &ServerEvent) -> Result<String, WireError> {
    serde_json::to_string(event).map_err(|err| WireError::Encode(err.to_string()))
}

fn validate_request(request: &ClientRequest) -> Result<(), WireError> {
    match request {
        ClientRequest::NewMessage(payload) => {
            if payload.message.trim().is_empty() {
                return Err(WireError::MissingField("message"));
            }
            if payload.user_id.trim().is_empty() {
                return Err(WireError::MissingField("userId"));
            }
        }
        ClientRequest::GetConversations(payload) => {
            if payload.user_id.trim().is_empty() {
                return Err(WireError::MissingField("userId"));
            }
        }
        ClientRequest::GetMessages(payload) => {
            if payload.conversation_id.trim().is_empty() {
                return Err(WireError::MissingField("conversationId"));
            }
        }
        ClientRequest::CreateConversation(payload) => {
            if payload.user_id.trim().is_empty() {
                return Err(WireError::MissingField("userId"));
            }
        }
        ClientRequest::DeleteConversation(payload) => {
            if payload.conversation_id.trim().is_empty() {
                return Err(WireError::MissingField("conversationId"));
            }
            if payload.user_id.trim().is_empty() {
                return Err(WireError::MissingField("userId"));
            }
        }
        ClientRequest::RenameConversation(payload) => {
            if payload.conversation_id.trim().is_empty() {
                return Err(WireError::MissingField("conversationId"));
            }
            if payload.title.trim().is_empty() {
                return Err(WireError::MissingField("title"));
            }
        }
    }
    Ok(())
}

pub fn answer_id(record_id: &str) -> String {
    format!("{record_id}{ANSWER_ID_SUFFIX}")
}

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn new_message_accepts_optional_fields() {
        let request = decode_request(
            br#"{"type":"new_message","message":"hi there","userId":"u-1"}"#,
            DEFAULT_MAX_INBOUND_BYTES,
        )
        .expect("decode");
        assert_eq!(
            request,
            ClientRequest::NewMessage(NewMessagePayload {
                conversation_id: None,
                message: "hi there".to_string(),
                user_id: "u-1".to_string(),
                helper: None,
            })
        );
        assert_eq!(request.kind(), "new_message");

        let with_conversation = decode_request(
            br#"{"type":"new_message","conversationId":"c-9","message":"x","userId":"u-1","helper":"coder"}"#,
            DEFAULT_MAX_INBOUND_BYTES,
        )
        .expect("decode");
        match with_conversation {
            ClientRequest::NewMessage(payload) => {
                assert_eq!(payload.conversation_id.as_deref(), Some("c-9"));
                assert_eq!(payload.helper.as_deref(), Some("coder"));
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_type_blank_fields_and_oversized_frames() {
        assert!(matches!(
            decode_request(br#"{"type":"launch_rockets"}"#, DEFAULT_MAX_INBOUND_BYTES),
            Err(WireError::Decode(_))
        ));
        assert!(matches!(
            decode_request(b"not json", DEFAULT_MAX_INBOUND_BYTES),
            Err(WireError::Decode(_))
        ));
        assert_eq!(
            decode_request(
                br#"{"type":"new_message","message":"   ","userId":"u-1"}"#,
                DEFAULT_MAX_INBOUND_BYTES
            ),
            Err(WireError::MissingField("message"))
        );
        assert!(matches!(
            decode_request(br#"{"type":"get_conversations","userId":"u"}"#, 8),
            Err(WireError::Oversized { .. })
        ));
    }

    #[test]
    fn streaming_message_serializes_with_camel_case_fields() {
        let event = ServerEvent::StreamingMessage(MessageView {
            id: "m-1:answer".to_string(),
            conversation_id: "c-1".to_string(),
            role: MessageRole::Assistant,
            content: "Answer A".to_string(),
            thinks: vec!["step1".to_string()],
            is_streaming: true,
            created_at: format_ts(ts()),
        });
        let value: serde_json::Value =
            serde_json::from_str(&encode_event(&event).expect("encode")).expect("json");
        assert_eq!(value["type"], "streaming_message");
        assert_eq!(value["conversationId"], "c-1");
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["thinks"][0], "step1");
        assert_eq!(value["isStreaming"], true);
        assert_eq!(value["createdAt"], "2026-03-01T09:30:00.000Z");
    }

    #[test]
    fn error_event_omits_absent_details() {
        let value = serde_json::to_value(ServerEvent::error("bad request", None)).expect("json");
        assert_eq!(value["type"], "error");
        assert_eq!(value["message"], "bad request");
        assert!(value.get("details").is_none());
    }

    #[test]
    fn assistant_turn_requires_finalized_answer() {
        let mut record = MessageRecord {
            id: "m-1".to_string(),
            conversation_id: "c-1".to_string(),
            query: "why?".to_string(),
            answer: String::new(),
            reasoning: None,
            helper: None,
            created_at: ts(),
            answered_at: None,
        };
        assert!(MessageView::assistant_turn(&record).is_none());
        assert_eq!(MessageView::user_turn(&record).content, "why?");

        record.answer = "because".to_string();
        record.reasoning = Some(vec!["thought".to_string()]);
        record.answered_at = Some(ts() + chrono::Duration::seconds(30));
        let view = MessageView::assistant_turn(&record).expect("assistant view");
        assert_eq!(view.id, "m-1:answer");
        assert_eq!(view.created_at, format_ts(record.created_at));
        assert_eq!(view.thinks, vec!["thought".to_string()]);
        assert!(!view.is_streaming);
    }
}
