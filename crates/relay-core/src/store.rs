use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONVERSATION_TITLE: &str = "New conversation";
pub const AUTO_TITLE_MAX_CHARS: usize = 40;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("message not found: {0}")]
    MessageNotFound(String),
    #[error("conversation {conversation_id} is not owned by {user_id}")]
    NotOwner {
        conversation_id: String,
        user_id: String,
    },
    #[error("answer already finalized for message {0}")]
    AlreadyFinalized(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Errors that mean the backend itself is unhealthy, as opposed to a bad request.
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, StoreError::Backend(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: String,
    pub user_id: String,
    pub upstream_session_id: Option<String>,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One question/answer pair. `answer`, `reasoning` and `answered_at` are
/// written once, by finalization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub query: String,
    pub answer: String,
    pub reasoning: Option<Vec<String>>,
    pub helper: Option<String>,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
}

impl MessageRecord {
    pub fn is_finalized(&self) -> bool {
        self.answered_at.is_some()
    }
}

/// Durable mapping of local conversations to upstream sessions plus the
/// question/answer archive. Implementations serialize their own writes.
pub trait SessionStore: Send + Sync {
    /// Returns the conversation named by `local_id` when it exists, otherwise
    /// creates a fresh one owned by `user_id`.
    fn resolve_or_create_conversation(
        &self,
        local_id: Option<&str>,
        user_id: &str,
    ) -> Result<ConversationRecord, StoreError>;

    fn create_conversation(
        &self,
        user_id: &str,
        title: Option<&str>,
    ) -> Result<ConversationRecord, StoreError>;

    fn conversation(&self, local_id: &str) -> Result<Option<ConversationRecord>, StoreError>;

    fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationRecord>, StoreError>;

    fn rename_conversation(
        &self,
        local_id: &str,
        user_id: &str,
        title: &str,
    ) -> Result<ConversationRecord, StoreError>;

    fn delete_conversation(&self, local_id: &str, user_id: &str) -> Result<(), StoreError>;

    fn upstream_session_id(&self, local_id: &str) -> Result<Option<String>, StoreError>;

    /// Last write wins. `None` forgets the cached id.
    fn set_upstream_session_id(
        &self,
        local_id: &str,
        upstream_id: Option<&str>,
    ) -> Result<(), StoreError>;

    fn append_user_query(
        &self,
        conversation_id: &str,
        query: &str,
        helper: Option<&str>,
    ) -> Result<MessageRecord, StoreError>;

    /// Single writer per message id; a second call fails with `AlreadyFinalized`.
    fn finalize_answer(
        &self,
        message_id: &str,
        text: &str,
        reasoning: &[String],
    ) -> Result<(), StoreError>;

    fn list_messages(&self, conversation_id: &str) -> Result<Vec<MessageRecord>, StoreError>;
}

/// Title derived from the first query of a conversation.
pub fn auto_title(query: &str) -> String {
    let collapsed = query.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= AUTO_TITLE_MAX_CHARS {
        return collapsed;
    }
    let mut title: String = collapsed.chars().take(AUTO_TITLE_MAX_CHARS).collect();
    title.push_str("...");
    title
}

pub fn normalize_title(title: Option<&str>) -> String {
    match title.map(str::trim) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => DEFAULT_CONVERSATION_TITLE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_title_collapses_whitespace_and_truncates_on_char_boundary() {
        assert_eq!(auto_title("  hello \n world "), "hello world");
        let long = "你好".repeat(30);
        let title = auto_title(&long);
        assert_eq!(title.chars().count(), AUTO_TITLE_MAX_CHARS + 3);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn normalize_title_falls_back_to_default() {
        assert_eq!(normalize_title(None), DEFAULT_CONVERSATION_TITLE);
        assert_eq!(normalize_title(Some("   ")), DEFAULT_CONVERSATION_TITLE);
        assert_eq!(normalize_title(Some(" Trip plan ")), "Trip plan");
    }
}
