use chrono::Utc;
use relay_core::store::{
    auto_title, normalize_title, ConversationRecord, MessageRecord, SessionStore, StoreError,
    DEFAULT_CONVERSATION_TITLE,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct MemoryState {
    conversations: HashMap<String, ConversationRecord>,
    /// Message ids per conversation in append order.
    order: HashMap<String, Vec<String>>,
    messages: HashMap<String, MessageRecord>,
}

impl MemoryState {
    fn owned_mut(
        &mut self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<&mut ConversationRecord, StoreError> {
        let record = self
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::ConversationNotFound(conversation_id.to_string()))?;
        if record.user_id != user_id {
            return Err(StoreError::NotOwner {
                conversation_id: conversation_id.to_string(),
                user_id: user_id.to_string(),
            });
        }
        Ok(record)
    }

    fn insert_conversation(
        &mut self,
        conversation_id: Option<&str>,
        user_id: &str,
        title: Option<&str>,
    ) -> ConversationRecord {
        let now = Utc::now();
        let record = ConversationRecord {
            id: conversation_id
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            user_id: user_id.to_string(),
            upstream_session_id: None,
            title: normalize_title(title),
            created_at: now,
            updated_at: now,
        };
        self.conversations.insert(record.id.clone(), record.clone());
        record
    }
}

/// Process-local store. Used when no database is configured and as the
/// target of [`crate::FailoverStore`] once the database is unusable.
#[derive(Default)]
pub struct MemoryChatStore {
    state: Mutex<MemoryState>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionStore for MemoryChatStore {
    fn resolve_or_create_conversation(
        &self,
        local_id: Option<&str>,
        user_id: &str,
    ) -> Result<ConversationRecord, StoreError> {
        let mut state = self.state();
        let requested = local_id.map(str::trim).filter(|id| !id.is_empty());
        if let Some(id) = requested {
            if state.conversations.contains_key(id) {
                return state.owned_mut(id, user_id).map(|record| record.clone());
            }
        }
        Ok(state.insert_conversation(requested, user_id, None))
    }

    fn create_conversation(
        &self,
        user_id: &str,
        title: Option<&str>,
    ) -> Result<ConversationRecord, StoreError> {
        Ok(self.state().insert_conversation(None, user_id, title))
    }

    fn conversation(&self, local_id: &str) -> Result<Option<ConversationRecord>, StoreError> {
        Ok(self.state().conversations.get(local_id).cloned())
    }

    fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationRecord>, StoreError> {
        let mut conversations: Vec<ConversationRecord> = self
            .state()
            .conversations
            .values()
            .filter(|record| record.user_id == user_id)
            .cloned()
            .collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    fn rename_conversation(
        &self,
        local_id: &str,
        user_id: &str,
        title: &str,
    ) -> Result<ConversationRecord, StoreError> {
        let mut state = self.state();
        let record = state.owned_mut(local_id, user_id)?;
        record.title = normalize_title(Some(title));
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    fn delete_conversation(&self, local_id: &str, user_id: &str) -> Result<(), StoreError> {
        let mut state = self.state();
        state.owned_mut(local_id, user_id)?;
        state.conversations.remove(local_id);
        for message_id in state.order.remove(local_id).unwrap_or_default() {
            state.messages.remove(&message_id);
        }
        Ok(())
    }

    fn upstream_session_id(&self, local_id: &str) -> Result<Option<String>, StoreError> {
        self.state()
            .conversations
            .get(local_id)
            .map(|record| record.upstream_session_id.clone())
            .ok_or_else(|| StoreError::ConversationNotFound(local_id.to_string()))
    }

    fn set_upstream_session_id(
        &self,
        local_id: &str,
        upstream_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        let record = state
            .conversations
            .get_mut(local_id)
            .ok_or_else(|| StoreError::ConversationNotFound(local_id.to_string()))?;
        record.upstream_session_id = upstream_id.map(str::to_string);
        record.updated_at = Utc::now();
        Ok(())
    }

    fn append_user_query(
        &self,
        conversation_id: &str,
        query: &str,
        helper: Option<&str>,
    ) -> Result<MessageRecord, StoreError> {
        let mut state = self.state();
        let first_message = state
            .order
            .get(conversation_id)
            .map_or(true, |ids| ids.is_empty());
        let now = Utc::now();
        let record = {
            let conversation = state
                .conversations
                .get_mut(conversation_id)
                .ok_or_else(|| StoreError::ConversationNotFound(conversation_id.to_string()))?;
            if first_message && conversation.title == DEFAULT_CONVERSATION_TITLE {
                conversation.title = auto_title(query);
            }
            conversation.updated_at = now;
            MessageRecord {
                id: uuid::Uuid::new_v4().to_string(),
                conversation_id: conversation_id.to_string(),
                query: query.to_string(),
                answer: String::new(),
                reasoning: None,
                helper: helper.map(str::to_string),
                created_at: now,
                answered_at: None,
            }
        };
        state
            .order
            .entry(conversation_id.to_string())
            .or_default()
            .push(record.id.clone());
        state.messages.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    fn finalize_answer(
        &self,
        message_id: &str,
        text: &str,
        reasoning: &[String],
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        let now = Utc::now();
        let message = state
            .messages
            .get_mut(message_id)
            .ok_or_else(|| StoreError::MessageNotFound(message_id.to_string()))?;
        if message.is_finalized() {
            return Err(StoreError::AlreadyFinalized(message_id.to_string()));
        }
        message.answer = text.to_string();
        message.reasoning = (!reasoning.is_empty()).then(|| reasoning.to_vec());
        message.answered_at = Some(now);
        let conversation_id = message.conversation_id.clone();
        if let Some(conversation) = state.conversations.get_mut(&conversation_id) {
            conversation.updated_at = now;
        }
        Ok(())
    }

    fn list_messages(&self, conversation_id: &str) -> Result<Vec<MessageRecord>, StoreError> {
        let state = self.state();
        Ok(state
            .order
            .get(conversation_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.messages.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }
}
