use crate::MemoryChatStore;
use relay_core::store::{ConversationRecord, MessageRecord, SessionStore, StoreError};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, warn};

/// Serves from the primary store until it reports a backend failure, then
/// switches to an in-memory store for the rest of the process lifetime.
pub struct FailoverStore {
    primary: Box<dyn SessionStore>,
    fallback: MemoryChatStore,
    degraded: AtomicBool,
}

impl FailoverStore {
    pub fn new(primary: Box<dyn SessionStore>) -> Self {
        Self {
            primary,
            fallback: MemoryChatStore::new(),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    fn run<T>(
        &self,
        operation: &'static str,
        call: impl Fn(&dyn SessionStore) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        if self.is_degraded() {
            return call(&self.fallback);
        }
        match call(self.primary.as_ref()) {
            Err(err) if err.is_backend_failure() => {
                if !self.degraded.swap(true, Ordering::AcqRel) {
                    error!(
                        event = "store_failover",
                        operation,
                        error = %err,
                        "primary store failed; continuing with in-memory store"
                    );
                } else {
                    warn!(event = "store_failover_race", operation, error = %err);
                }
                call(&self.fallback)
            }
            other => other,
        }
    }
}

impl SessionStore for FailoverStore {
    fn resolve_or_create_conversation(
        &self,
        local_id: Option<&str>,
        user_id: &str,
    ) -> Result<ConversationRecord, StoreError> {
        self.run("resolve_or_create_conversation", |store| {
            store.resolve_or_create_conversation(local_id, user_id)
        })
    }

    fn create_conversation(
        &self,
        user_id: &str,
        title: Option<&str>,
    ) -> Result<ConversationRecord, StoreError> {
        self.run("create_conversation", |store| {
            store.create_conversation(user_id, title)
        })
    }

    fn conversation(&self, local_id: &str) -> Result<Option<ConversationRecord>, StoreError> {
        self.run("conversation", |store| store.conversation(local_id))
    }

    fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationRecord>, StoreError> {
        self.run("list_conversations", |store| store.list_conversations(user_id))
    }

    fn rename_conversation(
        &self,
        local_id: &str,
        user_id: &str,
        title: &str,
    ) -> Result<ConversationRecord, StoreError> {
        self.run("rename_conversation", |store| {
            store.rename_conversation(local_id, user_id, title)
        })
    }

    fn delete_conversation(&self, local_id: &str, user_id: &str) -> Result<(), StoreError> {
        self.run("delete_conversation", |store| {
            store.delete_conversation(local_id, user_id)
        })
    }

    fn upstream_session_id(&self, local_id: &str) -> Result<Option<String>, StoreError> {
        self.run("upstream_session_id", |store| {
            store.upstream_session_id(local_id)
        })
    }

    fn set_upstream_session_id(
        &self,
        local_id: &str,
        upstream_id: Option<&str>,
    ) -> Result<(), StoreError> {
        self.run("set_upstream_session_id", |store| {
            store.set_upstream_session_id(local_id, upstream_id)
        })
    }

    fn append_user_query(
        &self,
        conversation_id: &str,
        query: &str,
        helper: Option<&str>,
    ) -> Result<MessageRecord, StoreError> {
        self.run("append_user_query", |store| {
            store.append_user_query(conversation_id, query, helper)
        })
    }

    fn finalize_answer(
        &self,
        message_id: &str,
        text: &str,
        reasoning: &[String],
    ) -> Result<(), StoreError> {
        self.run("finalize_answer", |store| {
            store.finalize_answer(message_id, text, reasoning)
        })
    }

    fn list_messages(&self, conversation_id: &str) -> Result<Vec<MessageRecord>, StoreError> {
        self.run("list_messages", |store| store.list_messages(conversation_id))
    }
}
