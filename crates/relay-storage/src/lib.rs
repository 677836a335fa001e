use chrono::{DateTime, SecondsFormat, Utc};
use relay_core::store::{
    auto_title, normalize_title, ConversationRecord, MessageRecord, SessionStore, StoreError,
    DEFAULT_CONVERSATION_TITLE,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

mod failover;
mod memory;

pub use failover::FailoverStore;
pub use memory::MemoryChatStore;

pub const CHAT_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
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
}

impl From<StorageError> for StoreError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::ConversationNotFound(id) => StoreError::ConversationNotFound(id),
            StorageError::MessageNotFound(id) => StoreError::MessageNotFound(id),
            StorageError::NotOwner {
                conversation_id,
                user_id,
            } => StoreError::NotOwner {
                conversation_id,
                user_id,
            },
            StorageError::AlreadyFinalized(id) => StoreError::AlreadyFinalized(id),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

pub struct ChatStore {
    conn: Mutex<Connection>,
}

impl ChatStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn()
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > CHAT_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: CHAT_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_chat_schema.sql");
            let conn = self.conn();
            conn.execute_batch(sql)?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        }

        Ok(())
    }

    pub fn table_exists(&self, table: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn()
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    pub fn conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationRecord>, StorageError> {
        let conn = self.conn();
        load_conversation(&conn, conversation_id)
    }

    pub fn create_conversation(
        &self,
        conversation_id: Option<&str>,
        user_id: &str,
        title: Option<&str>,
    ) -> Result<ConversationRecord, StorageError> {
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
        self.conn().execute(
            "
            INSERT INTO conversations (
                conversation_id,
                user_id,
                upstream_session_id,
                title,
                created_at,
                updated_at
            ) VALUES (?1, ?2, NULL, ?3, ?4, ?5)
            ",
            params![
                record.id,
                record.user_id,
                record.title,
                format_timestamp(record.created_at),
                format_timestamp(record.updated_at),
            ],
        )?;
        Ok(record)
    }

    pub fn resolve_or_create_conversation(
        &self,
        conversation_id: Option<&str>,
        user_id: &str,
    ) -> Result<ConversationRecord, StorageError> {
        let requested = conversation_id.map(str::trim).filter(|id| !id.is_empty());
        if let Some(id) = requested {
            if let Some(existing) = self.conversation(id)? {
                if existing.user_id != user_id {
                    return Err(StorageError::NotOwner {
                        conversation_id: id.to_string(),
                        user_id: user_id.to_string(),
                    });
                }
                return Ok(existing);
            }
        }
        self.create_conversation(requested, user_id, None)
    }

    pub fn list_conversations(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConversationRecord>, StorageError> {
        let conn = self.conn();
        let mut statement = conn.prepare(
            "
            SELECT conversation_id, user_id, upstream_session_id, title, created_at, updated_at
            FROM conversations
            WHERE user_id = ?1
            ORDER BY updated_at DESC, rowid DESC
            ",
        )?;
        let rows = statement.query_map([user_id], conversation_from_row)?;
        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }

    pub fn rename_conversation(
        &self,
        conversation_id: &str,
        user_id: &str,
        title: &str,
    ) -> Result<ConversationRecord, StorageError> {
        let conn = self.conn();
        let mut record = owned_conversation(&conn, conversation_id, user_id)?;
        record.title = normalize_title(Some(title));
        record.updated_at = Utc::now();
        conn.execute(
            "UPDATE conversations SET title = ?1, updated_at = ?2 WHERE conversation_id = ?3",
            params![
                record.title,
                format_timestamp(record.updated_at),
                conversation_id
            ],
        )?;
        Ok(record)
    }

    pub fn delete_conversation(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<(), StorageError> {
        let mut conn = self.conn();
        owned_conversation(&conn, conversation_id, user_id)?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            [conversation_id],
        )?;
        tx.execute(
            "DELETE FROM conversations WHERE conversation_id = ?1",
            [conversation_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn upstream_session_id(
        &self,
        conversation_id: &str,
    ) -> Result<Option<String>, StorageError> {
        let value = self
            .conn()
            .query_row(
                "SELECT upstream_session_id FROM conversations WHERE conversation_id = ?1",
                [conversation_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        match value {
            Some(session) => Ok(session),
            None => Err(StorageError::ConversationNotFound(
                conversation_id.to_string(),
            )),
        }
    }

    pub fn set_upstream_session_id(
        &self,
        conversation_id: &str,
        upstream_id: Option<&str>,
    ) -> Result<(), StorageError> {
        let changes = self.conn().execute(
            "
            UPDATE conversations
            SET upstream_session_id = ?1, updated_at = ?2
            WHERE conversation_id = ?3
            ",
            params![upstream_id, format_timestamp(Utc::now()), conversation_id],
        )?;
        if changes == 0 {
            return Err(StorageError::ConversationNotFound(
                conversation_id.to_string(),
            ));
        }
        Ok(())
    }

    pub fn append_user_query(
        &self,
        conversation_id: &str,
        query: &str,
        helper: Option<&str>,
    ) -> Result<MessageRecord, StorageError> {
        let mut conn = self.conn();
        let conversation = load_conversation(&conn, conversation_id)?
            .ok_or_else(|| StorageError::ConversationNotFound(conversation_id.to_string()))?;
        let now = Utc::now();
        let record = MessageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            query: query.to_string(),
            answer: String::new(),
            reasoning: None,
            helper: helper.map(str::to_string),
            created_at: now,
            answered_at: None,
        };

        let tx = conn.transaction()?;
        let prior_messages: i64 = tx.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "
            INSERT INTO messages (
                message_id,
                conversation_id,
                query,
                answer,
                reasoning_json,
                helper,
                created_at,
                answered_at
            ) VALUES (?1, ?2, ?3, '', NULL, ?4, ?5, NULL)
            ",
            params![
                record.id,
                record.conversation_id,
                record.query,
                record.helper,
                format_timestamp(record.created_at),
            ],
        )?;
        let title = if prior_messages == 0 && conversation.title == DEFAULT_CONVERSATION_TITLE {
            auto_title(query)
        } else {
            conversation.title
        };
        tx.execute(
            "UPDATE conversations SET title = ?1, updated_at = ?2 WHERE conversation_id = ?3",
            params![title, format_timestamp(now), conversation_id],
        )?;
        tx.commit()?;
        Ok(record)
    }

    pub fn finalize_answer(
        &self,
        message_id: &str,
        text: &str,
        reasoning: &[String],
    ) -> Result<(), StorageError> {
        let reasoning_json = if reasoning.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(reasoning)
                    .map_err(|err| StorageError::Serialization(err.to_string()))?,
            )
        };
        let now = format_timestamp(Utc::now());
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let changes = tx.execute(
            "
            UPDATE messages
            SET answer = ?1, reasoning_json = ?2, answered_at = ?3
            WHERE message_id = ?4 AND answered_at IS NULL
            ",
            params![text, reasoning_json, now, message_id],
        )?;
        if changes == 0 {
            let exists = tx
                .query_row(
                    "SELECT 1 FROM messages WHERE message_id = ?1",
                    [message_id],
                    |_| Ok(()),
                )
                .optional()?;
            return Err(match exists {
                Some(()) => StorageError::AlreadyFinalized(message_id.to_string()),
                None => StorageError::MessageNotFound(message_id.to_string()),
            });
        }
        tx.execute(
            "
            UPDATE conversations SET updated_at = ?1
            WHERE conversation_id = (SELECT conversation_id FROM messages WHERE message_id = ?2)
            ",
            params![now, message_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn list_messages(&self, conversation_id: &str) -> Result<Vec<MessageRecord>, StorageError> {
        let conn = self.conn();
        let mut statement = conn.prepare(
            "
            SELECT message_id, conversation_id, query, answer, reasoning_json, helper,
                   created_at, answered_at
            FROM messages
            WHERE conversation_id = ?1
            ORDER BY created_at ASC, rowid ASC
            ",
        )?;
        let rows = statement.query_map([conversation_id], message_from_row)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn message(&self, message_id: &str) -> Result<Option<MessageRecord>, StorageError> {
        let row = self
            .conn()
            .query_row(
                "
                SELECT message_id, conversation_id, query, answer, reasoning_json, helper,
                       created_at, answered_at
                FROM messages
                WHERE message_id = ?1
                ",
                [message_id],
                message_from_row,
            )
            .optional()?;
        Ok(row)
    }
}

impl SessionStore for ChatStore {
    fn resolve_or_create_conversation(
        &self,
        local_id: Option<&str>,
        user_id: &str,
    ) -> Result<ConversationRecord, StoreError> {
        Ok(ChatStore::resolve_or_create_conversation(self, local_id, user_id)?)
    }

    fn create_conversation(
        &self,
        user_id: &str,
        title: Option<&str>,
    ) -> Result<ConversationRecord, StoreError> {
        Ok(ChatStore::create_conversation(self, None, user_id, title)?)
    }

    fn conversation(&self, local_id: &str) -> Result<Option<ConversationRecord>, StoreError> {
        Ok(ChatStore::conversation(self, local_id)?)
    }

    fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationRecord>, StoreError> {
        Ok(ChatStore::list_conversations(self, user_id)?)
    }

    fn rename_conversation(
        &self,
        local_id: &str,
        user_id: &str,
        title: &str,
    ) -> Result<ConversationRecord, StoreError> {
        Ok(ChatStore::rename_conversation(self, local_id, user_id, title)?)
    }

    fn delete_conversation(&self, local_id: &str, user_id: &str) -> Result<(), StoreError> {
        Ok(ChatStore::delete_conversation(self, local_id, user_id)?)
    }

    fn upstream_session_id(&self, local_id: &str) -> Result<Option<String>, StoreError> {
        Ok(ChatStore::upstream_session_id(self, local_id)?)
    }

    fn set_upstream_session_id(
        &self,
        local_id: &str,
        upstream_id: Option<&str>,
    ) -> Result<(), StoreError> {
        Ok(ChatStore::set_upstream_session_id(self, local_id, upstream_id)?)
    }

    fn append_user_query(
        &self,
        conversation_id: &str,
        query: &str,
        helper: Option<&str>,
    ) -> Result<MessageRecord, StoreError> {
        Ok(ChatStore::append_user_query(self, conversation_id, query, helper)?)
    }

    fn finalize_answer(
        &self,
        message_id: &str,
        text: &str,
        reasoning: &[String],
    ) -> Result<(), StoreError> {
        Ok(ChatStore::finalize_answer(self, message_id, text, reasoning)?)
    }

    fn list_messages(&self, conversation_id: &str) -> Result<Vec<MessageRecord>, StoreError> {
        Ok(ChatStore::list_messages(self, conversation_id)?)
    }
}

fn load_conversation(
    conn: &Connection,
    conversation_id: &str,
) -> Result<Option<ConversationRecord>, StorageError> {
    let row = conn
        .query_row(
            "
            SELECT conversation_id, user_id, upstream_session_id, title, created_at, updated_at
            FROM conversations
            WHERE conversation_id = ?1
            ",
            [conversation_id],
            conversation_from_row,
        )
        .optional()?;
    Ok(row)
}

fn owned_conversation(
    conn: &Connection,
    conversation_id: &str,
    user_id: &str,
) -> Result<ConversationRecord, StorageError> {
    let record = load_conversation(conn, conversation_id)?
        .ok_or_else(|| StorageError::ConversationNotFound(conversation_id.to_string()))?;
    if record.user_id != user_id {
        return Err(StorageError::NotOwner {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
        });
    }
    Ok(record)
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationRecord> {
    Ok(ConversationRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        upstream_session_id: row.get(2)?,
        title: row.get(3)?,
        created_at: timestamp_column(row, 4)?,
        updated_at: timestamp_column(row, 5)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    let reasoning_json: Option<String> = row.get(4)?;
    let reasoning = reasoning_json
        .map(|raw| {
            serde_json::from_str::<Vec<String>>(&raw).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    4,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })
        })
        .transpose()?;
    let answered_at = match row.get::<_, Option<String>>(7)? {
        Some(raw) => Some(parse_timestamp(raw).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(err))
        })?),
        None => None,
    };
    Ok(MessageRecord {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        query: row.get(2)?,
        answer: row.get(3)?,
        reasoning,
        helper: row.get(5)?,
        created_at: timestamp_column(row, 6)?,
        answered_at,
    })
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_timestamp(row.get::<_, String>(idx)?).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
    })
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}
