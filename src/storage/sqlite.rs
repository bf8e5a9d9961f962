//! SQLite-backed chat store

use super::{ChatStore, ConversationRecord, StoreError, StoreResult};
use crate::transcript::{Attachment, Message, Role, ToolInvocation};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    title TEXT,
    model TEXT,
    system_instruction TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    attachments TEXT,
    tool_calls TEXT,
    created_at TEXT NOT NULL,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at);
";

/// Thread-safe store handle
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;

        // Pre-title databases lack this column; ignore the error once added
        let _ = conn.execute(
            "ALTER TABLE conversations ADD COLUMN system_instruction TEXT",
            [],
        );

        Ok(())
    }

    fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
        let role_raw: String = row.get(1)?;
        let role = Role::parse(&role_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                format!("unknown role: {role_raw}").into(),
            )
        })?;

        let attachments: Vec<Attachment> = row
            .get::<_, Option<String>>(3)?
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        let tool_calls: Vec<ToolInvocation> = row
            .get::<_, Option<String>>(4)?
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();

        Ok(Message {
            id: row.get(0)?,
            role,
            content: row.get(2)?,
            attachments,
            tool_calls,
            streaming: false,
            created_at: parse_datetime(&row.get::<_, String>(5)?),
        })
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn create_conversation(
        &self,
        model: Option<&str>,
        system_instruction: Option<&str>,
    ) -> StoreResult<String> {
        let conn = self.conn.lock().unwrap();
        let id = Uuid::new_v4().to_string();
        let now = format_ts(Utc::now());
        conn.execute(
            "INSERT INTO conversations (id, title, model, system_instruction, created_at, updated_at)
             VALUES (?1, NULL, ?2, ?3, ?4, ?4)",
            params![id, model, system_instruction, now],
        )?;
        Ok(id)
    }

    async fn get_conversation(&self, conversation_id: &str) -> StoreResult<ConversationRecord> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, title, model, system_instruction, created_at
             FROM conversations WHERE id = ?1",
        )?;

        stmt.query_row(params![conversation_id], |row| {
            Ok(ConversationRecord {
                id: row.get(0)?,
                title: row.get(1)?,
                model: row.get(2)?,
                system_instruction: row.get(3)?,
                created_at: parse_datetime(&row.get::<_, String>(4)?),
            })
        })
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                StoreError::ConversationNotFound(conversation_id.to_string())
            }
            other => StoreError::Sqlite(other),
        })
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<Message>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, role, content, attachments, tool_calls, created_at
             FROM messages WHERE conversation_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![conversation_id, limit], Self::row_to_message)?;
        let mut messages = rows.collect::<Result<Vec<_>, _>>()?;
        // Query returns newest first; callers want chronological order
        messages.reverse();
        Ok(messages)
    }

    async fn append_message(&self, conversation_id: &str, message: &Message) -> StoreResult<()> {
        let attachments = if message.attachments.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&message.attachments)?)
        };
        let tool_calls = if message.tool_calls.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&message.tool_calls)?)
        };

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO messages (id, conversation_id, role, content, attachments, tool_calls, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id,
                conversation_id,
                message.role.as_str(),
                message.content,
                attachments,
                tool_calls,
                format_ts(message.created_at),
            ],
        )?;
        conn.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![format_ts(Utc::now()), conversation_id],
        )?;
        Ok(())
    }

    async fn update_message(&self, message_id: &str, content: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE messages SET content = ?1 WHERE id = ?2",
            params![content, message_id],
        )?;
        if updated == 0 {
            return Err(StoreError::MessageNotFound(message_id.to_string()));
        }
        Ok(())
    }

    async fn delete_messages_after(
        &self,
        conversation_id: &str,
        after: DateTime<Utc>,
    ) -> StoreResult<usize> {
        let conn = self.conn.lock().unwrap();
        // Timestamps are fixed-precision RFC 3339 in UTC, so string comparison
        // matches chronological comparison
        let deleted = conn.execute(
            "DELETE FROM messages WHERE conversation_id = ?1 AND created_at > ?2",
            params![conversation_id, format_ts(after)],
        )?;
        Ok(deleted)
    }

    async fn set_conversation_title(&self, conversation_id: &str, title: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3",
            params![title, format_ts(Utc::now()), conversation_id],
        )?;
        if updated == 0 {
            return Err(StoreError::ConversationNotFound(conversation_id.to_string()));
        }
        Ok(())
    }

    async fn set_conversation_model(&self, conversation_id: &str, model: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE conversations SET model = ?1, updated_at = ?2 WHERE id = ?3",
            params![model, format_ts(Utc::now()), conversation_id],
        )?;
        if updated == 0 {
            return Err(StoreError::ConversationNotFound(conversation_id.to_string()));
        }
        Ok(())
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
