//! Conversation persistence
//!
//! The engine only ever persists settled content: user messages on send,
//! assistant messages once their generation completes. Streaming state never
//! touches the store.

mod sqlite;

pub use sqlite::SqliteStore;

use crate::transcript::Message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("Message not found: {0}")]
    MessageNotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Stored conversation metadata
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRecord {
    pub id: String,
    pub title: Option<String>,
    pub model: Option<String>,
    pub system_instruction: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Persistence operations the engine needs from a backing store
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Create a conversation row and return its id.
    async fn create_conversation(
        &self,
        model: Option<&str>,
        system_instruction: Option<&str>,
    ) -> StoreResult<String>;

    async fn get_conversation(&self, conversation_id: &str) -> StoreResult<ConversationRecord>;

    /// The most recent `limit` messages, in chronological order.
    async fn list_messages(&self, conversation_id: &str, limit: usize)
        -> StoreResult<Vec<Message>>;

    async fn append_message(&self, conversation_id: &str, message: &Message) -> StoreResult<()>;

    /// Replace a message's content in place.
    async fn update_message(&self, message_id: &str, content: &str) -> StoreResult<()>;

    /// Delete every message created strictly after `after`. Returns how many
    /// rows went away.
    async fn delete_messages_after(
        &self,
        conversation_id: &str,
        after: DateTime<Utc>,
    ) -> StoreResult<usize>;

    async fn set_conversation_title(&self, conversation_id: &str, title: &str) -> StoreResult<()>;

    async fn set_conversation_model(&self, conversation_id: &str, model: &str) -> StoreResult<()>;
}
