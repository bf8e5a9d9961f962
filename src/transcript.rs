//! Conversation transcript model
//!
//! A [`Transcript`] is the in-memory message list for one open conversation.
//! It is shared between the conversation controller, the generation session
//! task, and the title job behind a mutex, and every mutation is mirrored to
//! subscribers as a [`TranscriptEvent`] so render layers can stay in sync
//! without polling.

use base64::prelude::{Engine as _, BASE64_STANDARD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

// ============================================================================
// Messages
// ============================================================================

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binary payload attached to a message, carried as base64 text so the whole
/// message serializes to JSON without a side channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub media_type: String,
    pub data: String,
}

impl Attachment {
    pub fn from_bytes(media_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            media_type: media_type.into(),
            data: BASE64_STANDARD.encode(bytes),
        }
    }

    pub fn from_base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            data: data.into(),
        }
    }

    /// Decode the payload back to raw bytes.
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64_STANDARD.decode(&self.data)
    }
}

/// Lifecycle of a tool call surfaced mid-stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Calling,
    Done,
}

/// A tool call the model emitted while generating
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    pub status: ToolCallStatus,
}

/// One transcript entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolInvocation>,
    /// True while a generation session is still appending to this message.
    #[serde(default)]
    pub streaming: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            attachments: Vec::new(),
            tool_calls: Vec::new(),
            streaming: false,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    /// An empty assistant entry that a generation session will fill in.
    pub fn streaming_placeholder() -> Self {
        let mut msg = Self::new(Role::Assistant, "");
        msg.streaming = true;
        msg
    }
}

// ============================================================================
// Transcript
// ============================================================================

/// Ordered message list for one conversation
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: Vec<Message>,
}

/// Transcript handle shared across the controller and its background tasks
pub type SharedTranscript = Arc<Mutex<Transcript>>;

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn get(&self, message_id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    pub fn get_mut(&mut self, message_id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == message_id)
    }

    pub fn position(&self, message_id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == message_id)
    }

    /// Append streamed text to a message, returning false if the id is gone.
    pub fn append_content(&mut self, message_id: &str, delta: &str) -> bool {
        match self.get_mut(message_id) {
            Some(msg) => {
                msg.content.push_str(delta);
                true
            }
            None => false,
        }
    }

    /// Drop every message after the given index, keeping `keep + 1` entries.
    pub fn truncate_after(&mut self, keep: usize) {
        self.messages.truncate(keep + 1);
    }
}

// ============================================================================
// Update events
// ============================================================================

/// How a generation turn resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Cancelled,
    Failed { message: String },
}

/// Incremental transcript change, broadcast to render layers.
///
/// Streamed text arrives as [`TranscriptEvent::MessageAppend`] deltas rather
/// than full snapshots so subscribers never re-render an entire message per
/// tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEvent {
    /// A new message was pushed onto the transcript
    MessageAdded(Message),
    /// Streamed text was appended to an existing message
    MessageAppend { message_id: String, delta: String },
    /// A message's content was replaced wholesale (edits, error markers)
    MessageReplaced { message_id: String, content: String },
    /// A tool call on a streaming message appeared or changed status
    ToolCallUpdate {
        message_id: String,
        call: ToolInvocation,
    },
    /// The message stopped streaming and holds its final content
    MessageFinalized {
        message_id: String,
        outcome: SessionOutcome,
    },
    /// Everything after this message was removed
    Truncated { last_message_id: String },
    /// The conversation title changed
    TitleChanged { title: String },
}
