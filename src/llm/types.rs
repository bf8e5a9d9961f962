//! Common types for streaming inference

use crate::transcript::{Attachment, Role};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Shared bus that backends publish [`StreamSignal`]s onto.
///
/// Every live stream multiplexes over the same channel; receivers filter by
/// `stream_id`.
pub type SignalBus = broadcast::Sender<StreamSignal>;

/// One event from a streaming generation, tagged with its stream
#[derive(Debug, Clone)]
pub struct StreamSignal {
    pub stream_id: String,
    pub kind: SignalKind,
}

impl StreamSignal {
    pub fn new(stream_id: impl Into<String>, kind: SignalKind) -> Self {
        Self {
            stream_id: stream_id.into(),
            kind,
        }
    }
}

/// What happened on the stream
#[derive(Debug, Clone)]
pub enum SignalKind {
    /// The backend accepted the request and began producing output
    Started,
    /// A piece of generated output
    Chunk(StreamChunk),
    /// The stream finished cleanly
    Completed,
    /// The stream died
    Errored { message: String },
    /// The stream was stopped at the caller's request
    Cancelled,
}

/// A unit of streamed output
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    pub text: Option<String>,
    pub tool_call: Option<ToolCallStart>,
    /// Set on the chunk the backend marks as its last
    pub done: bool,
}

impl StreamChunk {
    pub fn text(s: impl Into<String>) -> Self {
        Self {
            text: Some(s.into()),
            ..Self::default()
        }
    }

    pub fn final_marker() -> Self {
        Self {
            done: true,
            ..Self::default()
        }
    }
}

/// A tool call announced mid-stream
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallStart {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// A message in the outbound request payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl OutboundMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            attachments: Vec::new(),
        }
    }
}

/// Sampling parameters forwarded with each request.
///
/// All fields are optional; `None` leaves the server's own default in place.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOptions {
    pub temperature: Option<f32>,
    pub top_k: Option<u32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl GenerationOptions {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// A streaming completion request
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<OutboundMessage>,
    pub options: GenerationOptions,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<OutboundMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            options: GenerationOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }
}

/// A model the backend reports as available
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub modified_at: Option<String>,
}
