//! Freshet - streaming response orchestration for LLM chat
//!
//! Freshet sits between a chat frontend and a streaming inference server.
//! It paces raw generation output into smooth transcript updates, correlates
//! each generation with its signals on a shared broadcast bus, enforces one
//! active generation per conversation, and persists completed turns exactly
//! once.
//!
//! [`Engine`] owns what every conversation shares; each conversation is
//! driven through a [`ConversationController`] and observed through its
//! broadcast update channel.

pub mod config;
pub mod controller;
pub mod correlator;
pub mod drip;
pub mod engine;
pub mod error;
pub mod llm;
pub mod session;
pub mod storage;
#[cfg(test)]
mod testing;
mod title;
pub mod transcript;

pub use config::{EngineConfig, Settings, TitleConfig};
pub use controller::{ConversationController, SendOptions};
pub use engine::Engine;
pub use error::EngineError;
pub use session::{SessionHandle, SessionOutcome, SessionStatus};
pub use storage::{ChatStore, ConversationRecord, SqliteStore, StoreError};
pub use transcript::{Attachment, Message, Role, Transcript, TranscriptEvent};
