//! Conversation orchestration
//!
//! One [`ConversationController`] per open conversation. It owns the
//! in-memory transcript, enforces the single-active-generation rule, lazily
//! creates the stored conversation on first send, and hands each assistant
//! turn to a generation session. UI layers observe it through the broadcast
//! update channel rather than return values.

use crate::config::{EngineConfig, Settings};
use crate::error::EngineError;
use crate::llm::{
    CompletionRequest, GenerationOptions, OutboundMessage, ProviderRegistry, SignalBus,
};
use crate::session::{self, SessionParams, SessionStatus};
use crate::storage::ChatStore;
use crate::title::{spawn_title_job, TitleJobParams};
use crate::transcript::{
    Attachment, Message, Role, SharedTranscript, Transcript, TranscriptEvent,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Per-send overrides on top of the conversation and settings defaults
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Model for this turn onward; sticks as the conversation model
    pub model: Option<String>,
    /// Sampling parameters for this turn only
    pub params: Option<GenerationOptions>,
}

/// Orchestrates one conversation's transcript, persistence, and generations.
pub struct ConversationController {
    store: Arc<dyn ChatStore>,
    registry: Arc<ProviderRegistry>,
    signals: SignalBus,
    settings: Settings,
    config: EngineConfig,
    /// `None` until the first send creates the stored conversation
    conversation_id: Option<String>,
    transcript: SharedTranscript,
    updates: broadcast::Sender<TranscriptEvent>,
    conversation_model: Option<String>,
    system_instruction: Option<String>,
    active: Option<session::SessionHandle>,
    title_done: Arc<AtomicBool>,
}

impl fmt::Debug for ConversationController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationController")
            .field("conversation_id", &self.conversation_id)
            .field("conversation_model", &self.conversation_model)
            .field("system_instruction", &self.system_instruction)
            .finish_non_exhaustive()
    }
}

impl ConversationController {
    /// A controller for a conversation that does not exist in the store yet.
    pub(crate) fn open(
        store: Arc<dyn ChatStore>,
        registry: Arc<ProviderRegistry>,
        signals: SignalBus,
        settings: Settings,
        config: EngineConfig,
    ) -> Self {
        let (updates, _) = broadcast::channel(config.bus_capacity);
        Self {
            store,
            registry,
            signals,
            settings,
            config,
            conversation_id: None,
            transcript: Arc::new(Mutex::new(Transcript::new())),
            updates,
            conversation_model: None,
            system_instruction: None,
            active: None,
            title_done: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A controller rehydrated from a stored conversation.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn resume(
        store: Arc<dyn ChatStore>,
        registry: Arc<ProviderRegistry>,
        signals: SignalBus,
        settings: Settings,
        config: EngineConfig,
        conversation_id: String,
        transcript: Transcript,
        conversation_model: Option<String>,
        system_instruction: Option<String>,
        titled: bool,
    ) -> Self {
        let (updates, _) = broadcast::channel(config.bus_capacity);
        Self {
            store,
            registry,
            signals,
            settings,
            config,
            conversation_id: Some(conversation_id),
            transcript: Arc::new(Mutex::new(transcript)),
            updates,
            conversation_model,
            system_instruction,
            active: None,
            title_done: Arc::new(AtomicBool::new(titled)),
        }
    }

    // ========================================================================
    // Observation
    // ========================================================================

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn model(&self) -> Option<&str> {
        self.conversation_model.as_deref()
    }

    /// Subscribe to transcript updates. Events sent before the subscription
    /// are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.updates.subscribe()
    }

    /// Snapshot of the transcript as it stands right now.
    pub fn messages(&self) -> Vec<Message> {
        self.transcript.lock().unwrap().messages().to_vec()
    }

    pub fn is_generating(&mut self) -> bool {
        self.prune_finished();
        self.active.is_some()
    }

    /// Instruction prepended to every request. Persists with the conversation
    /// when the first send creates it.
    pub fn set_system_instruction(&mut self, instruction: Option<String>) {
        self.system_instruction = instruction;
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Append a user message and start generating the reply.
    ///
    /// Returns the id of the assistant message the reply will stream into.
    /// Rejected outright while a generation is active; nothing is added to
    /// the transcript or the store in that case.
    pub async fn send(
        &mut self,
        content: impl Into<String>,
        attachments: Vec<Attachment>,
        options: SendOptions,
    ) -> Result<String, EngineError> {
        self.prune_finished();
        if self.active.is_some() {
            tracing::warn!("Rejecting send while a generation is active");
            return Err(EngineError::GenerationAlreadyActive);
        }

        let model = self.resolve_model(options.model.as_deref())?;
        let conversation_id = self.ensure_conversation(&model).await?;

        // A model switch sticks to the conversation
        if self.conversation_model.as_deref() != Some(model.as_str()) {
            if let Err(e) = self.store.set_conversation_model(&conversation_id, &model).await {
                tracing::error!(conv_id = %conversation_id, error = %e, "Failed to persist model switch");
            }
            self.conversation_model = Some(model.clone());
        }

        let user = Message::new(Role::User, content).with_attachments(attachments);
        self.transcript.lock().unwrap().push(user.clone());
        let _ = self.updates.send(TranscriptEvent::MessageAdded(user.clone()));
        if let Err(e) = self.store.append_message(&conversation_id, &user).await {
            tracing::error!(conv_id = %conversation_id, error = %e, "Failed to persist user message");
        }

        Ok(self.start_generation(&conversation_id, &model, options.params))
    }

    /// Rewrite an earlier message, drop everything after it, and regenerate.
    ///
    /// A still-running generation is stopped first; if it does not settle
    /// within the teardown window the edit is rejected and nothing changes.
    /// Unknown message ids are rejected before any mutation.
    pub async fn edit_and_regenerate(
        &mut self,
        message_id: &str,
        new_content: impl Into<String>,
    ) -> Result<String, EngineError> {
        self.prune_finished();
        if let Some(active) = self.active.take() {
            active.stop();
            let mut status = active.status();
            let settled = tokio::time::timeout(
                self.config.teardown_wait,
                status.wait_for(|s| matches!(s, SessionStatus::Finished(_))),
            )
            .await;
            // A dropped status channel means the task is gone, which is
            // torn down enough
            if settled.is_err() {
                tracing::warn!(
                    message_id = %active.message_id,
                    "Previous generation did not settle in time, edit rejected"
                );
                self.active = Some(active);
                return Err(EngineError::GenerationAlreadyActive);
            }
        }

        let Some(conversation_id) = self.conversation_id.clone() else {
            return Err(EngineError::NotFound(message_id.to_string()));
        };
        let model = self.resolve_model(None)?;

        let new_content = new_content.into();
        let edited = {
            let mut transcript = self.transcript.lock().unwrap();
            let Some(msg) = transcript.get_mut(message_id) else {
                return Err(EngineError::NotFound(message_id.to_string()));
            };
            msg.content = new_content;
            let edited = msg.clone();
            if let Some(index) = transcript.position(message_id) {
                transcript.truncate_after(index);
            }
            edited
        };

        let _ = self.updates.send(TranscriptEvent::MessageReplaced {
            message_id: edited.id.clone(),
            content: edited.content.clone(),
        });
        let _ = self.updates.send(TranscriptEvent::Truncated {
            last_message_id: edited.id.clone(),
        });

        // The store mirrors the in-memory truncation; on failure memory
        // stays authoritative and the divergence is logged
        if let Err(e) = self.store.update_message(message_id, &edited.content).await {
            tracing::error!(message_id, error = %e, "Failed to persist edited message");
        }
        match self
            .store
            .delete_messages_after(&conversation_id, edited.created_at)
            .await
        {
            Ok(deleted) => {
                tracing::debug!(conv_id = %conversation_id, deleted, "Dropped stored tail after edit");
            }
            Err(e) => {
                tracing::error!(conv_id = %conversation_id, error = %e, "Failed to drop stored tail after edit");
            }
        }

        Ok(self.start_generation(&conversation_id, &model, None))
    }

    /// Stop the active generation, if any. Safe to call while idle.
    pub fn cancel(&mut self) {
        self.prune_finished();
        if let Some(active) = &self.active {
            tracing::info!(message_id = %active.message_id, "Cancelling generation");
            active.stop();
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn prune_finished(&mut self) {
        if self.active.as_ref().is_some_and(session::SessionHandle::is_finished) {
            self.active = None;
        }
    }

    fn resolve_model(&self, override_model: Option<&str>) -> Result<String, EngineError> {
        override_model
            .map(str::to_string)
            .or_else(|| self.conversation_model.clone())
            .or_else(|| self.settings.default_model.clone())
            .ok_or(EngineError::NoModelSelected)
    }

    async fn ensure_conversation(&mut self, model: &str) -> Result<String, EngineError> {
        if let Some(id) = &self.conversation_id {
            return Ok(id.clone());
        }
        let id = self
            .store
            .create_conversation(Some(model), self.system_instruction.as_deref())
            .await?;
        tracing::info!(conv_id = %id, model, "Created conversation");
        self.conversation_id = Some(id.clone());
        self.conversation_model = Some(model.to_string());
        Ok(id)
    }

    /// Push the streaming placeholder and spawn the session that fills it.
    fn start_generation(
        &mut self,
        conversation_id: &str,
        model: &str,
        params: Option<GenerationOptions>,
    ) -> String {
        let placeholder = Message::streaming_placeholder();
        let message_id = placeholder.id.clone();
        self.transcript.lock().unwrap().push(placeholder.clone());
        let _ = self.updates.send(TranscriptEvent::MessageAdded(placeholder));

        let request = self.assemble_request(model, params);
        let backend = self.registry.resolve(model);

        let handle = session::spawn(SessionParams {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.clone(),
            transcript: Arc::clone(&self.transcript),
            updates: self.updates.clone(),
            store: Arc::clone(&self.store),
            backend,
            signals: self.signals.clone(),
            request,
            drip_interval: self.config.drip_interval,
            timeout: self.config.generation_timeout,
        });

        if !self.title_done.load(Ordering::Relaxed) {
            spawn_title_job(TitleJobParams {
                conversation_id: conversation_id.to_string(),
                conversation_model: model.to_string(),
                transcript: Arc::clone(&self.transcript),
                registry: Arc::clone(&self.registry),
                store: Arc::clone(&self.store),
                signals: self.signals.clone(),
                updates: self.updates.clone(),
                config: self.config.title.clone(),
                session_status: handle.status(),
                title_done: Arc::clone(&self.title_done),
            });
        }

        self.active = Some(handle);
        message_id
    }

    /// Flatten the transcript into the outbound message list.
    fn assemble_request(&self, model: &str, params: Option<GenerationOptions>) -> CompletionRequest {
        let transcript = self.transcript.lock().unwrap();
        let mut messages = Vec::with_capacity(transcript.len() + 1);
        if let Some(instruction) = &self.system_instruction {
            messages.push(OutboundMessage::new(Role::System, instruction.clone()));
        }
        for msg in transcript.messages() {
            // The placeholder being filled in carries nothing worth sending
            if msg.role == Role::Assistant && msg.content.is_empty() {
                continue;
            }
            let mut outbound = OutboundMessage::new(msg.role, msg.content.clone());
            outbound.attachments = msg.attachments.clone();
            messages.push(outbound);
        }
        drop(transcript);

        let options = params.unwrap_or(self.settings.default_params);
        CompletionRequest::new(model, messages).with_options(options)
    }
}

impl Drop for ConversationController {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            active.stop();
        }
    }
}
