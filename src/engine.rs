//! Engine entry point
//!
//! The engine owns what every conversation shares: the chat store, the
//! provider registry, and the stream signal bus. Conversations are opened or
//! resumed from it as [`ConversationController`]s, each with its own update
//! channel and transcript.

use crate::config::{EngineConfig, Settings};
use crate::controller::ConversationController;
use crate::error::EngineError;
use crate::llm::{ModelEntry, OllamaBackend, ProviderRegistry, SignalBus};
use crate::storage::ChatStore;
use crate::transcript::Transcript;
use std::sync::Arc;
use tokio::sync::broadcast;

pub struct Engine {
    store: Arc<dyn ChatStore>,
    registry: Arc<ProviderRegistry>,
    signals: SignalBus,
    settings: Settings,
    config: EngineConfig,
}

impl Engine {
    /// Engine talking to the local inference server from `settings`.
    pub fn new(store: Arc<dyn ChatStore>, settings: Settings, config: EngineConfig) -> Self {
        let (signals, _) = broadcast::channel(config.bus_capacity);
        let backend = Arc::new(OllamaBackend::new(
            settings.server_url.clone(),
            signals.clone(),
        ));
        let mut registry = ProviderRegistry::new(backend);
        registry.set_local_only(settings.local_only);
        Self {
            store,
            registry: Arc::new(registry),
            signals,
            settings,
            config,
        }
    }

    /// Engine with a caller-built registry, for remote providers or tests.
    /// Every backend in the registry must publish onto `signals`.
    pub fn with_registry(
        store: Arc<dyn ChatStore>,
        registry: Arc<ProviderRegistry>,
        signals: SignalBus,
        settings: Settings,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            signals,
            settings,
            config,
        }
    }

    pub fn signals(&self) -> SignalBus {
        self.signals.clone()
    }

    pub fn registry(&self) -> Arc<ProviderRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Re-pull the local model catalog. Returns how many models it reported.
    pub async fn refresh_models(&self) -> Result<usize, EngineError> {
        Ok(self.registry.refresh_local_models().await?)
    }

    /// Models the local backend can serve right now.
    pub async fn list_models(&self) -> Result<Vec<ModelEntry>, EngineError> {
        Ok(self.registry.local_backend().list_models().await?)
    }

    /// A controller for a brand-new conversation. Nothing is stored until
    /// its first send.
    pub fn open_conversation(&self) -> ConversationController {
        ConversationController::open(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            self.signals.clone(),
            self.settings.clone(),
            self.config.clone(),
        )
    }

    /// Rehydrate a stored conversation into a controller.
    pub async fn resume_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<ConversationController, EngineError> {
        let record = self.store.get_conversation(conversation_id).await?;
        let messages = self
            .store
            .list_messages(conversation_id, self.config.history_limit)
            .await?;
        tracing::info!(
            conv_id = %record.id,
            messages = messages.len(),
            "Resuming conversation"
        );
        Ok(ConversationController::resume(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            self.signals.clone(),
            self.settings.clone(),
            self.config.clone(),
            record.id,
            Transcript::from_messages(messages),
            record.model,
            record.system_instruction,
            record.title.is_some(),
        ))
    }
}
