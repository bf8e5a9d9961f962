//! Test doubles shared across the crate's unit tests.
//!
//! [`MockBackend`] plays scripted signal sequences onto a real broadcast bus
//! so session and controller tests exercise the same correlation path as a
//! live backend. [`InMemoryStore`] stands in for sqlite and counts write
//! attempts so persistence guarantees can be asserted directly.

use crate::config::{EngineConfig, Settings};
use crate::engine::Engine;
use crate::llm::{
    BackendError, CompletionRequest, InferenceBackend, ModelEntry, ProviderRegistry, SignalBus,
    SignalKind, StreamChunk, StreamSignal,
};
use crate::session::{SessionOutcome, SessionStatus};
use crate::storage::{ChatStore, ConversationRecord, StoreError, StoreResult};
use crate::transcript::Message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

/// Install a compact tracing subscriber for a test run. Safe to call from
/// multiple tests; only the first call wins.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .compact()
        .try_init();
}

// ============================================================================
// Scripted backend
// ============================================================================

enum MockStream {
    /// Emit these signals in order, then go quiet
    Play(Vec<SignalKind>),
    /// Fail the start call itself
    FailStart(String),
    /// Emit `Started`, then nothing until `cancel` emits `Cancelled`
    Hang,
}

/// An [`InferenceBackend`] that replays scripted signal sequences.
///
/// Each `start_streaming` call consumes the next script in the queue, mints a
/// fresh stream id, and emits the scripted signals from a spawned task, which
/// is exactly the shape of the real Ollama backend.
pub struct MockBackend {
    signals: SignalBus,
    scripts: Mutex<VecDeque<MockStream>>,
    requests: Mutex<Vec<CompletionRequest>>,
    cancelled: Mutex<Vec<String>>,
    hanging: Mutex<Vec<String>>,
    models: Mutex<Vec<ModelEntry>>,
}

impl MockBackend {
    pub fn new() -> Self {
        let (signals, _) = broadcast::channel(256);
        Self {
            signals,
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            hanging: Mutex::new(Vec::new()),
            models: Mutex::new(Vec::new()),
        }
    }

    /// The bus this backend emits on.
    pub fn signals(&self) -> SignalBus {
        self.signals.clone()
    }

    /// Queue a signal sequence for the next `start_streaming` call.
    pub fn script(&self, signals: Vec<SignalKind>) {
        self.scripts
            .lock()
            .unwrap()
            .push_back(MockStream::Play(signals));
    }

    /// Make the next `start_streaming` call fail outright.
    pub fn script_start_error(&self, message: &str) {
        self.scripts
            .lock()
            .unwrap()
            .push_back(MockStream::FailStart(message.to_string()));
    }

    /// Make the next stream emit `Started` and then stall until cancelled.
    pub fn script_hang(&self) {
        self.scripts.lock().unwrap().push_back(MockStream::Hang);
    }

    /// What the backend advertises from `list_models`.
    pub fn set_models(&self, names: &[&str]) {
        *self.models.lock().unwrap() = names
            .iter()
            .map(|name| ModelEntry {
                name: (*name).to_string(),
                size: None,
                digest: None,
                modified_at: None,
            })
            .collect();
    }

    /// Every request passed to `start_streaming`, in call order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Stream ids `cancel` was called with.
    pub fn cancelled_ids(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    /// Streams currently stalled by a [`MockBackend::script_hang`] script.
    pub fn hanging_ids(&self) -> Vec<String> {
        self.hanging.lock().unwrap().clone()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    async fn start_streaming(&self, request: CompletionRequest) -> Result<String, BackendError> {
        self.requests.lock().unwrap().push(request);
        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            Some(MockStream::Play(signals)) => {
                let stream_id = Uuid::new_v4().to_string();
                let bus = self.signals.clone();
                let id = stream_id.clone();
                tokio::spawn(async move {
                    for kind in signals {
                        let _ = bus.send(StreamSignal::new(id.clone(), kind));
                    }
                });
                Ok(stream_id)
            }
            Some(MockStream::Hang) => {
                let stream_id = Uuid::new_v4().to_string();
                self.hanging.lock().unwrap().push(stream_id.clone());
                let _ = self
                    .signals
                    .send(StreamSignal::new(stream_id.clone(), SignalKind::Started));
                Ok(stream_id)
            }
            Some(MockStream::FailStart(message)) => Err(BackendError::network(message)),
            None => Err(BackendError::invalid_request("no scripted stream queued")),
        }
    }

    async fn cancel(&self, stream_id: &str) -> Result<(), BackendError> {
        self.cancelled.lock().unwrap().push(stream_id.to_string());
        let was_hanging = {
            let mut hanging = self.hanging.lock().unwrap();
            match hanging.iter().position(|id| id == stream_id) {
                Some(pos) => {
                    hanging.remove(pos);
                    true
                }
                None => false,
            }
        };
        if was_hanging {
            let _ = self
                .signals
                .send(StreamSignal::new(stream_id, SignalKind::Cancelled));
        }
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<ModelEntry>, BackendError> {
        Ok(self.models.lock().unwrap().clone())
    }
}

/// Started, one text chunk per part, then Completed.
pub fn text_signals(parts: &[&str]) -> Vec<SignalKind> {
    let mut signals = vec![SignalKind::Started];
    signals.extend(
        parts
            .iter()
            .map(|part| SignalKind::Chunk(StreamChunk::text(*part))),
    );
    signals.push(SignalKind::Completed);
    signals
}

// ============================================================================
// In-memory store
// ============================================================================

/// A [`ChatStore`] backed by hash maps, with write-attempt counting and
/// injectable write failures.
pub struct InMemoryStore {
    conversations: Mutex<HashMap<String, ConversationRecord>>,
    messages: Mutex<HashMap<String, Vec<Message>>>,
    append_attempts: AtomicUsize,
    fail_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            conversations: Mutex::new(HashMap::new()),
            messages: Mutex::new(HashMap::new()),
            append_attempts: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every write operation fail until turned off again.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// How many times `append_message` was called, failures included.
    pub fn append_attempts(&self) -> usize {
        self.append_attempts.load(Ordering::SeqCst)
    }

    pub fn messages_for(&self, conversation_id: &str) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<ConversationRecord> {
        self.conversations.lock().unwrap().get(conversation_id).cloned()
    }

    fn write_allowed(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Sqlite(rusqlite::Error::InvalidQuery));
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatStore for InMemoryStore {
    async fn create_conversation(
        &self,
        model: Option<&str>,
        system_instruction: Option<&str>,
    ) -> StoreResult<String> {
        self.write_allowed()?;
        let id = Uuid::new_v4().to_string();
        let record = ConversationRecord {
            id: id.clone(),
            title: None,
            model: model.map(str::to_string),
            system_instruction: system_instruction.map(str::to_string),
            created_at: Utc::now(),
        };
        self.conversations.lock().unwrap().insert(id.clone(), record);
        self.messages.lock().unwrap().insert(id.clone(), Vec::new());
        Ok(id)
    }

    async fn get_conversation(&self, conversation_id: &str) -> StoreResult<ConversationRecord> {
        self.conversations
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| StoreError::ConversationNotFound(conversation_id.to_string()))
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<Message>> {
        let all = self.messages.lock().unwrap();
        let msgs = all.get(conversation_id).cloned().unwrap_or_default();
        let skip = msgs.len().saturating_sub(limit);
        Ok(msgs.into_iter().skip(skip).collect())
    }

    async fn append_message(&self, conversation_id: &str, message: &Message) -> StoreResult<()> {
        self.append_attempts.fetch_add(1, Ordering::SeqCst);
        self.write_allowed()?;
        self.messages
            .lock()
            .unwrap()
            .entry(conversation_id.to_string())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn update_message(&self, message_id: &str, content: &str) -> StoreResult<()> {
        self.write_allowed()?;
        let mut all = self.messages.lock().unwrap();
        for msgs in all.values_mut() {
            if let Some(msg) = msgs.iter_mut().find(|m| m.id == message_id) {
                msg.content = content.to_string();
                return Ok(());
            }
        }
        Err(StoreError::MessageNotFound(message_id.to_string()))
    }

    async fn delete_messages_after(
        &self,
        conversation_id: &str,
        after: DateTime<Utc>,
    ) -> StoreResult<usize> {
        self.write_allowed()?;
        let mut all = self.messages.lock().unwrap();
        let msgs = all.entry(conversation_id.to_string()).or_default();
        let before = msgs.len();
        msgs.retain(|m| m.created_at <= after);
        Ok(before - msgs.len())
    }

    async fn set_conversation_title(&self, conversation_id: &str, title: &str) -> StoreResult<()> {
        self.write_allowed()?;
        match self.conversations.lock().unwrap().get_mut(conversation_id) {
            Some(record) => {
                record.title = Some(title.to_string());
                Ok(())
            }
            None => Err(StoreError::ConversationNotFound(conversation_id.to_string())),
        }
    }

    async fn set_conversation_model(&self, conversation_id: &str, model: &str) -> StoreResult<()> {
        self.write_allowed()?;
        match self.conversations.lock().unwrap().get_mut(conversation_id) {
            Some(record) => {
                record.model = Some(model.to_string());
                Ok(())
            }
            None => Err(StoreError::ConversationNotFound(conversation_id.to_string())),
        }
    }
}

// ============================================================================
// Engine harness
// ============================================================================

/// An [`Engine`] wired to a [`MockBackend`] and an [`InMemoryStore`], with
/// the mocks kept reachable for scripting and assertions.
pub struct TestEngine {
    pub engine: Engine,
    pub backend: Arc<MockBackend>,
    pub store: Arc<InMemoryStore>,
}

impl TestEngine {
    /// Harness with `test-model` as the default model and a 5ms drip tick.
    pub fn new() -> Self {
        Self::with_settings(Settings {
            default_model: Some("test-model".to_string()),
            ..Settings::default()
        })
    }

    pub fn with_settings(settings: Settings) -> Self {
        let backend = Arc::new(MockBackend::new());
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(ProviderRegistry::new(
            Arc::clone(&backend) as Arc<dyn InferenceBackend>
        ));
        let config = EngineConfig {
            drip_interval: Duration::from_millis(5),
            ..EngineConfig::default()
        };
        let engine = Engine::with_registry(
            Arc::clone(&store) as Arc<dyn ChatStore>,
            registry,
            backend.signals(),
            settings,
            config,
        );
        Self {
            engine,
            backend,
            store,
        }
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Await helpers
// ============================================================================

/// Wait until the session settles and return its outcome. Panics if the
/// status channel dies or nothing settles within the guard window.
pub async fn wait_for_finished(status: &mut watch::Receiver<SessionStatus>) -> SessionOutcome {
    let settled = tokio::time::timeout(
        Duration::from_secs(120),
        status.wait_for(|s| matches!(s, SessionStatus::Finished(_))),
    )
    .await
    .expect("session never settled")
    .expect("session task dropped its status channel");
    match &*settled {
        SessionStatus::Finished(outcome) => outcome.clone(),
        SessionStatus::Running => unreachable!(),
    }
}
