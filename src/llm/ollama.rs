//! Ollama chat backend
//!
//! Streams `/api/chat` completions as newline-delimited JSON and republishes
//! them as [`StreamSignal`]s on the shared bus. Each stream gets a generated
//! id and a cancellation token; cancel drops the HTTP connection, which is
//! how Ollama learns to stop generating.

use super::ndjson::LineDecoder;
use super::{
    BackendError, CompletionRequest, InferenceBackend, ModelEntry, SignalBus, SignalKind,
    StreamChunk, StreamSignal, ToolCallStart,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Ollama streaming chat client
pub struct OllamaBackend {
    client: Client,
    base_url: String,
    signals: SignalBus,
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl OllamaBackend {
    /// Connect timeout only; generation itself has no client-side deadline,
    /// the session layer enforces its own.
    pub fn new(base_url: impl Into<String>, signals: SignalBus) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");
        let base_url = base_url.into();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            signals,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Streams currently registered with a cancellation token.
    pub fn active_streams(&self) -> usize {
        self.active.lock().unwrap().len()
    }
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    async fn start_streaming(&self, request: CompletionRequest) -> Result<String, BackendError> {
        let stream_id = Uuid::new_v4().to_string();
        let body = chat_body(&request);
        let token = CancellationToken::new();
        self.active
            .lock()
            .unwrap()
            .insert(stream_id.clone(), token.clone());

        tracing::info!(stream_id = %stream_id, model = %request.model, "Starting chat stream");

        let client = self.client.clone();
        let url = format!("{}/api/chat", self.base_url);
        let signals = self.signals.clone();
        let active = Arc::clone(&self.active);
        let id = stream_id.clone();
        tokio::spawn(async move {
            run_stream(&client, &url, &body, &id, &signals, &token).await;
            active.lock().unwrap().remove(&id);
        });

        Ok(stream_id)
    }

    async fn cancel(&self, stream_id: &str) -> Result<(), BackendError> {
        let token = self.active.lock().unwrap().get(stream_id).cloned();
        match token {
            Some(token) => {
                tracing::info!(stream_id = %stream_id, "Cancelling chat stream");
                token.cancel();
            }
            None => {
                tracing::debug!(stream_id = %stream_id, "Cancel for unknown stream ignored");
            }
        }
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<ModelEntry>, BackendError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| BackendError::unknown(format!("Failed to parse model list: {e}")))?;
        Ok(tags.models)
    }
}

/// Drive one chat stream to a terminal signal.
async fn run_stream(
    client: &Client,
    url: &str,
    body: &ChatRequest,
    stream_id: &str,
    signals: &SignalBus,
    cancel: &CancellationToken,
) {
    let emit = |kind: SignalKind| {
        let _ = signals.send(StreamSignal::new(stream_id, kind));
    };

    let response = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            emit(SignalKind::Cancelled);
            return;
        }
        result = client.post(url).json(body).send() => result,
    };

    let response = match response {
        Ok(r) => r,
        Err(e) => {
            emit(SignalKind::Errored {
                message: BackendError::from(e).to_string(),
            });
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        emit(SignalKind::Errored {
            message: classify_status(status, &text).to_string(),
        });
        return;
    }

    emit(SignalKind::Started);

    let mut stream = response.bytes_stream();
    let mut decoder = LineDecoder::new();
    let mut tool_seq = 0usize;

    loop {
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                emit(SignalKind::Cancelled);
                return;
            }
            item = stream.next() => item,
        };

        match item {
            Some(Ok(bytes)) => {
                for line in decoder.push(&bytes) {
                    match handle_line(&line, &mut tool_seq) {
                        LineOutcome::Chunks(chunks) => {
                            for chunk in chunks {
                                emit(SignalKind::Chunk(chunk));
                            }
                        }
                        LineOutcome::Fatal(message) => {
                            emit(SignalKind::Errored { message });
                            return;
                        }
                    }
                }
            }
            Some(Err(e)) => {
                emit(SignalKind::Errored {
                    message: BackendError::network(format!("Stream failed: {e}")).to_string(),
                });
                return;
            }
            None => break,
        }
    }

    if let Some(line) = decoder.finish() {
        match handle_line(&line, &mut tool_seq) {
            LineOutcome::Chunks(chunks) => {
                for chunk in chunks {
                    emit(SignalKind::Chunk(chunk));
                }
            }
            LineOutcome::Fatal(message) => {
                emit(SignalKind::Errored { message });
                return;
            }
        }
    }

    emit(SignalKind::Completed);
}

enum LineOutcome {
    Chunks(Vec<StreamChunk>),
    Fatal(String),
}

/// Translate one NDJSON line into stream chunks.
///
/// Unparseable lines are skipped rather than failing the stream; Ollama
/// occasionally interleaves non-chunk lines. Tool call ids are synthesized
/// per stream since the wire format does not carry any.
fn handle_line(line: &str, tool_seq: &mut usize) -> LineOutcome {
    let parsed: ChatChunk = match serde_json::from_str(line) {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!(error = %e, "Skipping unparseable stream line");
            return LineOutcome::Chunks(Vec::new());
        }
    };

    if let Some(message) = parsed.error {
        return LineOutcome::Fatal(message);
    }

    let mut chunks = Vec::new();
    if let Some(message) = parsed.message {
        for call in message.tool_calls {
            *tool_seq += 1;
            chunks.push(StreamChunk {
                text: None,
                tool_call: Some(ToolCallStart {
                    id: format!("call_{tool_seq}"),
                    name: call.function.name,
                    arguments: call.function.arguments,
                }),
                done: false,
            });
        }
        if !message.content.is_empty() {
            chunks.push(StreamChunk::text(message.content));
        }
    }

    if parsed.done {
        match chunks.last_mut() {
            Some(last) => last.done = true,
            None => chunks.push(StreamChunk::final_marker()),
        }
    }

    LineOutcome::Chunks(chunks)
}

fn classify_status(status: reqwest::StatusCode, body: &str) -> BackendError {
    // Ollama wraps failures as {"error": "..."}
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| {
            if body.is_empty() {
                status.to_string()
            } else {
                body.to_string()
            }
        });

    match status.as_u16() {
        401 | 403 => BackendError::auth(format!("Authentication failed: {message}")),
        404 | 400 => BackendError::invalid_request(message),
        429 => BackendError::rate_limit(format!("Rate limited: {message}")),
        500..=599 => BackendError::server_error(format!("Server error: {message}")),
        _ => BackendError::unknown(format!("HTTP {status}: {message}")),
    }
}

fn chat_body(request: &CompletionRequest) -> ChatRequest {
    let messages = request
        .messages
        .iter()
        .map(|m| ChatMessage {
            role: m.role.as_str().to_string(),
            content: m.content.clone(),
            images: m.attachments.iter().map(|a| a.data.clone()).collect(),
        })
        .collect();

    let options = if request.options.is_empty() {
        None
    } else {
        Some(ChatOptions {
            temperature: request.options.temperature,
            top_k: request.options.top_k,
            top_p: request.options.top_p,
            num_predict: request.options.max_tokens,
        })
    };

    ChatRequest {
        model: request.model.clone(),
        messages,
        stream: true,
        options,
    }
}

// Ollama API types

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<ChatOptions>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<ModelEntry>,
}
