//! Background conversation titles
//!
//! After a conversation's first completed assistant turn, a short display
//! title is generated from the opening user message. The job runs detached
//! from the generation session: it waits for the session to settle, asks a
//! small model over the same signal bus, and persists whatever survives
//! cleanup. Failures are silent; an untitled conversation just gets another
//! chance after its next completed turn.

use crate::config::TitleConfig;
use crate::correlator::StreamCorrelator;
use crate::llm::{
    CompletionRequest, GenerationOptions, InferenceBackend, OutboundMessage, ProviderRegistry,
    SignalBus, SignalKind,
};
use crate::session::{SessionOutcome, SessionStatus};
use crate::storage::ChatStore;
use crate::transcript::{Role, SharedTranscript, TranscriptEvent};
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep_until, Instant};

const TITLE_PROMPT: &str = r#"Generate a very short title (3-6 words) for a conversation that starts with the message below. Output only the title itself: no quotes, no trailing punctuation, no explanation.

Message:"#;

pub(crate) struct TitleJobParams {
    pub conversation_id: String,
    pub conversation_model: String,
    pub transcript: SharedTranscript,
    pub registry: Arc<ProviderRegistry>,
    pub store: Arc<dyn ChatStore>,
    pub signals: SignalBus,
    pub updates: broadcast::Sender<TranscriptEvent>,
    pub config: TitleConfig,
    /// Status of the generation session this job trails
    pub session_status: watch::Receiver<SessionStatus>,
    /// Set once a title has been persisted for this conversation
    pub title_done: Arc<AtomicBool>,
}

pub(crate) fn spawn_title_job(params: TitleJobParams) {
    tokio::spawn(run_title_job(params));
}

async fn run_title_job(params: TitleJobParams) {
    let TitleJobParams {
        conversation_id,
        conversation_model,
        transcript,
        registry,
        store,
        signals,
        updates,
        config,
        mut session_status,
        title_done,
    } = params;

    // Only a cleanly completed turn earns a title
    let completed = session_status
        .wait_for(|s| matches!(s, SessionStatus::Finished(_)))
        .await
        .is_ok_and(|settled| {
            matches!(&*settled, SessionStatus::Finished(SessionOutcome::Completed))
        });
    if !completed || title_done.load(Ordering::SeqCst) {
        return;
    }

    let opening = {
        let transcript = transcript.lock().unwrap();
        if transcript.len() > config.max_transcript_len {
            None
        } else {
            transcript
                .messages()
                .iter()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.clone())
        }
    };
    let Some(opening) = opening else { return };

    let model = registry.title_model(&conversation_model, &config);
    let backend = registry.resolve(&model);
    let excerpt = excerpt_of(&opening, config.max_excerpt);
    let request = title_request(&excerpt, &model);

    tracing::debug!(conv_id = %conversation_id, model = %model, "Generating conversation title");
    let Some(raw) = generate(&backend, &signals, request, config.timeout).await else {
        return;
    };

    let title = polish_title(&raw, config.max_length)
        .unwrap_or_else(|| fallback_title(&excerpt, config.max_length));
    if title.is_empty() {
        return;
    }

    match store.set_conversation_title(&conversation_id, &title).await {
        Ok(()) => {
            title_done.store(true, Ordering::SeqCst);
            tracing::info!(conv_id = %conversation_id, title = %title, "Conversation titled");
            let _ = updates.send(TranscriptEvent::TitleChanged { title });
        }
        Err(e) => {
            tracing::debug!(conv_id = %conversation_id, error = %e, "Failed to persist title");
        }
    }
}

/// Run one title stream to completion, within a deadline.
async fn generate(
    backend: &Arc<dyn InferenceBackend>,
    signals: &SignalBus,
    request: CompletionRequest,
    window: Duration,
) -> Option<String> {
    let mut correlator = StreamCorrelator::subscribe(signals);
    let stream_id = match backend.start_streaming(request).await {
        Ok(id) => id,
        Err(e) => {
            tracing::debug!(error = %e, "Title generation failed to start");
            return None;
        }
    };
    correlator.bind(stream_id.clone());

    let deadline = Instant::now() + window;
    let mut acc = String::new();
    loop {
        let signal = tokio::select! {
            () = sleep_until(deadline) => {
                tracing::debug!("Title generation timed out");
                let backend = Arc::clone(backend);
                tokio::spawn(async move {
                    let _ = backend.cancel(&stream_id).await;
                });
                return None;
            }
            signal = correlator.recv() => signal,
        };
        match signal {
            Some(SignalKind::Started) => {}
            Some(SignalKind::Chunk(chunk)) => {
                if let Some(text) = chunk.text {
                    acc.push_str(&text);
                }
            }
            Some(SignalKind::Completed) => return Some(acc),
            Some(SignalKind::Errored { message }) => {
                tracing::debug!(error = %message, "Title generation errored");
                return None;
            }
            Some(SignalKind::Cancelled) | None => return None,
        }
    }
}

fn title_request(excerpt: &str, model: &str) -> CompletionRequest {
    let prompt = format!("{TITLE_PROMPT}\n{excerpt}");
    CompletionRequest::new(model, vec![OutboundMessage::new(Role::User, prompt)]).with_options(
        GenerationOptions {
            // Titles are a few words; don't let a chatty model run on
            max_tokens: Some(50),
            ..GenerationOptions::default()
        },
    )
}

/// Clip the opening message for use inside the prompt.
fn excerpt_of(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}

/// Clean a raw model reply into a displayable title. Returns `None` when
/// nothing usable is left.
fn polish_title(raw: &str, max_length: usize) -> Option<String> {
    // Reasoning models narrate before answering; drop that markup wholesale
    static THINK_BLOCK: OnceLock<Regex> = OnceLock::new();
    let think = THINK_BLOCK
        .get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid literal pattern"));

    let stripped = think.replace_all(raw, "");
    let trimmed = stripped.trim().trim_matches(['"', '\'']).trim();
    let flat = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.is_empty() {
        return None;
    }
    Some(truncate_at_word(&flat, max_length))
}

/// First few words of the excerpt, when the model gave us nothing.
fn fallback_title(excerpt: &str, max_length: usize) -> String {
    let words: Vec<&str> = excerpt.split_whitespace().take(6).collect();
    truncate_at_word(&words.join(" "), max_length)
}

fn truncate_at_word(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut cut: String = s.chars().take(max_chars).collect();
    if let Some(pos) = cut.rfind(' ') {
        cut.truncate(pos);
    }
    cut.trim_end().to_string()
}
