//! Cancellable generation sessions
//!
//! A session owns one assistant turn end to end: it starts the backend
//! stream, correlates its signals off the shared bus, paces text into the
//! transcript through the drip buffer, and settles exactly once with a
//! terminal outcome. Persistence happens only on a completed outcome; a
//! cancelled or failed turn keeps whatever text already streamed in memory
//! and never reaches the store.

mod lifecycle;
#[cfg(test)]
mod proptests;

pub use lifecycle::{
    advance, Advance, SessionEffect, SessionEvent, SessionOutcome, SessionPhase, TIMEOUT_MESSAGE,
};

use crate::correlator::StreamCorrelator;
use crate::drip::{DripAction, DripBuffer};
use crate::llm::{CompletionRequest, InferenceBackend, SignalBus, SignalKind, ToolCallStart};
use crate::storage::ChatStore;
use crate::transcript::{
    Message, SharedTranscript, ToolCallStatus, ToolInvocation, TranscriptEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Observable state of a spawned session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    Running,
    Finished(SessionOutcome),
}

/// Everything a session needs to run
pub struct SessionParams {
    pub conversation_id: String,
    /// Transcript message the session streams into
    pub message_id: String,
    pub transcript: SharedTranscript,
    pub updates: broadcast::Sender<TranscriptEvent>,
    pub store: Arc<dyn ChatStore>,
    pub backend: Arc<dyn InferenceBackend>,
    pub signals: SignalBus,
    pub request: CompletionRequest,
    pub drip_interval: Duration,
    pub timeout: Duration,
}

/// Caller's handle to a running session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub message_id: String,
    stop: CancellationToken,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    /// Ask the session to stop. Idempotent; late stops on a settled session
    /// do nothing.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// True once the session settled, or if its task is gone entirely.
    pub fn is_finished(&self) -> bool {
        matches!(*self.status.borrow(), SessionStatus::Finished(_))
            || self.status.has_changed().is_err()
    }
}

/// Start a generation session on the runtime.
///
/// The bus subscription is taken before the task is spawned, so a backend
/// that emits `Started` immediately cannot race the session into missing it.
pub fn spawn(params: SessionParams) -> SessionHandle {
    let stop = CancellationToken::new();
    let (status_tx, status_rx) = watch::channel(SessionStatus::Running);
    let correlator = StreamCorrelator::subscribe(&params.signals);

    let handle = SessionHandle {
        message_id: params.message_id.clone(),
        stop: stop.clone(),
        status: status_rx,
    };

    let driver = SessionDriver {
        conversation_id: params.conversation_id,
        message_id: params.message_id,
        transcript: params.transcript,
        updates: params.updates,
        store: params.store,
        backend: params.backend,
        correlator,
        drip: DripBuffer::new(params.drip_interval),
        phase: SessionPhase::Starting,
        stop,
        status: status_tx,
        timeout: params.timeout,
        finalized: false,
        persisted: false,
    };
    tokio::spawn(driver.run(params.request));

    handle
}

/// What woke the session loop up
enum Wake {
    Stop,
    Timeout,
    Signal(Option<SignalKind>),
    Drip(DripAction),
}

struct SessionDriver {
    conversation_id: String,
    message_id: String,
    transcript: SharedTranscript,
    updates: broadcast::Sender<TranscriptEvent>,
    store: Arc<dyn ChatStore>,
    backend: Arc<dyn InferenceBackend>,
    correlator: StreamCorrelator,
    drip: DripBuffer,
    phase: SessionPhase,
    stop: CancellationToken,
    status: watch::Sender<SessionStatus>,
    timeout: Duration,
    finalized: bool,
    persisted: bool,
}

impl SessionDriver {
    async fn run(mut self, request: CompletionRequest) {
        tracing::info!(
            conv_id = %self.conversation_id,
            message_id = %self.message_id,
            model = %request.model,
            "Generation session starting"
        );

        match self.backend.start_streaming(request).await {
            Ok(stream_id) => self.correlator.bind(stream_id),
            Err(e) => {
                self.apply(SessionEvent::Errored {
                    message: e.to_string(),
                })
                .await;
            }
        }

        let deadline = Instant::now() + self.timeout;
        let mut stop_seen = false;

        while !self.phase.is_terminal() {
            let wake = tokio::select! {
                biased;
                () = self.stop.cancelled(), if !stop_seen => Wake::Stop,
                () = sleep_until(deadline) => Wake::Timeout,
                signal = self.correlator.recv() => Wake::Signal(signal),
                action = self.drip.next_action() => Wake::Drip(action),
            };

            match wake {
                Wake::Stop => {
                    stop_seen = true;
                    self.apply(SessionEvent::StopRequested).await;
                }
                Wake::Timeout => self.apply(SessionEvent::TimedOut).await,
                Wake::Signal(signal) => {
                    let event = match signal {
                        Some(SignalKind::Started) => SessionEvent::StreamStarted,
                        Some(SignalKind::Chunk(chunk)) => SessionEvent::Chunk(chunk),
                        Some(SignalKind::Completed) => SessionEvent::Completed,
                        Some(SignalKind::Errored { message }) => SessionEvent::Errored { message },
                        Some(SignalKind::Cancelled) => SessionEvent::CancelledByBackend,
                        None => SessionEvent::Errored {
                            message: "signal bus closed".to_string(),
                        },
                    };
                    self.apply(event).await;
                }
                Wake::Drip(DripAction::Flush(text)) => self.append_text(&text),
                Wake::Drip(DripAction::Finalize) => {
                    self.apply(SessionEvent::BufferDrained).await;
                }
            }
        }
    }

    /// Run one event through the lifecycle, executing effects and feeding
    /// any follow-up events back in until none remain.
    async fn apply(&mut self, event: SessionEvent) {
        let mut pending = vec![event];
        while let Some(event) = pending.pop() {
            let step = lifecycle::advance(self.phase, event);
            if step.phase != self.phase {
                tracing::debug!(
                    conv_id = %self.conversation_id,
                    from = ?self.phase,
                    to = ?step.phase,
                    "Session phase change"
                );
            }
            self.phase = step.phase;
            for effect in step.effects {
                if let Some(follow_up) = self.execute_effect(effect).await {
                    pending.push(follow_up);
                }
            }
        }
    }

    async fn execute_effect(&mut self, effect: SessionEffect) -> Option<SessionEvent> {
        match effect {
            SessionEffect::EnqueueText(text) => {
                self.drip.enqueue(text);
                None
            }
            SessionEffect::SourceDone => {
                self.drip.mark_source_done();
                None
            }
            SessionEffect::FlushNow => {
                let text = self.drip.flush_and_stop();
                self.append_text(&text);
                Some(SessionEvent::BufferDrained)
            }
            SessionEffect::AttachToolCall(call) => {
                self.attach_tool_call(call);
                None
            }
            SessionEffect::FinishToolCalls => {
                self.finish_tool_calls();
                None
            }
            SessionEffect::Finalize(outcome) => {
                self.finalize(outcome).await;
                None
            }
        }
    }

    fn append_text(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let appended = {
            let mut transcript = self.transcript.lock().unwrap();
            transcript.append_content(&self.message_id, text)
        };
        if appended {
            let _ = self.updates.send(TranscriptEvent::MessageAppend {
                message_id: self.message_id.clone(),
                delta: text.to_string(),
            });
        } else {
            tracing::warn!(
                message_id = %self.message_id,
                "Streaming message vanished from transcript"
            );
        }
    }

    fn attach_tool_call(&self, call: ToolCallStart) {
        let invocation = ToolInvocation {
            id: call.id,
            name: call.name,
            arguments: call.arguments,
            status: ToolCallStatus::Calling,
        };
        let stored = {
            let mut transcript = self.transcript.lock().unwrap();
            match transcript.get_mut(&self.message_id) {
                Some(msg) => {
                    // Redelivered announcements are dropped by id
                    if msg.tool_calls.iter().any(|c| c.id == invocation.id) {
                        false
                    } else {
                        msg.tool_calls.push(invocation.clone());
                        true
                    }
                }
                None => false,
            }
        };
        if stored {
            let _ = self.updates.send(TranscriptEvent::ToolCallUpdate {
                message_id: self.message_id.clone(),
                call: invocation,
            });
        }
    }

    fn finish_tool_calls(&self) {
        let finished: Vec<ToolInvocation> = {
            let mut transcript = self.transcript.lock().unwrap();
            match transcript.get_mut(&self.message_id) {
                Some(msg) => msg
                    .tool_calls
                    .iter_mut()
                    .filter(|call| call.status == ToolCallStatus::Calling)
                    .map(|call| {
                        call.status = ToolCallStatus::Done;
                        call.clone()
                    })
                    .collect(),
                None => Vec::new(),
            }
        };
        for call in finished {
            let _ = self.updates.send(TranscriptEvent::ToolCallUpdate {
                message_id: self.message_id.clone(),
                call,
            });
        }
    }

    /// Settle the session. Runs at most once; the lifecycle guarantees a
    /// single `Finalize` effect, and the flag covers the driver against any
    /// direct caller.
    async fn finalize(&mut self, outcome: SessionOutcome) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        // Queued text belongs to the message under every outcome
        let tail = self.drip.flush_and_stop();
        self.append_text(&tail);

        let mut replaced: Option<String> = None;
        let snapshot: Option<Message> = {
            let mut transcript = self.transcript.lock().unwrap();
            match transcript.get_mut(&self.message_id) {
                Some(msg) => {
                    msg.streaming = false;
                    for call in &mut msg.tool_calls {
                        call.status = ToolCallStatus::Done;
                    }
                    if let SessionOutcome::Failed { message } = &outcome {
                        if msg.content.is_empty() {
                            msg.content = failure_marker(message);
                            replaced = Some(msg.content.clone());
                        }
                    }
                    Some(msg.clone())
                }
                None => None,
            }
        };

        if let Some(content) = replaced {
            let _ = self.updates.send(TranscriptEvent::MessageReplaced {
                message_id: self.message_id.clone(),
                content,
            });
        }

        if matches!(outcome, SessionOutcome::Completed) && !self.persisted {
            self.persisted = true;
            if let Some(msg) = &snapshot {
                if let Err(e) = self.store.append_message(&self.conversation_id, msg).await {
                    tracing::error!(
                        conv_id = %self.conversation_id,
                        message_id = %self.message_id,
                        error = %e,
                        "Failed to persist assistant message"
                    );
                }
            }
        } else if let Some(stream_id) = self.correlator.bound_id() {
            // The stream may still be producing; stop it server-side
            let backend = Arc::clone(&self.backend);
            let stream_id = stream_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = backend.cancel(&stream_id).await {
                    tracing::debug!(stream_id = %stream_id, error = %e, "Backend cancel failed");
                }
            });
        }

        self.correlator.detach();
        let _ = self.updates.send(TranscriptEvent::MessageFinalized {
            message_id: self.message_id.clone(),
            outcome: outcome.clone(),
        });

        tracing::info!(
            conv_id = %self.conversation_id,
            message_id = %self.message_id,
            outcome = ?outcome,
            "Generation session settled"
        );
        self.status.send_replace(SessionStatus::Finished(outcome));
    }
}

fn failure_marker(message: &str) -> String {
    format!("[generation failed: {message}]")
}
