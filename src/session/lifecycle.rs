//! Pure generation session lifecycle
//!
//! Given the current phase and one event, [`advance`] returns the next phase
//! and the effects to run. No I/O happens here; the driver in the parent
//! module executes effects and feeds any follow-up events back in. Keeping
//! the lifecycle pure makes the tricky orderings (stop during drain, error
//! after completion, duplicate terminal events) directly testable.

use crate::llm::{StreamChunk, ToolCallStart};
pub use crate::transcript::SessionOutcome;

/// Reported when a session dies to its wall-clock deadline
pub const TIMEOUT_MESSAGE: &str = "generation timed out";

/// Where a generation session is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Request sent, no output yet
    Starting,
    /// Output flowing into the drip buffer
    Streaming,
    /// Source finished; the drip buffer is draining
    Finalizing,
    Done,
    Cancelled,
    Errored,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Errored)
    }
}

/// Something the session must react to
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The backend accepted the request
    StreamStarted,
    /// A correlated chunk arrived
    Chunk(StreamChunk),
    /// The source stream ended cleanly
    Completed,
    /// The source stream failed
    Errored { message: String },
    /// The backend reported the stream cancelled
    CancelledByBackend,
    /// The user asked this session to stop
    StopRequested,
    /// The session outlived its deadline
    TimedOut,
    /// The drip buffer finished draining
    BufferDrained,
}

/// Work the driver performs in response to a transition
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEffect {
    /// Record a tool call on the streaming message, status calling
    AttachToolCall(ToolCallStart),
    /// Mark every calling tool call as done
    FinishToolCalls,
    /// Queue text in the drip buffer
    EnqueueText(String),
    /// Tell the drip buffer the source is finished
    SourceDone,
    /// Dump the drip buffer immediately instead of waiting out the ticks
    FlushNow,
    /// Settle the session exactly once with this outcome
    Finalize(SessionOutcome),
}

/// Result of advancing the lifecycle by one event
#[derive(Debug)]
pub struct Advance {
    pub phase: SessionPhase,
    pub effects: Vec<SessionEffect>,
}

impl Advance {
    fn to(phase: SessionPhase) -> Self {
        Self {
            phase,
            effects: vec![],
        }
    }

    fn with_effect(mut self, effect: SessionEffect) -> Self {
        self.effects.push(effect);
        self
    }
}

/// Advance the lifecycle by one event.
pub fn advance(phase: SessionPhase, event: SessionEvent) -> Advance {
    use SessionEvent as E;
    use SessionPhase as P;

    match (phase, event) {
        // Terminal phases absorb everything. Whatever finalized the session
        // already ran its effects; late signals, duplicate stops, and the
        // timeout all land here harmlessly. This arm must stay first so no
        // later pattern can fire twice for a settled session.
        (P::Done | P::Cancelled | P::Errored, _) => Advance::to(phase),

        // ============================================================
        // Stream startup
        // ============================================================
        (P::Starting, E::StreamStarted) => Advance::to(P::Streaming),
        // Duplicate start notifications carry no new information
        (P::Streaming, E::StreamStarted) => Advance::to(P::Streaming),

        // ============================================================
        // Output
        // ============================================================

        // A chunk before StreamStarted still means the stream is live
        (P::Starting | P::Streaming, E::Chunk(chunk)) => chunk_effects(chunk),

        (P::Starting | P::Streaming, E::Completed) => {
            Advance::to(P::Finalizing).with_effect(SessionEffect::SourceDone)
        }

        // ============================================================
        // Failure and cancellation
        // ============================================================
        (P::Starting | P::Streaming, E::Errored { message }) => {
            Advance::to(P::Errored)
                .with_effect(SessionEffect::Finalize(SessionOutcome::Failed { message }))
        }

        (P::Starting | P::Streaming, E::StopRequested | E::CancelledByBackend) => {
            Advance::to(P::Cancelled)
                .with_effect(SessionEffect::Finalize(SessionOutcome::Cancelled))
        }

        (_, E::TimedOut) => Advance::to(P::Errored).with_effect(SessionEffect::Finalize(
            SessionOutcome::Failed {
                message: TIMEOUT_MESSAGE.to_string(),
            },
        )),

        // ============================================================
        // Drain
        // ============================================================
        (P::Finalizing, E::BufferDrained) => {
            Advance::to(P::Done).with_effect(SessionEffect::Finalize(SessionOutcome::Completed))
        }

        // Stop while draining: the text is already fully generated, so dump
        // the backlog and let the drain complete as a normal finish
        (P::Finalizing, E::StopRequested) => {
            Advance::to(P::Finalizing).with_effect(SessionEffect::FlushNow)
        }

        // The source is already done; anything else it says changes nothing
        (
            P::Finalizing,
            E::StreamStarted | E::Chunk(_) | E::Completed | E::Errored { .. }
            | E::CancelledByBackend,
        ) => Advance::to(P::Finalizing),

        // Drip buffer cannot drain before the source is done
        (P::Starting | P::Streaming, E::BufferDrained) => Advance::to(phase),
    }
}

fn chunk_effects(chunk: StreamChunk) -> Advance {
    let next = if chunk.done {
        SessionPhase::Finalizing
    } else {
        SessionPhase::Streaming
    };
    let mut advance = Advance::to(next);

    if let Some(tool_call) = chunk.tool_call {
        advance = advance.with_effect(SessionEffect::AttachToolCall(tool_call));
    }
    if let Some(text) = chunk.text {
        if !text.is_empty() {
            // Text arriving after tool calls means those calls are settled
            advance = advance
                .with_effect(SessionEffect::FinishToolCalls)
                .with_effect(SessionEffect::EnqueueText(text));
        }
    }
    if chunk.done {
        advance = advance.with_effect(SessionEffect::SourceDone);
    }
    advance
}
