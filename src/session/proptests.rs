//! Property-based tests for the session lifecycle
//!
//! These verify the invariants that matter for exactly-once persistence:
//! a session settles at most once, terminal phases absorb late events, and
//! streamed text is never duplicated or reordered by the transition layer.

use super::lifecycle::{
    advance, SessionEffect, SessionEvent, SessionOutcome, SessionPhase, TIMEOUT_MESSAGE,
};
use crate::llm::{StreamChunk, ToolCallStart};
use proptest::prelude::*;

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_text() -> impl Strategy<Value = Option<String>> {
    prop_oneof![Just(None), "[a-zA-Z ,.]{1,16}".prop_map(Some)]
}

fn arb_tool_call() -> impl Strategy<Value = Option<ToolCallStart>> {
    prop_oneof![
        3 => Just(None),
        1 => ("[a-z0-9]{6}", "[a-z_]{3,12}").prop_map(|(id, name)| {
            Some(ToolCallStart {
                id,
                name,
                arguments: serde_json::json!({}),
            })
        }),
    ]
}

fn arb_chunk() -> impl Strategy<Value = StreamChunk> {
    (arb_text(), arb_tool_call(), any::<bool>()).prop_map(|(text, tool_call, done)| StreamChunk {
        text,
        tool_call,
        done,
    })
}

fn arb_event() -> impl Strategy<Value = SessionEvent> {
    prop_oneof![
        Just(SessionEvent::StreamStarted),
        arb_chunk().prop_map(SessionEvent::Chunk),
        Just(SessionEvent::Completed),
        "[a-z ]{1,20}".prop_map(|message| SessionEvent::Errored { message }),
        Just(SessionEvent::CancelledByBackend),
        Just(SessionEvent::StopRequested),
        Just(SessionEvent::TimedOut),
        Just(SessionEvent::BufferDrained),
    ]
}

fn arb_live_phase() -> impl Strategy<Value = SessionPhase> {
    prop_oneof![
        Just(SessionPhase::Starting),
        Just(SessionPhase::Streaming),
        Just(SessionPhase::Finalizing),
    ]
}

fn arb_terminal_phase() -> impl Strategy<Value = SessionPhase> {
    prop_oneof![
        Just(SessionPhase::Done),
        Just(SessionPhase::Cancelled),
        Just(SessionPhase::Errored),
    ]
}

// ============================================================================
// Helpers
// ============================================================================

/// Drive a fresh session through a sequence of events, collecting every
/// effect in order.
fn run(events: Vec<SessionEvent>) -> (SessionPhase, Vec<SessionEffect>) {
    let mut phase = SessionPhase::Starting;
    let mut effects = Vec::new();
    for event in events {
        let step = advance(phase, event);
        phase = step.phase;
        effects.extend(step.effects);
    }
    (phase, effects)
}

fn finalize_count(effects: &[SessionEffect]) -> usize {
    effects
        .iter()
        .filter(|e| matches!(e, SessionEffect::Finalize(_)))
        .count()
}

// ============================================================================
// Invariants
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    // Invariant 1: a session settles at most once, no matter what the bus
    // throws at it
    #[test]
    fn prop_at_most_one_finalize(events in proptest::collection::vec(arb_event(), 0..30)) {
        let (_, effects) = run(events);
        prop_assert!(finalize_count(&effects) <= 1, "finalized twice: {effects:?}");
    }

    // Invariant 2: once terminal, the phase never changes and nothing runs
    #[test]
    fn prop_terminal_absorbs(
        phase in arb_terminal_phase(),
        events in proptest::collection::vec(arb_event(), 1..20)
    ) {
        let mut current = phase;
        for event in events {
            let step = advance(current, event);
            prop_assert_eq!(step.phase, phase, "terminal phase moved");
            prop_assert!(step.effects.is_empty(), "terminal phase acted: {:?}", step.effects);
            current = step.phase;
        }
    }

    // Invariant 3: a completed outcome requires the source to have finished
    // first; the drain alone can never complete a session
    #[test]
    fn prop_completed_only_after_source_done(events in proptest::collection::vec(arb_event(), 0..30)) {
        let (_, effects) = run(events);
        if let Some(done_pos) = effects
            .iter()
            .position(|e| matches!(e, SessionEffect::Finalize(SessionOutcome::Completed)))
        {
            let source_done_before = effects[..done_pos]
                .iter()
                .any(|e| matches!(e, SessionEffect::SourceDone));
            prop_assert!(source_done_before, "completed without source done: {effects:?}");
        }
    }

    // Invariant 4: chunk text flows into exactly one enqueue, in order, with
    // tool calls settled ahead of it
    #[test]
    fn prop_chunk_text_enqueued_once(text in "[a-zA-Z ]{1,24}") {
        let step = advance(SessionPhase::Streaming, SessionEvent::Chunk(StreamChunk::text(text.clone())));
        let enqueued: Vec<&String> = step
            .effects
            .iter()
            .filter_map(|e| match e {
                SessionEffect::EnqueueText(t) => Some(t),
                _ => None,
            })
            .collect();
        prop_assert_eq!(enqueued.len(), 1);
        prop_assert_eq!(enqueued[0], &text);
        prop_assert_eq!(&step.effects[0], &SessionEffect::FinishToolCalls);
    }

    // Invariant 5: stopping never produces a completed outcome unless the
    // source had already finished
    #[test]
    fn prop_stop_from_live_stream_cancels(phase in prop_oneof![
        Just(SessionPhase::Starting),
        Just(SessionPhase::Streaming),
    ]) {
        let step = advance(phase, SessionEvent::StopRequested);
        prop_assert_eq!(step.phase, SessionPhase::Cancelled);
        prop_assert_eq!(
            step.effects,
            vec![SessionEffect::Finalize(SessionOutcome::Cancelled)]
        );
    }

    // Invariant 6: the deadline always fails a live session with the fixed
    // timeout message
    #[test]
    fn prop_timeout_fails_live_phases(phase in arb_live_phase()) {
        let step = advance(phase, SessionEvent::TimedOut);
        prop_assert_eq!(step.phase, SessionPhase::Errored);
        prop_assert_eq!(
            step.effects,
            vec![SessionEffect::Finalize(SessionOutcome::Failed {
                message: TIMEOUT_MESSAGE.to_string()
            })]
        );
    }

    // Invariant 7: the flush shortcut only exists for a stop during drain
    #[test]
    fn prop_flush_now_only_when_stopping_a_drain(
        phase in prop_oneof![arb_live_phase(), arb_terminal_phase()],
        event in arb_event()
    ) {
        let stop_during_drain = phase == SessionPhase::Finalizing
            && matches!(event, SessionEvent::StopRequested);
        let step = advance(phase, event);
        let flushed = step.effects.iter().any(|e| matches!(e, SessionEffect::FlushNow));
        prop_assert_eq!(flushed, stop_during_drain);
    }
}

// ============================================================================
// Multi-step sequences
// ============================================================================

#[test]
fn test_stop_during_drain_completes_instead_of_cancelling() {
    let mut phase = SessionPhase::Starting;

    for event in [
        SessionEvent::StreamStarted,
        SessionEvent::Chunk(StreamChunk::text("the full answer")),
        SessionEvent::Completed,
    ] {
        phase = advance(phase, event).phase;
    }
    assert_eq!(phase, SessionPhase::Finalizing);

    // Stop arrives while draining: flush, keep draining
    let step = advance(phase, SessionEvent::StopRequested);
    assert_eq!(step.phase, SessionPhase::Finalizing);
    assert_eq!(step.effects, vec![SessionEffect::FlushNow]);

    // The drain then finishes as a normal completion
    let step = advance(step.phase, SessionEvent::BufferDrained);
    assert_eq!(step.phase, SessionPhase::Done);
    assert_eq!(
        step.effects,
        vec![SessionEffect::Finalize(SessionOutcome::Completed)]
    );
}

#[test]
fn test_late_error_cannot_unsettle_a_finished_stream() {
    let mut phase = SessionPhase::Starting;
    let mut effects = Vec::new();

    for event in [
        SessionEvent::StreamStarted,
        SessionEvent::Chunk(StreamChunk::text("hello")),
        SessionEvent::Completed,
        SessionEvent::Errored {
            message: "connection reset".to_string(),
        },
        SessionEvent::BufferDrained,
    ] {
        let step = advance(phase, event);
        phase = step.phase;
        effects.extend(step.effects);
    }

    assert_eq!(phase, SessionPhase::Done);
    assert_eq!(finalize_count(&effects), 1);
    assert!(effects.contains(&SessionEffect::Finalize(SessionOutcome::Completed)));
}

#[test]
fn test_double_stop_settles_once() {
    let step = advance(SessionPhase::Streaming, SessionEvent::StopRequested);
    assert_eq!(step.phase, SessionPhase::Cancelled);
    assert_eq!(finalize_count(&step.effects), 1);

    let step = advance(step.phase, SessionEvent::StopRequested);
    assert_eq!(step.phase, SessionPhase::Cancelled);
    assert!(step.effects.is_empty());
}

#[test]
fn test_cancel_then_late_completion_stays_cancelled() {
    let mut phase = SessionPhase::Starting;
    let mut effects = Vec::new();

    for event in [
        SessionEvent::StreamStarted,
        SessionEvent::Chunk(StreamChunk::text("partial")),
        SessionEvent::StopRequested,
        SessionEvent::Chunk(StreamChunk::text("late")),
        SessionEvent::Completed,
        SessionEvent::BufferDrained,
    ] {
        let step = advance(phase, event);
        phase = step.phase;
        effects.extend(step.effects);
    }

    assert_eq!(phase, SessionPhase::Cancelled);
    assert_eq!(finalize_count(&effects), 1);
    assert!(effects.contains(&SessionEffect::Finalize(SessionOutcome::Cancelled)));
}
