//! Drip buffer for pacing streamed output
//!
//! Inference servers deliver text in lumpy bursts: nothing for a second, then
//! a dozen chunks at once. Appending those straight to the transcript makes
//! the text jump. The drip buffer queues incoming chunks and releases them on
//! a fixed tick, sizing each release to the backlog so the visible stream
//! stays smooth without falling behind the source.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Most chunks released in a single tick
const MAX_BATCH: usize = 25;

/// What the buffer wants done after a tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DripAction {
    /// Append this text to the transcript
    Flush(String),
    /// The source is done and the backlog is drained; finish the message
    Finalize,
}

/// Tick-paced release queue between a raw stream and the transcript
pub struct DripBuffer {
    pending: VecDeque<String>,
    ticker: Interval,
    source_done: bool,
    stopped: bool,
}

impl DripBuffer {
    pub fn new(tick: Duration) -> Self {
        let mut ticker = interval(tick);
        // A late tick releases one batch, not a burst of catch-up batches.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            pending: VecDeque::new(),
            ticker,
            source_done: false,
            stopped: false,
        }
    }

    /// Queue a chunk for release. Empty chunks and chunks arriving after the
    /// buffer stopped are dropped.
    pub fn enqueue(&mut self, text: impl Into<String>) {
        if self.stopped {
            return;
        }
        let text = text.into();
        if text.is_empty() {
            return;
        }
        self.pending.push_back(text);
    }

    /// Record that the source produced its last chunk. Queued text keeps
    /// draining at tick pace; [`DripAction::Finalize`] follows once the
    /// backlog is empty.
    pub fn mark_source_done(&mut self) {
        self.source_done = true;
    }

    pub fn chunk_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Release everything at once and stop ticking. Returns the drained text;
    /// calling again returns an empty string.
    pub fn flush_and_stop(&mut self) -> String {
        self.stopped = true;
        let mut text = String::new();
        while let Some(chunk) = self.pending.pop_front() {
            text.push_str(&chunk);
        }
        text
    }

    /// Wait for the next tick that produces an action. Pends forever once the
    /// buffer has stopped.
    pub async fn next_action(&mut self) -> DripAction {
        loop {
            if self.stopped {
                std::future::pending::<()>().await;
            }
            self.ticker.tick().await;
            if let Some(action) = self.on_tick() {
                return action;
            }
        }
    }

    /// One tick of the release schedule.
    fn on_tick(&mut self) -> Option<DripAction> {
        if self.stopped {
            return None;
        }
        let batch = batch_size(self.pending.len());
        if batch > 0 {
            let mut text = String::new();
            for _ in 0..batch {
                if let Some(chunk) = self.pending.pop_front() {
                    text.push_str(&chunk);
                }
            }
            return Some(DripAction::Flush(text));
        }
        if self.source_done {
            self.stopped = true;
            return Some(DripAction::Finalize);
        }
        None
    }
}

/// How many queued chunks one tick releases.
///
/// A small backlog goes out whole so short replies do not dribble. A moderate
/// backlog drains a few chunks per tick for a steady visible stream. A deep
/// backlog scales the batch with the queue so the display catches up instead
/// of lagging ever further behind a fast model.
fn batch_size(pending: usize) -> usize {
    match pending {
        0 => 0,
        n if n <= 4 => n,
        n if n < 100 => 3,
        n => n.div_ceil(15).min(MAX_BATCH),
    }
}
