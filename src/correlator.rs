//! Stream correlation over the shared signal bus
//!
//! All backends publish onto one broadcast channel, so a receiver sees
//! signals from every live stream interleaved. A [`StreamCorrelator`] holds
//! a single subscription, locks onto one stream id, and yields only that
//! stream's signals. Binding happens either up front, when the caller already
//! knows the id the backend returned, or lazily on the first `Started` signal
//! observed.

use crate::llm::{SignalBus, SignalKind, StreamSignal};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Filters one stream's signals out of the shared bus
pub struct StreamCorrelator {
    rx: Option<broadcast::Receiver<StreamSignal>>,
    bound: Option<String>,
}

impl StreamCorrelator {
    /// Subscribe to the bus. Signals published after this call are observed;
    /// earlier ones are not, so subscribe before starting the stream.
    pub fn subscribe(bus: &SignalBus) -> Self {
        Self {
            rx: Some(bus.subscribe()),
            bound: None,
        }
    }

    /// Lock onto a stream id. A second bind to a different id is ignored;
    /// the first binding wins.
    pub fn bind(&mut self, stream_id: impl Into<String>) {
        let stream_id = stream_id.into();
        match &self.bound {
            None => self.bound = Some(stream_id),
            Some(current) if *current != stream_id => {
                tracing::warn!(
                    bound = %current,
                    rejected = %stream_id,
                    "Correlator already bound; ignoring rebind"
                );
            }
            Some(_) => {}
        }
    }

    pub fn bound_id(&self) -> Option<&str> {
        self.bound.as_deref()
    }

    pub fn is_attached(&self) -> bool {
        self.rx.is_some()
    }

    /// Drop the bus subscription. Safe to call more than once; `recv` returns
    /// `None` from then on.
    pub fn detach(&mut self) {
        self.rx = None;
    }

    /// Next signal for the bound stream, or `None` once the bus closes or the
    /// correlator is detached.
    ///
    /// While unbound, the first `Started` seen binds its stream; everything
    /// else is foreign traffic and is skipped.
    pub async fn recv(&mut self) -> Option<SignalKind> {
        loop {
            let rx = self.rx.as_mut()?;
            match rx.recv().await {
                Ok(signal) => match &self.bound {
                    None => {
                        if matches!(signal.kind, SignalKind::Started) {
                            self.bound = Some(signal.stream_id);
                            return Some(SignalKind::Started);
                        }
                    }
                    Some(id) if *id == signal.stream_id => return Some(signal.kind),
                    Some(_) => {}
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Signal bus lagged; missed signals dropped");
                }
                Err(RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }
}
