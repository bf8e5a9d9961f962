//! Inference backend abstraction
//!
//! Backends stream generation output as [`StreamSignal`]s onto a shared
//! broadcast bus instead of returning a response object. Callers subscribe to
//! the bus, start a stream, and correlate signals by the stream id the
//! backend handed back.

mod error;
mod ndjson;
mod ollama;
mod registry;
mod types;

pub use error::{BackendError, BackendErrorKind};
pub use ndjson::LineDecoder;
pub use ollama::OllamaBackend;
pub use registry::{ProviderRegistry, LOCAL_PROVIDER};
pub use types::*;

use async_trait::async_trait;

/// Common interface for streaming inference backends
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Kick off a streaming completion. Returns the stream id that all
    /// signals for this request will carry on the bus.
    async fn start_streaming(&self, request: CompletionRequest) -> Result<String, BackendError>;

    /// Ask the backend to stop a running stream. Unknown ids are ignored.
    async fn cancel(&self, stream_id: &str) -> Result<(), BackendError>;

    /// List models the backend can serve
    async fn list_models(&self) -> Result<Vec<ModelEntry>, BackendError>;
}
