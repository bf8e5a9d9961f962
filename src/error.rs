//! Engine-level error types

use crate::llm::BackendError;
use crate::storage::StoreError;
use thiserror::Error;

/// Errors surfaced by conversation controller operations.
///
/// Failures inside a running generation session never appear here; those
/// resolve to a terminal session outcome and are observable through the
/// transcript update stream instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no model selected for this conversation")]
    NoModelSelected,

    #[error("a generation is already active for this conversation")]
    GenerationAlreadyActive,

    #[error("message not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Storage(#[from] StoreError),
}
