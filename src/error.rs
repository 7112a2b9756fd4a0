//! Crate-level error type
//!
//! Each area keeps its own error enum; this type wraps them for callers that
//! drive the whole pipeline.

use thiserror::Error;

use crate::context::BudgetError;
use crate::generation::GenerationError;
use crate::knowledge::{EmbeddingError, KnowledgeError};

/// Top-level error for gateway operations
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Budget error: {0}")]
    Budget(#[from] BudgetError),

    #[error("Knowledge error: {0}")]
    Knowledge(#[from] KnowledgeError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ContextError {
    /// Whether the failure should be shown to the end user as a temporary outage
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ContextError::Generation(GenerationError::Unavailable { .. }))
    }
}

impl From<config::ConfigError> for ContextError {
    fn from(err: config::ConfigError) -> Self {
        ContextError::Configuration(err.to_string())
    }
}

/// Result alias using [`ContextError`]
pub type Result<T> = std::result::Result<T, ContextError>;
