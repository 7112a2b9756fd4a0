//! Generation backend abstraction

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::{estimate_tokens, history_cost, ConversationTurn};

/// Generation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Generation temporarily unavailable (primary: {primary}; secondary: {secondary})")]
    Unavailable { primary: String, secondary: String },
}

/// Assembled prompt for a single generation call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// System header, including any selected knowledge
    pub system: String,
    /// Prior turns, oldest first
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
    /// Current user prompt, including any auxiliary context
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl GenerationRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_history(mut self, history: Vec<ConversationTurn>) -> Self {
        self.history = history;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Estimated input cost, used for admission
    pub fn estimated_cost(&self) -> usize {
        estimate_tokens(&self.system) + history_cost(&self.history) + estimate_tokens(&self.prompt)
    }
}

/// Text generation service
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Model or backend name reported to callers
    fn name(&self) -> &str;

    /// Produce a completion for `request`
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError>;
}
