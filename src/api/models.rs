//! Request and response types for the HTTP API

use serde::{Deserialize, Serialize};

use crate::admission::AdmissionStats;
use crate::context::Budget;
use crate::generation::FallbackStats;
use crate::knowledge::{CacheStats, KnowledgeCard, SearchMode, SelectionMetrics};

/// POST /api/v1/chat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    pub message: String,
    /// Extra context supplied with the message (e.g. an uploaded document)
    #[serde(default)]
    pub auxiliary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub request_id: String,
    pub reply: String,
    pub model_used: String,
    pub was_fallback: bool,
    pub budget: Budget,
    pub selection: SelectionMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_mode: Option<SearchMode>,
}

/// POST /api/v1/knowledge/search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub cards: Vec<KnowledgeCard>,
    pub mode: SearchMode,
}

/// GET /api/v1/admission/stats
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionStatsResponse {
    pub primary: String,
    pub secondary: String,
    pub admission: AdmissionStats,
    pub fallback: FallbackStats,
    pub conversations: usize,
}

/// GET /health
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub documents: usize,
    pub embeddings_enabled: bool,
    pub embedding_cache: CacheStats,
}

/// API error details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Standard error codes
pub mod error_codes {
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const UPSTREAM_UNAVAILABLE: &str = "UPSTREAM_UNAVAILABLE";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}
