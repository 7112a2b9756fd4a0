//! Context gateway
//!
//! Assembles budgeted prompts from retrieved knowledge and compacted
//! conversation history, then sends them through an admission-controlled
//! generation client that falls back to a secondary backend.

pub mod admission;
pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod generation;
pub mod knowledge;
pub mod metrics;
pub mod pipeline;

pub use admission::{AdmissionConfig, AdmissionExecutor, ErrorClass};
pub use config::Config;
pub use context::{Budget, BudgetAllocator, ConversationTurn, HistoryCompactor};
pub use error::{ContextError, Result};
pub use generation::{GenerationBackend, GenerationError, GenerationRequest, ResilientGenerationClient};
pub use knowledge::{KnowledgeSelector, KnowledgeStore};
pub use pipeline::{ChatPipeline, ChatReply, PipelineContext};
