//! Background knowledge: storage, retrieval and budget-aware selection

pub mod embedding;
pub mod lexical;
pub mod models;
pub mod selector;
pub mod store;

pub use embedding::{CacheStats, EmbeddingCache, EmbeddingConfig, EmbeddingError, EmbeddingProvider, HttpEmbeddingProvider};
pub use models::{chunk_document, content_hash, Document, DocumentKind, DocumentMetadata, KnowledgeCard, SearchMode, UpsertReport};
pub use selector::{
    select_scored, ConceptGroup, KnowledgeSelector, ScoredCandidate, Selection, SelectionMetrics, SelectorConfig,
};
pub use store::{cosine_similarity, KnowledgeConfig, KnowledgeError, KnowledgeStore};
