//! In-memory knowledge store with embedding search and lexical fallback

use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::embedding::{CacheStats, EmbeddingCache, EmbeddingProvider};
use super::lexical::lexical_score;
use super::models::{chunk_document, Document, KnowledgeCard, SearchMode, UpsertReport};
use crate::context::estimate_tokens;
use crate::metrics::METRICS;

/// Knowledge store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    /// Cosine similarity below which hits are dropped
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    #[serde(default = "default_max_chunk_tokens")]
    pub max_chunk_tokens: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub embedding_cache_ttl_secs: u64,
    #[serde(default = "default_cache_size")]
    pub embedding_cache_max_size: u64,
    /// Concurrent embedding calls during ingestion
    #[serde(default = "default_ingest_concurrency")]
    pub ingest_concurrency: usize,
    /// JSON file of documents loaded at startup
    #[serde(default)]
    pub seed_path: Option<String>,
}

fn default_similarity_threshold() -> f32 { 0.2 }
fn default_top_k() -> usize { 8 }
fn default_max_chunk_tokens() -> usize { 300 }
fn default_cache_ttl_secs() -> u64 { 3600 }
fn default_cache_size() -> u64 { 10_000 }
fn default_ingest_concurrency() -> usize { 4 }

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            default_top_k: default_top_k(),
            max_chunk_tokens: default_max_chunk_tokens(),
            embedding_cache_ttl_secs: default_cache_ttl_secs(),
            embedding_cache_max_size: default_cache_size(),
            ingest_concurrency: default_ingest_concurrency(),
            seed_path: None,
        }
    }
}

impl KnowledgeConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.embedding_cache_ttl_secs)
    }
}

/// Knowledge store errors
#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Seed load failed: {0}")]
    SeedLoad(String),
}

struct StoreState {
    documents: IndexMap<String, Document>,
    dimension: Option<usize>,
}

/// Knowledge store
pub struct KnowledgeStore {
    state: RwLock<StoreState>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    cache: EmbeddingCache,
    config: KnowledgeConfig,
}

impl KnowledgeStore {
    /// Create a store; without an embedder every search is lexical
    pub fn new(config: KnowledgeConfig, embedder: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        let cache = EmbeddingCache::new(config.cache_ttl(), config.embedding_cache_max_size);
        Self {
            state: RwLock::new(StoreState {
                documents: IndexMap::new(),
                dimension: None,
            }),
            embedder,
            cache,
            config,
        }
    }

    /// Insert or replace documents by id
    ///
    /// A replaced id keeps its original position. Documents whose embedding
    /// does not match the store dimension are rejected individually.
    pub fn upsert(&self, documents: Vec<Document>) -> Result<UpsertReport, KnowledgeError> {
        let mut state = self.state.write().map_err(|_| KnowledgeError::LockPoisoned)?;
        let mut report = UpsertReport::default();

        for mut doc in documents {
            if let Some(embedding) = doc.usable_embedding() {
                let actual = embedding.len();
                match state.dimension {
                    Some(expected) if expected != actual => {
                        let err = KnowledgeError::DimensionMismatch { expected, actual };
                        warn!(id = %doc.id, error = %err, "Rejecting document");
                        report.rejected.push((doc.id, err.to_string()));
                        continue;
                    }
                    Some(_) => {}
                    None => state.dimension = Some(actual),
                }
            }

            doc.metadata.token_cost = estimate_tokens(&doc.content);
            if state.documents.insert(doc.id.clone(), doc).is_some() {
                report.replaced += 1;
            } else {
                report.inserted += 1;
            }
        }

        debug!(
            inserted = report.inserted,
            replaced = report.replaced,
            rejected = report.rejected.len(),
            "Documents upserted"
        );
        Ok(report)
    }

    /// Embed documents lacking a vector, then upsert them
    ///
    /// Embedding failures leave the document searchable lexically only.
    pub async fn ingest(&self, documents: Vec<Document>) -> Result<UpsertReport, KnowledgeError> {
        let Some(embedder) = self.embedder.clone() else {
            return self.upsert(documents);
        };

        let concurrency = self.config.ingest_concurrency.max(1);
        let embedded: Vec<Document> = stream::iter(documents)
            .map(|mut doc| {
                let embedder = embedder.clone();
                async move {
                    if doc.usable_embedding().is_none() {
                        match embedder.embed(&doc.content).await {
                            Ok(vector) => doc.embedding = Some(vector),
                            Err(e) => warn!(id = %doc.id, error = %e, "Embedding failed during ingestion"),
                        }
                    }
                    doc
                }
            })
            .buffered(concurrency)
            .collect()
            .await;

        let report = self.upsert(embedded)?;
        info!(
            inserted = report.inserted,
            replaced = report.replaced,
            "Knowledge ingested"
        );
        Ok(report)
    }

    /// Load a JSON array of documents from disk and ingest them
    ///
    /// Documents without a vector are split into chunks of at most
    /// `max_chunk_tokens` first.
    pub async fn load_seed_file(&self, path: &str) -> Result<UpsertReport, KnowledgeError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| KnowledgeError::SeedLoad(format!("{path}: {e}")))?;
        let documents: Vec<Document> =
            serde_json::from_str(&raw).map_err(|e| KnowledgeError::SeedLoad(format!("{path}: {e}")))?;

        let max_chunk_tokens = self.config.max_chunk_tokens;
        let documents = documents
            .into_iter()
            .flat_map(|doc| {
                if doc.usable_embedding().is_some() {
                    vec![doc]
                } else {
                    chunk_document(&doc.id, &doc.content, doc.metadata, max_chunk_tokens)
                }
            })
            .collect();

        info!(path = %path, "Loading knowledge seed file");
        self.ingest(documents).await
    }

    /// Top-`k` cards for `query`, most relevant first
    ///
    /// Falls back to lexical scoring when no embedder is configured or the
    /// query cannot be embedded. Documents ingested without a vector are
    /// always scored lexically.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<KnowledgeCard>, KnowledgeError> {
        Ok(self.search_with_mode(query, k).await?.0)
    }

    /// Like [`search`](Self::search), also reporting which scorer answered
    pub async fn search_with_mode(
        &self,
        query: &str,
        k: usize,
    ) -> Result<(Vec<KnowledgeCard>, SearchMode), KnowledgeError> {
        if let Some(embedder) = &self.embedder {
            match self.cache.get_or_embed(query, embedder.as_ref()).await {
                Ok(query_vector) => {
                    let cards = self.semantic_search(query, &query_vector, k)?;
                    METRICS.record_search(SearchMode::Embedding, cards.len());
                    return Ok((cards, SearchMode::Embedding));
                }
                Err(e) => {
                    warn!(error = %e, "Query embedding failed, falling back to lexical search");
                }
            }
        }

        let cards = self.lexical_search(query, k)?;
        METRICS.record_search(SearchMode::Lexical, cards.len());
        Ok((cards, SearchMode::Lexical))
    }

    /// Cosine scoring for embedded documents; documents stored without a
    /// vector are scored lexically in the same pass
    fn semantic_search(
        &self,
        query: &str,
        query_vector: &[f32],
        k: usize,
    ) -> Result<Vec<KnowledgeCard>, KnowledgeError> {
        let state = self.state.read().map_err(|_| KnowledgeError::LockPoisoned)?;
        let threshold = self.config.similarity_threshold;

        let scored = state.documents.values().filter_map(|doc| match doc.usable_embedding() {
            Some(embedding) => {
                let score = cosine_similarity(query_vector, embedding)?;
                (score >= threshold).then_some((doc, score))
            }
            None => {
                let score = lexical_score(query, &doc.content, &doc.metadata.category);
                (score > 0.0).then_some((doc, score))
            }
        });

        Ok(top_k(scored, k))
    }

    fn lexical_search(&self, query: &str, k: usize) -> Result<Vec<KnowledgeCard>, KnowledgeError> {
        let state = self.state.read().map_err(|_| KnowledgeError::LockPoisoned)?;

        let scored = state.documents.values().filter_map(|doc| {
            let score = lexical_score(query, &doc.content, &doc.metadata.category);
            (score > 0.0).then_some((doc, score))
        });

        Ok(top_k(scored, k))
    }

    /// Look up a document by id
    pub fn get(&self, id: &str) -> Option<Document> {
        self.state.read().ok()?.documents.get(id).cloned()
    }

    /// Remove every document and forget the embedding dimension
    pub fn reset(&self) -> Result<(), KnowledgeError> {
        let mut state = self.state.write().map_err(|_| KnowledgeError::LockPoisoned)?;
        state.documents.clear();
        state.dimension = None;
        self.cache.clear();
        info!("Knowledge store reset");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.documents.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Embedding dimension fixed by the first accepted embedding
    pub fn dimension(&self) -> Option<usize> {
        self.state.read().ok()?.dimension
    }

    pub fn has_embedder(&self) -> bool {
        self.embedder.is_some()
    }

    /// Get embedding cache statistics
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn config(&self) -> &KnowledgeConfig {
        &self.config
    }
}

/// Stable descending sort, so equal scores keep insertion order
fn top_k<'a>(scored: impl Iterator<Item = (&'a Document, f32)>, k: usize) -> Vec<KnowledgeCard> {
    let mut scored: Vec<(&Document, f32)> = scored.collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored
        .into_iter()
        .take(k)
        .map(|(doc, score)| doc.to_card(score))
        .collect()
}

/// Cosine similarity, `None` for mismatched or zero-length vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= f64::EPSILON {
        return None;
    }
    Some((dot / denom) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::embedding::EmbeddingError;
    use crate::knowledge::models::{DocumentKind, DocumentMetadata};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StaticEmbedder;

    #[async_trait]
    impl EmbeddingProvider for StaticEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Ok(if text.contains("refund") { vec![1.0, 0.0] } else { vec![0.0, 1.0] })
        }
    }

    struct DownEmbedder;

    #[async_trait]
    impl EmbeddingProvider for DownEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Err(EmbeddingError::RequestFailed("timed out".to_string()))
        }
    }

    /// Fails until switched on
    struct RecoveringEmbedder {
        up: AtomicBool,
    }

    #[async_trait]
    impl EmbeddingProvider for RecoveringEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            if !self.up.load(Ordering::SeqCst) {
                return Err(EmbeddingError::RequestFailed("connection refused".to_string()));
            }
            Ok(if text.contains("refund") { vec![1.0, 0.0] } else { vec![0.0, 1.0] })
        }
    }

    fn doc(id: &str, content: &str, category: &str) -> Document {
        Document::new(id, content, DocumentMetadata::new("handbook", category, DocumentKind::Rule))
    }

    #[test]
    fn test_upsert_is_idempotent_and_keeps_position() {
        let store = KnowledgeStore::new(KnowledgeConfig::default(), None);
        let report = store.upsert(vec![doc("a", "alpha", "x"), doc("b", "beta", "y")]).unwrap();
        assert_eq!(report.inserted, 2);

        let report = store.upsert(vec![doc("a", "alpha revised", "x")]).unwrap();
        assert_eq!(report.replaced, 1);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("a").unwrap().content, "alpha revised");
    }

    #[test]
    fn test_upsert_rejects_dimension_mismatch() {
        let store = KnowledgeStore::new(KnowledgeConfig::default(), None);
        let report = store
            .upsert(vec![
                doc("a", "alpha", "x").with_embedding(vec![1.0, 0.0]),
                doc("b", "beta", "x").with_embedding(vec![1.0, 0.0, 0.0]),
            ])
            .unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].0, "b");
        assert_eq!(store.dimension(), Some(2));
    }

    #[tokio::test]
    async fn test_lexical_search_without_embedder() {
        let store = KnowledgeStore::new(KnowledgeConfig::default(), None);
        store
            .upsert(vec![
                doc("a", "Shipping takes five days", "shipping"),
                doc("b", "Our refund policy allows returns within 30 days", "billing"),
                doc("c", "Refund requests need a receipt", "billing"),
            ])
            .unwrap();

        let (cards, mode) = store.search_with_mode("refund policy", 5).await.unwrap();
        assert_eq!(mode, SearchMode::Lexical);
        assert_eq!(cards.len(), 2);
        assert_eq!(cards[0].id, "b");
        assert_eq!(cards[1].id, "c");
    }

    #[tokio::test]
    async fn test_ties_break_by_insertion_order() {
        let store = KnowledgeStore::new(KnowledgeConfig::default(), None);
        store
            .upsert(vec![
                doc("first", "printer setup guide", "devices"),
                doc("second", "printer setup checklist", "devices"),
                doc("third", "printer setup notes", "devices"),
            ])
            .unwrap();

        let ids: Vec<String> = store
            .search("printer", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_embedding_search_filters_by_threshold() {
        let store = KnowledgeStore::new(KnowledgeConfig::default(), Some(Arc::new(StaticEmbedder)));
        store
            .ingest(vec![
                doc("refunds", "refund rules", "billing"),
                doc("shipping", "shipping rules", "logistics"),
            ])
            .await
            .unwrap();

        let (cards, mode) = store.search_with_mode("how do refunds work", 5).await.unwrap();
        assert_eq!(mode, SearchMode::Embedding);
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].id, "refunds");
        assert!((cards[0].relevance_score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_embedding_failure_falls_back_to_lexical() {
        let store = KnowledgeStore::new(KnowledgeConfig::default(), Some(Arc::new(DownEmbedder)));
        store
            .ingest(vec![doc("a", "Refund policy details", "billing")])
            .await
            .unwrap();

        let (cards, mode) = store.search_with_mode("refund policy", 5).await.unwrap();
        assert_eq!(mode, SearchMode::Lexical);
        assert_eq!(cards.len(), 1);
        assert!(store.get("a").unwrap().embedding.is_none());
    }

    #[tokio::test]
    async fn test_unembedded_documents_found_once_embedder_recovers() {
        let embedder = Arc::new(RecoveringEmbedder { up: AtomicBool::new(false) });
        let provider: Arc<dyn EmbeddingProvider> = embedder.clone();
        let store = KnowledgeStore::new(KnowledgeConfig::default(), Some(provider));
        store
            .ingest(vec![doc("policy", "Our refund policy allows returns", "billing")])
            .await
            .unwrap();
        assert!(store.get("policy").unwrap().embedding.is_none());

        embedder.up.store(true, Ordering::SeqCst);
        store
            .ingest(vec![doc("shipping", "shipping rules", "logistics")])
            .await
            .unwrap();

        let (cards, mode) = store.search_with_mode("refund policy", 5).await.unwrap();
        assert_eq!(mode, SearchMode::Embedding);
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].id, "policy");
    }

    #[tokio::test]
    async fn test_embedding_ties_break_by_insertion_order() {
        let store = KnowledgeStore::new(KnowledgeConfig::default(), Some(Arc::new(StaticEmbedder)));
        store
            .upsert(vec![
                doc("second-added-first", "refund window", "billing").with_embedding(vec![1.0, 0.0]),
                doc("first-added-second", "refund receipt", "billing").with_embedding(vec![1.0, 0.0]),
                doc("unrelated", "shipping rules", "logistics").with_embedding(vec![0.0, 1.0]),
            ])
            .unwrap();

        let (cards, mode) = store.search_with_mode("refund", 5).await.unwrap();
        assert_eq!(mode, SearchMode::Embedding);
        let ids: Vec<&str> = cards.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["second-added-first", "first-added-second"]);
    }

    #[tokio::test]
    async fn test_search_respects_k() {
        let store = KnowledgeStore::new(KnowledgeConfig::default(), None);
        store
            .upsert((0..10).map(|i| doc(&format!("d{i}"), "password reset steps", "account")).collect())
            .unwrap();
        assert_eq!(store.search("password", 3).await.unwrap().len(), 3);
    }

    #[test]
    fn test_reset_clears_documents() {
        let store = KnowledgeStore::new(KnowledgeConfig::default(), None);
        store.upsert(vec![doc("a", "alpha", "x").with_embedding(vec![1.0])]).unwrap();
        store.reset().unwrap();
        assert!(store.is_empty());
        assert_eq!(store.dimension(), None);
    }

    #[tokio::test]
    async fn test_seed_file_is_chunked_and_loaded() {
        let long = "Refunds are issued to the original payment method. ".repeat(40);
        let seed = serde_json::json!([
            {"id": "refunds", "content": long, "metadata": {"source": "handbook", "category": "billing"}},
            {"id": "hours", "content": "Support is open nine to five.", "metadata": {"category": "support"}}
        ]);
        let path = std::env::temp_dir().join(format!("seed-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, seed.to_string()).unwrap();

        let store = KnowledgeStore::new(KnowledgeConfig { max_chunk_tokens: 100, ..Default::default() }, None);
        let report = store.load_seed_file(path.to_str().unwrap()).await.unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(report.inserted > 2);
        assert!(store.get("hours").is_some());
        assert!(store.get("refunds#0").is_some());
        assert_eq!(store.get("refunds#0").unwrap().metadata.category, "billing");
    }

    #[tokio::test]
    async fn test_missing_seed_file_is_an_error() {
        let store = KnowledgeStore::new(KnowledgeConfig::default(), None);
        let err = store.load_seed_file("/nonexistent/seed.json").await.unwrap_err();
        assert!(matches!(err, KnowledgeError::SeedLoad(_)));
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]).unwrap() - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).unwrap().abs() < 1e-6);
        assert!(cosine_similarity(&[1.0], &[1.0, 0.0]).is_none());
        assert!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]).is_none());
    }
}
