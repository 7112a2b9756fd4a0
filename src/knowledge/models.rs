//! Data models for the knowledge store

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::context::estimate_tokens;

/// Kind of knowledge a document carries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    #[default]
    Rule,
    Example,
}

/// Document metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub kind: DocumentKind,
    #[serde(default)]
    pub chunk_index: usize,
    #[serde(default = "default_chunk_total")]
    pub chunk_total: usize,
    #[serde(default)]
    pub token_cost: usize,
}

fn default_chunk_total() -> usize {
    1
}

impl DocumentMetadata {
    pub fn new(source: impl Into<String>, category: impl Into<String>, kind: DocumentKind) -> Self {
        Self {
            source: source.into(),
            category: category.into(),
            kind,
            chunk_index: 0,
            chunk_total: 1,
            token_cost: 0,
        }
    }
}

impl Default for DocumentMetadata {
    fn default() -> Self {
        Self::new("", "", DocumentKind::default())
    }
}

/// A unit of background knowledge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: DocumentMetadata,
}

impl Document {
    /// Create a document, filling in its token-cost estimate
    pub fn new(id: impl Into<String>, content: impl Into<String>, mut metadata: DocumentMetadata) -> Self {
        let content = content.into();
        metadata.token_cost = estimate_tokens(&content);
        Self {
            id: id.into(),
            content,
            embedding: None,
            metadata,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Embedding usable for similarity scoring (present and not all zeros)
    pub fn usable_embedding(&self) -> Option<&[f32]> {
        self.embedding
            .as_deref()
            .filter(|v| !v.is_empty() && v.iter().any(|x| *x != 0.0))
    }

    /// Project into a search hit
    pub fn to_card(&self, relevance_score: f32) -> KnowledgeCard {
        KnowledgeCard {
            id: self.id.clone(),
            content: self.content.clone(),
            source: self.metadata.source.clone(),
            category: self.metadata.category.clone(),
            relevance_score: relevance_score.clamp(0.0, 1.0),
        }
    }
}

/// Projection of a search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeCard {
    pub id: String,
    pub content: String,
    pub source: String,
    pub category: String,
    pub relevance_score: f32,
}

impl KnowledgeCard {
    pub fn token_cost(&self) -> usize {
        estimate_tokens(&self.content)
    }
}

/// How a search was answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Embedding,
    Lexical,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Embedding => "embedding",
            SearchMode::Lexical => "lexical",
        }
    }
}

/// Outcome of an upsert batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpsertReport {
    pub inserted: usize,
    pub replaced: usize,
    /// Ids rejected with the reason
    pub rejected: Vec<(String, String)>,
}

/// SHA-256 hex digest of text, used as a cache key
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Split long content into documents of at most `max_chunk_tokens`
///
/// Splits on blank lines first, then on sentence ends, then hard-wraps.
/// Single-chunk content keeps `id` unchanged; otherwise ids are `{id}#{index}`.
pub fn chunk_document(
    id: &str,
    content: &str,
    metadata: DocumentMetadata,
    max_chunk_tokens: usize,
) -> Vec<Document> {
    let max_chunk_tokens = max_chunk_tokens.max(1);
    let mut pieces: Vec<String> = Vec::new();
    let mut current = String::new();

    for segment in segments(content, max_chunk_tokens) {
        let candidate_len = if current.is_empty() {
            estimate_tokens(&segment)
        } else {
            estimate_tokens(&current) + 1 + estimate_tokens(&segment)
        };
        if !current.is_empty() && candidate_len > max_chunk_tokens {
            pieces.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&segment);
    }
    if !current.trim().is_empty() {
        pieces.push(current);
    }

    let total = pieces.len();
    pieces
        .into_iter()
        .enumerate()
        .map(|(index, text)| {
            let mut meta = metadata.clone();
            meta.chunk_index = index;
            meta.chunk_total = total;
            let chunk_id = if total == 1 { id.to_string() } else { format!("{id}#{index}") };
            Document::new(chunk_id, text, meta)
        })
        .collect()
}

fn segments(content: &str, max_chunk_tokens: usize) -> Vec<String> {
    let max_chars = max_chunk_tokens * crate::context::token_estimator::CHARS_PER_TOKEN;
    let mut out = Vec::new();

    for paragraph in content.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if estimate_tokens(paragraph) <= max_chunk_tokens {
            out.push(paragraph.to_string());
            continue;
        }
        for sentence in split_sentences(paragraph) {
            if estimate_tokens(&sentence) <= max_chunk_tokens {
                out.push(sentence);
                continue;
            }
            let chars: Vec<char> = sentence.chars().collect();
            out.extend(chars.chunks(max_chars).map(|c| c.iter().collect::<String>()));
        }
    }
    out
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_string());
            }
            current.clear();
        }
    }
    if !current.trim().is_empty() {
        sentences.push(current.trim().to_string());
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_records_token_cost() {
        let doc = Document::new("d1", "a".repeat(40), DocumentMetadata::default());
        assert_eq!(doc.metadata.token_cost, 10);
    }

    #[test]
    fn test_usable_embedding_ignores_zero_vectors() {
        let doc = Document::new("d1", "text", DocumentMetadata::default());
        assert!(doc.usable_embedding().is_none());
        assert!(doc.clone().with_embedding(vec![0.0, 0.0]).usable_embedding().is_none());
        assert!(doc.with_embedding(vec![0.0, 1.0]).usable_embedding().is_some());
    }

    #[test]
    fn test_card_clamps_relevance() {
        let doc = Document::new("d1", "text", DocumentMetadata::new("guide", "billing", DocumentKind::Rule));
        let card = doc.to_card(1.7);
        assert_eq!(card.relevance_score, 1.0);
        assert_eq!(card.category, "billing");
        assert_eq!(card.source, "guide");
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
        assert_eq!(content_hash("abc").len(), 64);
    }

    #[test]
    fn test_short_content_is_single_chunk() {
        let chunks = chunk_document("doc", "Short text.", DocumentMetadata::default(), 100);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].id, "doc");
        assert_eq!(chunks[0].metadata.chunk_total, 1);
    }

    #[test]
    fn test_long_content_is_chunked_within_limit() {
        let paragraph = "This sentence has some words in it. ".repeat(20);
        let content = format!("{paragraph}\n\n{paragraph}");
        let chunks = chunk_document("doc", &content, DocumentMetadata::default(), 50);

        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.id, format!("doc#{i}"));
            assert_eq!(chunk.metadata.chunk_index, i);
            assert_eq!(chunk.metadata.chunk_total, chunks.len());
            assert!(chunk.metadata.token_cost <= 50, "chunk {i} too large");
        }
    }
}
