//! Embedding provider and query-embedding cache

use async_trait::async_trait;
use moka::future::Cache;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::models::content_hash;
use crate::metrics::METRICS;

/// Embedding errors
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Initialization error: {0}")]
    InitializationError(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Upstream error: status {status}: {message}")]
    UpstreamError { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Text to fixed-length vector
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Configuration for the HTTP embedding provider
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<SecretString>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_endpoint() -> String { "http://localhost:8080/v1/embeddings".to_string() }
fn default_model() -> String { "text-embedding-3-small".to_string() }
fn default_timeout_ms() -> u64 { 10_000 }

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: None,
            model: default_model(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl EmbeddingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// OpenAI-compatible `/v1/embeddings` client
pub struct HttpEmbeddingProvider {
    client: Client,
    config: EmbeddingConfig,
}

impl HttpEmbeddingProvider {
    pub fn new(config: EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| EmbeddingError::InitializationError(e.to_string()))?;
        Ok(Self { client, config })
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let request = EmbeddingRequest {
            model: &self.config.model,
            input: text,
        };

        let mut req = self.client.post(&self.config.endpoint).json(&request);
        if let Some(api_key) = &self.config.api_key {
            req = req.bearer_auth(api_key.expose_secret());
        }

        let response = req
            .send()
            .await
            .map_err(|e| EmbeddingError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(EmbeddingError::UpstreamError {
                status: status.as_u16(),
                message,
            });
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;

        body.data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| EmbeddingError::InvalidResponse("No embedding in response".to_string()))
    }
}

/// Query-embedding cache keyed by content hash
pub struct EmbeddingCache {
    entries: Cache<String, Arc<Vec<f32>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    /// Create a new cache with TTL and max size
    pub fn new(ttl: Duration, max_size: u64) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(max_size)
                .time_to_live(ttl)
                .build(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Return the cached embedding for `text`, computing it on a miss
    ///
    /// Failed computations are not cached.
    pub async fn get_or_embed(
        &self,
        text: &str,
        provider: &dyn EmbeddingProvider,
    ) -> Result<Arc<Vec<f32>>, EmbeddingError> {
        let key = content_hash(text);
        if let Some(hit) = self.entries.get(&key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            METRICS.record_embedding_cache(true);
            return Ok(hit);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        METRICS.record_embedding_cache(false);
        debug!(key = %&key[..12], "Embedding cache miss");

        let vector = Arc::new(provider.embed(text).await?);
        self.entries.insert(key, vector.clone()).await;
        Ok(vector)
    }

    /// Drop every cached vector
    pub fn clear(&self) {
        self.entries.invalidate_all();
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.entry_count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl EmbeddingProvider for FailingProvider {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Err(EmbeddingError::RequestFailed("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_cache_avoids_recomputation() {
        let cache = EmbeddingCache::new(Duration::from_secs(60), 100);
        let provider = CountingProvider { calls: AtomicUsize::new(0) };

        let first = cache.get_or_embed("hello", &provider).await.unwrap();
        let second = cache.get_or_embed("hello", &provider).await.unwrap();
        cache.get_or_embed("other", &provider).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = EmbeddingCache::new(Duration::from_secs(60), 100);
        assert!(cache.get_or_embed("hello", &FailingProvider).await.is_err());

        let provider = CountingProvider { calls: AtomicUsize::new(0) };
        assert!(cache.get_or_embed("hello", &provider).await.is_ok());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_http_provider_parses_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/embeddings")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":[{"embedding":[0.1,0.2,0.3]}]}"#)
            .create_async()
            .await;

        let provider = HttpEmbeddingProvider::new(EmbeddingConfig {
            endpoint: format!("{}/v1/embeddings", server.url()),
            ..Default::default()
        })
        .unwrap();

        let vector = provider.embed("hello").await.unwrap();
        assert_eq!(vector, vec![0.1, 0.2, 0.3]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_provider_surfaces_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/embeddings")
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;

        let provider = HttpEmbeddingProvider::new(EmbeddingConfig {
            endpoint: format!("{}/v1/embeddings", server.url()),
            ..Default::default()
        })
        .unwrap();

        let err = provider.embed("hello").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::UpstreamError { status: 503, .. }));
    }
}
