//! OpenAI-compatible chat-completion backend

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

use super::backend::{GenerationBackend, GenerationError, GenerationRequest};
use crate::metrics::METRICS;

/// Configuration for one chat-completion endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<SecretString>,
    #[serde(default = "default_model")]
    pub model: String,
    /// Name reported as `model_used`; defaults to `model`
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_endpoint() -> String { "http://localhost:8080/v1/chat/completions".to_string() }
fn default_model() -> String { "gpt-4o-mini".to_string() }
fn default_timeout_ms() -> u64 { 30_000 }
fn default_max_tokens() -> usize { 512 }
fn default_temperature() -> f32 { 0.3 }

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: None,
            model: default_model(),
            label: None,
            timeout_ms: default_timeout_ms(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

impl BackendConfig {
    /// Override fields from `{prefix}_ENDPOINT`, `{prefix}_API_KEY`, `{prefix}_MODEL`,
    /// `{prefix}_LABEL` and `{prefix}_TIMEOUT_MS`
    pub fn from_env(mut self, prefix: &str) -> Self {
        if let Ok(val) = std::env::var(format!("{prefix}_ENDPOINT")) {
            self.endpoint = val;
        }

        if let Ok(val) = std::env::var(format!("{prefix}_API_KEY")) {
            self.api_key = Some(SecretString::new(val));
        }

        if let Ok(val) = std::env::var(format!("{prefix}_MODEL")) {
            self.model = val;
        }

        if let Ok(val) = std::env::var(format!("{prefix}_LABEL")) {
            self.label = Some(val);
        }

        if let Ok(val) = std::env::var(format!("{prefix}_TIMEOUT_MS")) {
            if let Ok(timeout) = val.parse() {
                self.timeout_ms = timeout;
            }
        }

        self
    }

    /// Label if set, otherwise the model name
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.model)
    }

    /// Get timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Backend speaking the `/v1/chat/completions` protocol
pub struct OpenAiCompatibleBackend {
    client: Client,
    config: BackendConfig,
}

impl OpenAiCompatibleBackend {
    /// Create a new backend
    pub fn new(config: BackendConfig) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| GenerationError::InvalidRequest(format!("client initialization: {e}")))?;

        Ok(Self { client, config })
    }

    fn build_messages(&self, request: &GenerationRequest) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(request.history.len() + 2);
        if !request.system.is_empty() {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: request.system.clone(),
            });
        }
        messages.extend(request.history.iter().map(|turn| ChatMessage {
            role: turn.role.as_str().to_string(),
            content: turn.content.clone(),
        }));
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: request.prompt.clone(),
        });
        messages
    }

    async fn call(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let body = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: self.build_messages(request),
            max_tokens: Some(request.max_tokens.unwrap_or(self.config.max_tokens)),
            temperature: Some(request.temperature.unwrap_or(self.config.temperature)),
        };

        let mut req = self.client.post(&self.config.endpoint).json(&body);
        if let Some(api_key) = &self.config.api_key {
            req = req.bearer_auth(api_key.expose_secret());
        }

        let response = req.send().await.map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GenerationError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::InvalidResponse(format!("Failed to parse response: {e}")))?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| GenerationError::InvalidResponse("No choices in response".to_string()))
    }
}

fn transport_error(err: reqwest::Error) -> GenerationError {
    if err.is_timeout() {
        GenerationError::Timeout(err.to_string())
    } else {
        GenerationError::Network(err.to_string())
    }
}

#[async_trait]
impl GenerationBackend for OpenAiCompatibleBackend {
    fn name(&self) -> &str {
        self.config.display_name()
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        debug!(
            model = %self.config.model,
            history_turns = request.history.len(),
            estimated_cost = request.estimated_cost(),
            "Sending chat completion"
        );

        let start = Instant::now();
        let result = self.call(request).await;
        METRICS.record_backend_request(&self.config.model, result.is_ok(), start.elapsed());
        result
    }
}

// OpenAI-compatible API types
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ConversationTurn;
    use mockito::Matcher;

    fn backend(server: &mockito::Server) -> OpenAiCompatibleBackend {
        OpenAiCompatibleBackend::new(BackendConfig {
            endpoint: format!("{}/v1/chat/completions", server.url()),
            api_key: Some(SecretString::new("sk-test".to_string())),
            model: "primary-model".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_backend_config_default() {
        let config = BackendConfig::default();
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.display_name(), "gpt-4o-mini");
    }

    #[test]
    fn test_label_overrides_reported_name() {
        let backend = OpenAiCompatibleBackend::new(BackendConfig {
            model: "gpt-4o-mini".to_string(),
            label: Some("backup-gpt-4o-mini".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(backend.name(), "backup-gpt-4o-mini");
    }

    #[tokio::test]
    async fn test_generate_sends_messages_and_parses_reply() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "model": "primary-model",
                "messages": [
                    {"role": "system", "content": "Be brief."},
                    {"role": "user", "content": "hi"},
                    {"role": "assistant", "content": "hello"},
                    {"role": "user", "content": "what now?"}
                ]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"Next steps."}}]}"#)
            .create_async()
            .await;

        let request = GenerationRequest::new("Be brief.", "what now?").with_history(vec![
            ConversationTurn::user("hi"),
            ConversationTurn::assistant("hello"),
        ]);
        let text = backend(&server).generate(&request).await.unwrap();

        assert_eq!(text, "Next steps.");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_success_status_is_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(503)
            .with_body("model overloaded")
            .create_async()
            .await;

        let err = backend(&server)
            .generate(&GenerationRequest::new("", "hi"))
            .await
            .unwrap_err();

        match err {
            GenerationError::Http { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "model overloaded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_choices_is_invalid_response() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[]}"#)
            .create_async()
            .await;

        let err = backend(&server)
            .generate(&GenerationRequest::new("", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_network_error() {
        let backend = OpenAiCompatibleBackend::new(BackendConfig {
            endpoint: "http://127.0.0.1:1/v1/chat/completions".to_string(),
            timeout_ms: 2_000,
            ..Default::default()
        })
        .unwrap();

        let err = backend.generate(&GenerationRequest::new("", "hi")).await.unwrap_err();
        assert!(matches!(err, GenerationError::Network(_) | GenerationError::Timeout(_)));
    }
}
