//! Service configuration
//!
//! Values come from, in increasing priority: built-in defaults, an optional
//! config file, `GATEWAY_*` environment variables (`__` separates nesting,
//! e.g. `GATEWAY_ADMISSION__MAX_RETRIES`), and a few well-known variables
//! applied by [`Config::from_env`].

use secrecy::SecretString;
use serde::Deserialize;

use crate::admission::AdmissionConfig;
use crate::context::BudgetConfig;
use crate::error::{ContextError, Result};
use crate::generation::BackendConfig;
use crate::knowledge::{EmbeddingConfig, KnowledgeConfig, SelectorConfig};

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub selector: SelectorConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    /// Without an embedding endpoint, search is lexical only
    #[serde(default)]
    pub embedding: Option<EmbeddingConfig>,
}

/// HTTP server settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8081 }
fn default_max_body_bytes() -> usize { 1024 * 1024 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Logging settings
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String { "info".to_string() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Conversation retention
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
}

fn default_max_turns() -> usize { 20 }

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
        }
    }
}

/// Primary and secondary generation backends
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    #[serde(default)]
    pub primary: BackendConfig,
    #[serde(default = "default_secondary")]
    pub secondary: BackendConfig,
}

fn default_secondary() -> BackendConfig {
    BackendConfig {
        model: "gpt-3.5-turbo".to_string(),
        ..Default::default()
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            primary: BackendConfig::default(),
            secondary: default_secondary(),
        }
    }
}

impl Config {
    /// Load from an optional file plus `GATEWAY_*` environment variables
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("GATEWAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        let config = config.from_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply well-known environment overrides
    pub fn from_env(mut self) -> Self {
        if let Ok(val) = std::env::var("HOST") {
            self.server.host = val;
        }

        if let Ok(val) = std::env::var("PORT") {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }

        if let Ok(val) = std::env::var("LOG_FORMAT") {
            self.logging.json = val.eq_ignore_ascii_case("json");
        }

        if let Ok(val) = std::env::var("KNOWLEDGE_SEED_PATH") {
            self.knowledge.seed_path = Some(val);
        }

        if let Ok(val) = std::env::var("EMBEDDING_ENDPOINT") {
            let embedding = self.embedding.get_or_insert_with(EmbeddingConfig::default);
            embedding.endpoint = val;
        }

        if let Ok(val) = std::env::var("EMBEDDING_API_KEY") {
            if let Some(embedding) = self.embedding.as_mut() {
                embedding.api_key = Some(SecretString::new(val));
            }
        }

        self.generation.primary = self.generation.primary.from_env("PRIMARY");
        self.generation.secondary = self.generation.secondary.from_env("SECONDARY");

        self
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<()> {
        self.budget.validate()?;

        if self.history.max_turns == 0 {
            return Err(ContextError::Configuration(
                "history.max_turns must be at least 1".to_string(),
            ));
        }

        for (name, backend) in [("primary", &self.generation.primary), ("secondary", &self.generation.secondary)] {
            if backend.endpoint.trim().is_empty() {
                return Err(ContextError::Configuration(format!(
                    "generation.{name}.endpoint must not be empty"
                )));
            }
        }

        if self.generation.primary.display_name() == self.generation.secondary.display_name() {
            return Err(ContextError::Configuration(format!(
                "generation.primary and generation.secondary both report as '{}'; set a label on one of them",
                self.generation.primary.display_name()
            )));
        }

        if self.admission.backoff_multiplier < 1.0 {
            return Err(ContextError::Configuration(
                "admission.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 8081);
        assert_eq!(config.budget.total_capacity, 2000);
        assert_eq!(config.history.max_turns, 20);
        assert_eq!(config.admission.session_requests_per_minute, 10);
        assert_eq!(config.generation.secondary.model, "gpt-3.5-turbo");
        assert!(config.embedding.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"admission": {"max_retries": 5}, "history": {"max_turns": 4}}"#,
        )
        .unwrap();

        assert_eq!(config.admission.max_retries, 5);
        assert_eq!(config.admission.global_requests_per_minute, 30);
        assert_eq!(config.history.max_turns, 4);
        assert_eq!(config.knowledge.similarity_threshold, 0.2);
    }

    #[test]
    fn test_validation_rejects_inconsistent_values() {
        let mut config = Config::default();
        config.budget.header_tokens = 5000;
        assert!(matches!(config.validate(), Err(ContextError::Budget(_))));

        let mut config = Config::default();
        config.history.max_turns = 0;
        assert!(matches!(config.validate(), Err(ContextError::Configuration(_))));

        let mut config = Config::default();
        config.generation.secondary.endpoint = " ".to_string();
        assert!(matches!(config.validate(), Err(ContextError::Configuration(_))));
    }

    #[test]
    fn test_backends_must_report_distinct_names() {
        let mut config = Config::default();
        config.generation.secondary.model = config.generation.primary.model.clone();
        assert!(matches!(config.validate(), Err(ContextError::Configuration(_))));

        config.generation.secondary.label = Some("secondary".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bind_address() {
        let server = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 9000,
            ..Default::default()
        };
        assert_eq!(server.bind_address(), "127.0.0.1:9000");
    }
}
