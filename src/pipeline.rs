//! Chat pipeline
//!
//! One message flows through:
//! 1. budget allocation
//! 2. knowledge search (failures degrade to no knowledge)
//! 3. diversity-aware selection within the knowledge budget
//! 4. history compaction within the history budget
//! 5. prompt assembly
//! 6. admission-controlled generation with fallback
//! 7. turn recording, only after a successful reply

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::admission::AdmissionExecutor;
use crate::config::Config;
use crate::context::token_estimator::CHARS_PER_TOKEN;
use crate::context::{Budget, BudgetAllocator, ConversationLog, ConversationTurn, HistoryCompactor};
use crate::error::{ContextError, Result};
use crate::generation::{GenerationBackend, GenerationRequest, OpenAiCompatibleBackend, ResilientGenerationClient};
use crate::knowledge::{
    EmbeddingProvider, HttpEmbeddingProvider, KnowledgeCard, KnowledgeSelector, KnowledgeStore, SearchMode,
    SelectionMetrics,
};

const DEFAULT_HEADER: &str = "You are a helpful assistant. Answer using the provided knowledge when it is relevant. \
If the knowledge does not cover the question, say so briefly.";

/// Process-wide state shared by every request
pub struct PipelineContext {
    pub allocator: BudgetAllocator,
    pub store: Arc<KnowledgeStore>,
    pub selector: KnowledgeSelector,
    pub compactor: HistoryCompactor,
    pub conversations: ConversationLog,
    pub generator: ResilientGenerationClient,
    header: String,
}

impl PipelineContext {
    pub fn new(
        allocator: BudgetAllocator,
        store: Arc<KnowledgeStore>,
        selector: KnowledgeSelector,
        conversations: ConversationLog,
        generator: ResilientGenerationClient,
    ) -> Self {
        Self {
            allocator,
            store,
            selector,
            compactor: HistoryCompactor,
            conversations,
            generator,
            header: DEFAULT_HEADER.to_string(),
        }
    }

    /// Build every component from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let allocator = BudgetAllocator::new(config.budget.clone())?;

        let embedder: Option<Arc<dyn EmbeddingProvider>> = match &config.embedding {
            Some(embedding) => Some(Arc::new(HttpEmbeddingProvider::new(embedding.clone())?)),
            None => None,
        };
        let store = Arc::new(KnowledgeStore::new(config.knowledge.clone(), embedder));

        let primary: Arc<dyn GenerationBackend> =
            Arc::new(OpenAiCompatibleBackend::new(config.generation.primary.clone())?);
        let secondary: Arc<dyn GenerationBackend> =
            Arc::new(OpenAiCompatibleBackend::new(config.generation.secondary.clone())?);
        let executor = Arc::new(AdmissionExecutor::new(config.admission.clone()));
        let generator = ResilientGenerationClient::new(primary, secondary, executor);

        Ok(Self::new(
            allocator,
            store,
            KnowledgeSelector::new(config.selector.clone()),
            ConversationLog::new(config.history.max_turns),
            generator,
        ))
    }

    /// Replace the system header
    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.header = header.into();
        self
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    pub fn executor(&self) -> &Arc<AdmissionExecutor> {
        self.generator.executor()
    }
}

/// Reply to one chat message
#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub request_id: Uuid,
    pub text: String,
    pub model_used: String,
    pub was_fallback: bool,
    pub budget: Budget,
    pub selection: SelectionMetrics,
    pub search_mode: Option<SearchMode>,
    pub history_turns_used: usize,
}

/// Sequential chat pipeline over a shared context
#[derive(Clone)]
pub struct ChatPipeline {
    context: Arc<PipelineContext>,
}

impl ChatPipeline {
    pub fn new(context: Arc<PipelineContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.context
    }

    /// Answer `message` for `session`, optionally with auxiliary context
    pub async fn handle_message(
        &self,
        session: &str,
        message: &str,
        auxiliary: Option<&str>,
    ) -> Result<ChatReply> {
        let message = message.trim();
        if message.is_empty() {
            return Err(ContextError::Validation("message must not be empty".to_string()));
        }
        if session.trim().is_empty() {
            return Err(ContextError::Validation("session id must not be empty".to_string()));
        }

        let request_id = Uuid::new_v4();
        let ctx = &self.context;
        let auxiliary = auxiliary.map(str::trim).filter(|a| !a.is_empty());

        let history = ctx.conversations.history(session);
        let budget = ctx.allocator.allocate(message, &history, auxiliary.is_some(), None);

        let (cards, search_mode) = self.retrieve(message, &budget).await;
        let selection = ctx
            .selector
            .select_within_budget(cards, message, &history, budget.knowledge);
        let compacted = ctx.compactor.compact(&history, budget.history);

        let request = GenerationRequest::new(
            assemble_system(&ctx.header, budget.header, selection.cards()),
            assemble_prompt(message, auxiliary, budget.auxiliary),
        )
        .with_history(compacted)
        .with_max_tokens(budget.reserve.max(1));

        debug!(
            request_id = %request_id,
            session = %session,
            knowledge_cards = selection.metrics.selected_count,
            history_turns = request.history.len(),
            estimated_cost = request.estimated_cost(),
            "Prompt assembled"
        );

        let outcome = ctx.generator.generate(&request, session).await?;

        ctx.conversations.append(
            session,
            [
                ConversationTurn::user(message),
                ConversationTurn::assistant(outcome.text.clone()),
            ],
        );

        info!(
            request_id = %request_id,
            session = %session,
            model = %outcome.model_used,
            was_fallback = outcome.was_fallback,
            attempts = outcome.attempts,
            "Chat message answered"
        );

        Ok(ChatReply {
            request_id,
            text: outcome.text,
            model_used: outcome.model_used,
            was_fallback: outcome.was_fallback,
            budget,
            selection: selection.metrics,
            search_mode,
            history_turns_used: request.history.len(),
        })
    }

    async fn retrieve(&self, message: &str, budget: &Budget) -> (Vec<KnowledgeCard>, Option<SearchMode>) {
        if budget.knowledge == 0 || self.context.store.is_empty() {
            return (Vec::new(), None);
        }

        let top_k = self.context.store.config().default_top_k;
        match self.context.store.search_with_mode(message, top_k).await {
            Ok((cards, mode)) => (cards, Some(mode)),
            Err(e) => {
                warn!(error = %e, "Knowledge search failed, continuing without knowledge");
                (Vec::new(), None)
            }
        }
    }
}

fn assemble_system<'a>(
    header: &str,
    header_budget: usize,
    cards: impl Iterator<Item = &'a KnowledgeCard>,
) -> String {
    let mut system = truncate_to_tokens(header, header_budget).to_string();

    let block: Vec<String> = cards
        .map(|card| {
            if card.category.is_empty() {
                format!("- {}", card.content)
            } else {
                format!("- [{}] {}", card.category, card.content)
            }
        })
        .collect();
    if !block.is_empty() {
        system.push_str("\n\nRelevant knowledge:\n");
        system.push_str(&block.join("\n"));
    }
    system
}

fn assemble_prompt(message: &str, auxiliary: Option<&str>, auxiliary_budget: usize) -> String {
    match auxiliary.map(|aux| truncate_to_tokens(aux, auxiliary_budget)) {
        Some(aux) if !aux.is_empty() => format!("Additional context:\n{aux}\n\n{message}"),
        _ => message.to_string(),
    }
}

/// Longest prefix of `text` whose estimated cost fits in `tokens`
fn truncate_to_tokens(text: &str, tokens: usize) -> &str {
    let max_chars = tokens * CHARS_PER_TOKEN;
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
