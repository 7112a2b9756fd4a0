//! Diversity-aware knowledge selection within a token budget
//!
//! Candidates are scored on three axes:
//! - semantic: match against the current query (60%)
//! - contextual: overlap with the recent conversation (30%)
//! - recency: whether the candidate's category came up recently (10%)
//!
//! Selection is a two-pass greedy over descending efficiency
//! (score per token). The first pass takes at most one candidate per
//! category; the second pass fills what budget is left.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

use super::lexical::{category_terms, keyword_set, keywords, phrase_match, word_matches};
use super::models::KnowledgeCard;
use crate::context::ConversationTurn;
use crate::metrics::METRICS;

const SEMANTIC_WEIGHT: f32 = 0.6;
const CONTEXTUAL_WEIGHT: f32 = 0.3;
const RECENCY_WEIGHT: f32 = 0.1;

const PHRASE_SCORE: f32 = 1.0;
const WORD_SCORE: f32 = 0.3;
const CONCEPT_SCORE: f32 = 0.2;
const CONCEPT_CAP: f32 = 0.4;
const HISTORY_CATEGORY_SCORE: f32 = 0.5;

/// Named group of interchangeable domain terms
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptGroup {
    pub name: String,
    pub terms: Vec<String>,
}

/// Selector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Number of trailing history turns consulted
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Recency decays linearly to zero over this many minutes
    #[serde(default = "default_recency_window_mins")]
    pub recency_window_mins: u64,
    #[serde(default)]
    pub concepts: Vec<ConceptGroup>,
}

fn default_history_window() -> usize { 3 }
fn default_recency_window_mins() -> u64 { 60 }

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
            recency_window_mins: default_recency_window_mins(),
            concepts: Vec::new(),
        }
    }
}

impl SelectorConfig {
    pub fn recency_window(&self) -> Duration {
        Duration::from_secs(self.recency_window_mins * 60)
    }
}

/// A knowledge card with its selection scores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub card: KnowledgeCard,
    pub semantic_score: f32,
    pub contextual_score: f32,
    pub recency_score: f32,
    pub combined_score: f32,
    pub token_cost: usize,
    pub efficiency: f32,
}

impl ScoredCandidate {
    pub fn new(
        card: KnowledgeCard,
        semantic_score: f32,
        contextual_score: f32,
        recency_score: f32,
        token_cost: usize,
    ) -> Self {
        let combined_score = SEMANTIC_WEIGHT * semantic_score
            + CONTEXTUAL_WEIGHT * contextual_score
            + RECENCY_WEIGHT * recency_score;
        let efficiency = combined_score / token_cost.max(1) as f32;
        Self {
            card,
            semantic_score,
            contextual_score,
            recency_score,
            combined_score,
            token_cost,
            efficiency,
        }
    }
}

/// Selection summary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionMetrics {
    pub candidates_considered: usize,
    pub selected_count: usize,
    /// Accepted while covering new categories
    pub first_pass_count: usize,
    pub tokens_used: usize,
    pub budget: usize,
    pub average_efficiency: f32,
    /// Distinct categories over selected count
    pub category_diversity: f32,
}

/// Selected candidates in acceptance order plus metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub selected: Vec<ScoredCandidate>,
    pub metrics: SelectionMetrics,
}

impl Selection {
    pub fn cards(&self) -> impl Iterator<Item = &KnowledgeCard> {
        self.selected.iter().map(|c| &c.card)
    }
}

/// Knowledge selector
#[derive(Debug, Clone, Default)]
pub struct KnowledgeSelector {
    config: SelectorConfig,
}

impl KnowledgeSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self { config }
    }

    /// Score and select candidates that fit in `budget` tokens
    pub fn select_within_budget(
        &self,
        candidates: Vec<KnowledgeCard>,
        query: &str,
        history: &[ConversationTurn],
        budget: usize,
    ) -> Selection {
        self.select_within_budget_at(candidates, query, history, budget, Utc::now())
    }

    /// [`select_within_budget`](Self::select_within_budget) against an explicit clock
    pub fn select_within_budget_at(
        &self,
        candidates: Vec<KnowledgeCard>,
        query: &str,
        history: &[ConversationTurn],
        budget: usize,
        now: DateTime<Utc>,
    ) -> Selection {
        if candidates.is_empty() || budget == 0 {
            return Selection::default();
        }
        let scored = self.score(candidates, query, history, now);
        select_scored(scored, budget)
    }

    /// Compute scores for every candidate
    pub fn score(
        &self,
        candidates: Vec<KnowledgeCard>,
        query: &str,
        history: &[ConversationTurn],
        now: DateTime<Utc>,
    ) -> Vec<ScoredCandidate> {
        let recent = &history[history.len().saturating_sub(self.config.history_window)..];
        let query_keywords = keywords(query);
        let history_keywords: HashSet<String> =
            recent.iter().flat_map(|t| keywords(&t.content)).collect();

        candidates
            .into_iter()
            .map(|card| {
                let semantic = self.semantic_score(&card, query, &query_keywords);
                let contextual = contextual_score(&card, &history_keywords);
                let recency = self.recency_score(&card, recent, now);
                let cost = card.token_cost();
                ScoredCandidate::new(card, semantic, contextual, recency, cost)
            })
            .collect()
    }

    fn semantic_score(&self, card: &KnowledgeCard, query: &str, query_keywords: &[String]) -> f32 {
        let content_keywords = keyword_set(&card.content);
        let query_set: HashSet<&str> = query_keywords.iter().map(String::as_str).collect();

        let mut score = 0.0;
        if phrase_match(query, &card.content) {
            score += PHRASE_SCORE;
        }
        score += WORD_SCORE * word_matches(query_keywords, &content_keywords) as f32;

        let mut concept = 0.0;
        if category_terms(&card.category)
            .iter()
            .any(|term| query_set.contains(term.as_str()))
        {
            concept += CONCEPT_SCORE;
        }
        for group in &self.config.concepts {
            let in_query = group.terms.iter().any(|t| query_set.contains(t.to_lowercase().as_str()));
            let in_card = group.terms.iter().any(|t| content_keywords.contains(&t.to_lowercase()));
            if in_query && in_card {
                concept += CONCEPT_SCORE;
            }
        }
        score += concept.min(CONCEPT_CAP);

        score.clamp(0.0, 1.0)
    }

    fn recency_score(&self, card: &KnowledgeCard, recent: &[ConversationTurn], now: DateTime<Utc>) -> f32 {
        let terms = category_terms(&card.category);
        if terms.is_empty() {
            return 0.0;
        }

        let Some(turn) = recent.iter().rev().find(|turn| {
            let words = keyword_set(&turn.content);
            terms.iter().any(|t| words.contains(t))
        }) else {
            return 0.0;
        };

        let window = self.config.recency_window().as_secs_f32();
        if window <= 0.0 {
            return 0.0;
        }
        let age = (now - turn.timestamp).num_milliseconds().max(0) as f32 / 1000.0;
        (1.0 - age / window).max(0.0)
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }
}

fn contextual_score(card: &KnowledgeCard, history_keywords: &HashSet<String>) -> f32 {
    if history_keywords.is_empty() {
        return 0.0;
    }

    let card_keywords = keywords(&card.content);
    let overlap = if card_keywords.is_empty() {
        0.0
    } else {
        word_matches(&card_keywords, history_keywords) as f32 / card_keywords.len() as f32
    };

    let category_hit = category_terms(&card.category)
        .iter()
        .any(|t| history_keywords.contains(t));
    let category = if category_hit { HISTORY_CATEGORY_SCORE } else { 0.0 };

    (overlap + category).min(1.0)
}

/// Two-pass greedy selection over pre-scored candidates
///
/// Never returns a selection whose summed cost exceeds `budget`.
pub fn select_scored(mut candidates: Vec<ScoredCandidate>, budget: usize) -> Selection {
    if candidates.is_empty() || budget == 0 {
        return Selection::default();
    }

    let considered = candidates.len();
    candidates.sort_by(|a, b| b.efficiency.total_cmp(&a.efficiency));

    let mut taken = vec![false; candidates.len()];
    let mut order: Vec<usize> = Vec::new();
    let mut categories: HashSet<String> = HashSet::new();
    let mut remaining = budget;

    for (i, candidate) in candidates.iter().enumerate() {
        if remaining == 0 {
            break;
        }
        if candidate.token_cost <= remaining && !categories.contains(&candidate.card.category) {
            categories.insert(candidate.card.category.clone());
            remaining -= candidate.token_cost;
            taken[i] = true;
            order.push(i);
        }
    }
    let first_pass_count = order.len();

    for (i, candidate) in candidates.iter().enumerate() {
        if remaining == 0 {
            break;
        }
        if !taken[i] && candidate.token_cost <= remaining {
            remaining -= candidate.token_cost;
            taken[i] = true;
            order.push(i);
        }
    }

    let mut slots: Vec<Option<ScoredCandidate>> = candidates.into_iter().map(Some).collect();
    let selected: Vec<ScoredCandidate> = order.iter().filter_map(|&i| slots[i].take()).collect();

    let tokens_used = budget - remaining;
    let selected_count = selected.len();
    let average_efficiency = if selected_count == 0 {
        0.0
    } else {
        selected.iter().map(|c| c.efficiency).sum::<f32>() / selected_count as f32
    };
    let distinct: HashSet<&str> = selected.iter().map(|c| c.card.category.as_str()).collect();
    let category_diversity = if selected_count == 0 {
        0.0
    } else {
        distinct.len() as f32 / selected_count as f32
    };

    let metrics = SelectionMetrics {
        candidates_considered: considered,
        selected_count,
        first_pass_count,
        tokens_used,
        budget,
        average_efficiency,
        category_diversity,
    };

    debug!(
        considered,
        selected = selected_count,
        first_pass = first_pass_count,
        tokens_used,
        budget,
        "Knowledge selected"
    );
    METRICS.record_selection(&metrics);

    Selection { selected, metrics }
}
