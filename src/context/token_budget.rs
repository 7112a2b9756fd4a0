//! Per-request capacity allocation
//!
//! Splits a fixed capacity across the prompt sections:
//! - Header (system instructions): fixed
//! - User message: measured
//! - Reserve (completion headroom): fixed floor
//! - Knowledge / History / Auxiliary: shares of whatever is left
//!
//! Fresh conversations lean on knowledge; ongoing ones split between
//! history, knowledge and auxiliary context.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::models::{history_cost, Complexity, ConversationTurn};
use super::token_estimator::estimate_tokens;
use crate::metrics::METRICS;

/// Allocation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_total_capacity")]
    pub total_capacity: usize,
    #[serde(default = "default_header_tokens")]
    pub header_tokens: usize,
    #[serde(default = "default_reserve_floor")]
    pub reserve_floor: usize,
    /// Knowledge share of available capacity when there is no history
    #[serde(default = "default_fresh_knowledge_share")]
    pub fresh_knowledge_share: f64,
    #[serde(default = "default_history_share")]
    pub history_share: f64,
    #[serde(default = "default_knowledge_share")]
    pub knowledge_share: f64,
    #[serde(default = "default_auxiliary_share")]
    pub auxiliary_share: f64,
    /// Upper bound moved from reserve to knowledge for complex messages
    #[serde(default = "default_complex_reserve_shift")]
    pub complex_reserve_shift: usize,
}

fn default_total_capacity() -> usize { 2000 }
fn default_header_tokens() -> usize { 150 }
fn default_reserve_floor() -> usize { 200 }
fn default_fresh_knowledge_share() -> f64 { 0.8 }
fn default_history_share() -> f64 { 0.4 }
fn default_knowledge_share() -> f64 { 0.4 }
fn default_auxiliary_share() -> f64 { 0.2 }
fn default_complex_reserve_shift() -> usize { 100 }

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            total_capacity: default_total_capacity(),
            header_tokens: default_header_tokens(),
            reserve_floor: default_reserve_floor(),
            fresh_knowledge_share: default_fresh_knowledge_share(),
            history_share: default_history_share(),
            knowledge_share: default_knowledge_share(),
            auxiliary_share: default_auxiliary_share(),
            complex_reserve_shift: default_complex_reserve_shift(),
        }
    }
}

impl BudgetConfig {
    /// Validate that the budget configuration is consistent
    pub fn validate(&self) -> Result<(), BudgetError> {
        let fixed = self.header_tokens + self.reserve_floor;
        if fixed > self.total_capacity {
            return Err(BudgetError::ConfigurationInvalid {
                allocated: fixed,
                max: self.total_capacity,
            });
        }

        let shares = [
            ("fresh_knowledge_share", self.fresh_knowledge_share),
            ("history_share", self.history_share),
            ("knowledge_share", self.knowledge_share),
            ("auxiliary_share", self.auxiliary_share),
        ];
        for (name, share) in shares {
            if !(0.0..=1.0).contains(&share) {
                return Err(BudgetError::InvalidShare { name, value: share });
            }
        }

        if self.history_share + self.knowledge_share + self.auxiliary_share > 1.0 + f64::EPSILON {
            return Err(BudgetError::InvalidShare {
                name: "history_share + knowledge_share + auxiliary_share",
                value: self.history_share + self.knowledge_share + self.auxiliary_share,
            });
        }

        Ok(())
    }
}

/// Capacity split for one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    pub header: usize,
    pub knowledge: usize,
    pub history: usize,
    pub auxiliary: usize,
    pub user_message: usize,
    pub reserve: usize,
    pub complexity: Complexity,
    /// Set when nothing was left for derived sections
    pub degraded: bool,
}

impl Budget {
    /// Sum of every allocated section
    pub fn total(&self) -> usize {
        self.header + self.knowledge + self.history + self.auxiliary + self.user_message + self.reserve
    }

    /// Check if this allocation fits within the capacity
    pub fn is_within_budget(&self, capacity: usize) -> bool {
        self.total() <= capacity
    }
}

/// Token budget errors
#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("Budget exceeded: {used} tokens used, {max} tokens allowed")]
    BudgetExceeded { used: usize, max: usize },

    #[error("Configuration invalid: {allocated} tokens allocated, {max} tokens max")]
    ConfigurationInvalid { allocated: usize, max: usize },

    #[error("Invalid share {name}: {value}")]
    InvalidShare { name: &'static str, value: f64 },
}

const COMPLEX_KEYWORDS: &[&str] = &[
    "explain",
    "compare",
    "analyze",
    "analyse",
    "why",
    "how",
    "difference",
    "step by step",
    "trade-off",
    "tradeoff",
    "design",
    "implement",
];

/// Classify message complexity from length, punctuation and keywords
pub fn classify_complexity(message: &str) -> Complexity {
    let lowered = message.to_lowercase();
    let length = message.chars().count();
    let mut score = 0;

    if length > 300 {
        score += 2;
    } else if length > 100 {
        score += 1;
    }

    if message.matches('?').count() > 1 {
        score += 1;
    }

    let clauses = message.chars().filter(|c| matches!(c, ',' | ';' | ':')).count();
    if clauses >= 3 {
        score += 1;
    }

    let keyword_hits = COMPLEX_KEYWORDS
        .iter()
        .filter(|kw| contains_term(&lowered, kw))
        .count();
    score += keyword_hits.min(2);

    match score {
        0 => Complexity::Simple,
        1 | 2 => Complexity::Moderate,
        _ => Complexity::Complex,
    }
}

fn contains_term(haystack: &str, term: &str) -> bool {
    if term.contains(' ') {
        return haystack.contains(term);
    }
    haystack
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .any(|word| word == term)
}

/// Budget allocator
#[derive(Debug, Clone)]
pub struct BudgetAllocator {
    config: BudgetConfig,
}

impl BudgetAllocator {
    /// Create a new allocator
    pub fn new(config: BudgetConfig) -> Result<Self, BudgetError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Create with default configuration
    pub fn with_defaults() -> Result<Self, BudgetError> {
        Self::new(BudgetConfig::default())
    }

    /// Split the capacity for one message
    ///
    /// `complexity` overrides the heuristic classification when given.
    pub fn allocate(
        &self,
        message: &str,
        history: &[ConversationTurn],
        has_auxiliary: bool,
        complexity: Option<Complexity>,
    ) -> Budget {
        let complexity = complexity.unwrap_or_else(|| classify_complexity(message));
        let capacity = self.config.total_capacity;
        let header = self.config.header_tokens;
        let user_message = estimate_tokens(message);
        let reserve = self.config.reserve_floor;

        let available = capacity as i64 - header as i64 - user_message as i64 - reserve as i64;
        if available <= 0 {
            let budget = self.minimal(user_message, complexity);
            debug!(
                capacity,
                user_message,
                complexity = complexity.as_str(),
                "No capacity left for context sections, returning minimal budget"
            );
            METRICS.record_budget(&budget);
            return budget;
        }
        let available = available as usize;

        let mut budget = Budget {
            header,
            knowledge: 0,
            history: 0,
            auxiliary: 0,
            user_message,
            reserve,
            complexity,
            degraded: false,
        };

        if history.is_empty() {
            budget.knowledge = share_of(available, self.config.fresh_knowledge_share);
            if has_auxiliary {
                budget.auxiliary = available - budget.knowledge;
            }
        } else {
            let measured = history_cost(history);
            budget.history = measured.min(share_of(available, self.config.history_share));
            budget.knowledge = share_of(available, self.config.knowledge_share);
            if has_auxiliary {
                budget.auxiliary = share_of(available, self.config.auxiliary_share);
            }
        }

        if complexity == Complexity::Complex {
            let shift = self.config.complex_reserve_shift.min(budget.reserve / 2);
            budget.reserve -= shift;
            budget.knowledge += shift;
        }

        self.clamp_to_capacity(&mut budget);

        debug!(
            available,
            knowledge = budget.knowledge,
            history = budget.history,
            auxiliary = budget.auxiliary,
            reserve = budget.reserve,
            complexity = complexity.as_str(),
            "Budget allocated"
        );
        METRICS.record_budget(&budget);
        budget
    }

    /// Budget with every derived section zeroed, clamped to capacity
    fn minimal(&self, user_message: usize, complexity: Complexity) -> Budget {
        let capacity = self.config.total_capacity;
        let header = self.config.header_tokens.min(capacity);
        let user_message = user_message.min(capacity - header);
        let reserve = self.config.reserve_floor.min(capacity - header - user_message);
        Budget {
            header,
            knowledge: 0,
            history: 0,
            auxiliary: 0,
            user_message,
            reserve,
            complexity,
            degraded: true,
        }
    }

    /// Trim derived sections (auxiliary, history, knowledge) if rounding overshot
    fn clamp_to_capacity(&self, budget: &mut Budget) {
        let capacity = self.config.total_capacity;
        let mut excess = budget.total().saturating_sub(capacity);
        for section in [&mut budget.auxiliary, &mut budget.history, &mut budget.knowledge] {
            if excess == 0 {
                break;
            }
            let cut = excess.min(*section);
            *section -= cut;
            excess -= cut;
        }
    }

    /// Validate a budget against the capacity
    pub fn validate(&self, budget: &Budget) -> Result<(), BudgetError> {
        if !budget.is_within_budget(self.config.total_capacity) {
            return Err(BudgetError::BudgetExceeded {
                used: budget.total(),
                max: self.config.total_capacity,
            });
        }
        Ok(())
    }

    /// Get the total capacity
    pub fn capacity(&self) -> usize {
        self.config.total_capacity
    }

    /// Get the configuration
    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }
}

fn share_of(available: usize, share: f64) -> usize {
    ((available as f64) * share).round() as usize
}
