//! Context management with capacity budgeting
//!
//! This module splits a fixed per-request capacity across the prompt sections
//! and trims conversation history to the share it was given.

pub mod history;
pub mod models;
pub mod token_budget;
pub mod token_estimator;

pub use history::{compact_history, ConversationLog, HistoryCompactor};
pub use models::{history_cost, Complexity, ConversationTurn, Role};
pub use token_budget::{classify_complexity, Budget, BudgetAllocator, BudgetConfig, BudgetError};
pub use token_estimator::estimate_tokens;
