//! Conversation history retention and compaction

use dashmap::DashMap;
use std::collections::VecDeque;
use tracing::debug;

use super::models::ConversationTurn;

/// Trim `turns` to the newest contiguous suffix whose cost fits in `budget`
///
/// Walks newest to oldest and stops at the first turn that would overflow, so
/// an older but smaller turn is never pulled in past a gap.
pub fn compact_history(turns: &[ConversationTurn], budget: usize) -> Vec<ConversationTurn> {
    if turns.is_empty() || budget == 0 {
        return Vec::new();
    }

    let mut used = 0usize;
    let mut keep = 0usize;
    for turn in turns.iter().rev() {
        let cost = turn.token_cost();
        if used + cost > budget {
            break;
        }
        used += cost;
        keep += 1;
    }

    debug!(
        total_turns = turns.len(),
        kept_turns = keep,
        tokens_used = used,
        budget,
        "History compacted"
    );

    turns[turns.len() - keep..].to_vec()
}

/// Compactor bound to a fixed per-request policy
#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryCompactor;

impl HistoryCompactor {
    pub fn compact(&self, turns: &[ConversationTurn], budget: usize) -> Vec<ConversationTurn> {
        compact_history(turns, budget)
    }
}

/// Per-session turn history capped at a fixed count
pub struct ConversationLog {
    sessions: DashMap<String, VecDeque<ConversationTurn>>,
    max_turns: usize,
}

impl ConversationLog {
    pub fn new(max_turns: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_turns,
        }
    }

    /// Append turns in order, evicting the oldest beyond the cap
    pub fn append(&self, session_id: &str, turns: impl IntoIterator<Item = ConversationTurn>) {
        let mut entry = self.sessions.entry(session_id.to_string()).or_default();
        for turn in turns {
            entry.push_back(turn);
        }
        while entry.len() > self.max_turns {
            entry.pop_front();
        }
    }

    /// Snapshot of a session's turns, oldest first
    pub fn history(&self, session_id: &str) -> Vec<ConversationTurn> {
        self.sessions
            .get(session_id)
            .map(|turns| turns.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }
}
