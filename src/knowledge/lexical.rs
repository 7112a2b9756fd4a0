//! Lexical relevance scoring
//!
//! Used when no embedding backend is available and by the selector's
//! semantic score.

use std::collections::HashSet;

/// Score for the whole query appearing verbatim
pub const PHRASE_MATCH_SCORE: f32 = 1.0;
/// Score per query word contained in the text
pub const WORD_MATCH_SCORE: f32 = 0.3;
/// Score per category term mentioned by the query
pub const CATEGORY_TERM_SCORE: f32 = 0.2;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "can", "do", "does", "for", "from",
    "how", "i", "in", "is", "it", "me", "my", "of", "on", "or", "so", "that", "the", "this", "to",
    "was", "we", "what", "when", "where", "which", "who", "why", "with", "you", "your",
];

/// Lowercased alphanumeric words, stopwords and single characters removed
pub fn keywords(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 1 && !STOPWORDS.contains(w))
        .filter(|w| seen.insert(w.to_string()))
        .map(str::to_string)
        .collect()
}

/// Keyword set of `text`
pub fn keyword_set(text: &str) -> HashSet<String> {
    keywords(text).into_iter().collect()
}

/// Terms of a category label (`"billing-refunds"` → `billing`, `refunds`)
pub fn category_terms(category: &str) -> Vec<String> {
    keywords(category)
}

/// Whether the normalized query appears verbatim in the normalized text
pub fn phrase_match(query: &str, text: &str) -> bool {
    let query = normalize(query);
    !query.is_empty() && normalize(text).contains(&query)
}

/// Number of query keywords that appear in `text`
pub fn word_matches(query_keywords: &[String], text_keywords: &HashSet<String>) -> usize {
    query_keywords.iter().filter(|w| text_keywords.contains(*w)).count()
}

/// Lexical relevance of a document for a query, in `[0, 1]`
pub fn lexical_score(query: &str, content: &str, category: &str) -> f32 {
    let query_keywords = keywords(query);
    let content_keywords = keyword_set(content);
    let query_set: HashSet<&String> = query_keywords.iter().collect();

    let mut score = 0.0;
    if phrase_match(query, content) {
        score += PHRASE_MATCH_SCORE;
    }
    score += WORD_MATCH_SCORE * word_matches(&query_keywords, &content_keywords) as f32;
    let category_hits = category_terms(category)
        .iter()
        .filter(|term| query_set.contains(term))
        .count();
    score += CATEGORY_TERM_SCORE * category_hits as f32;

    score.min(1.0)
}

fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
