//! Token cost estimation
//!
//! Costs are a coarse `ceil(chars / 4)` heuristic, not a tokenizer. Every
//! component prices text through [`estimate_tokens`] so that relative
//! comparisons stay consistent even though absolute values are approximate.

/// Characters assumed per token
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token cost of `text`
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    (chars + CHARS_PER_TOKEN - 1) / CHARS_PER_TOKEN
}
