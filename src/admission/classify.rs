//! Error classification at the backend boundary
//!
//! Raw backend failures are mapped once into [`ErrorClass`]; retry and
//! fallback decisions only ever look at the class.

use serde::Serialize;
use std::fmt;

use crate::generation::GenerationError;

/// Closed set of failure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transient fault worth retrying against the same backend
    Retryable,
    /// Overload or quota signal; retry, then switch backends
    FallbackEligible,
    /// Retrying cannot help
    Fatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Retryable => "retryable",
            ErrorClass::FallbackEligible => "fallback_eligible",
            ErrorClass::Fatal => "fatal",
        }
    }

    /// Whether another attempt may succeed
    pub fn is_transient(&self) -> bool {
        !matches!(self, ErrorClass::Fatal)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors the admission executor can reason about
pub trait Classify {
    fn classify(&self) -> ErrorClass;
}

impl Classify for GenerationError {
    fn classify(&self) -> ErrorClass {
        classify(self)
    }
}

const FALLBACK_STATUSES: &[u16] = &[429, 503, 529];
const RETRYABLE_STATUSES: &[u16] = &[502, 504];

const FALLBACK_PATTERNS: &[&str] = &[
    "quota",
    "overloaded",
    "rate limit",
    "rate_limit",
    "capacity",
    "too many requests",
];
const RETRYABLE_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "network",
    "econnreset",
];

/// Map a generation failure to its class
pub fn classify(err: &GenerationError) -> ErrorClass {
    match err {
        GenerationError::Http { status, message } => {
            classify_status(*status).unwrap_or_else(|| classify_message(message))
        }
        GenerationError::Timeout(_) | GenerationError::Network(_) => ErrorClass::Retryable,
        GenerationError::Backend(message) => classify_message(message),
        GenerationError::InvalidRequest(_)
        | GenerationError::InvalidResponse(_)
        | GenerationError::Unavailable { .. } => ErrorClass::Fatal,
    }
}

/// Class implied by an HTTP status alone
pub fn classify_status(status: u16) -> Option<ErrorClass> {
    if FALLBACK_STATUSES.contains(&status) {
        Some(ErrorClass::FallbackEligible)
    } else if RETRYABLE_STATUSES.contains(&status) {
        Some(ErrorClass::Retryable)
    } else {
        None
    }
}

/// Class implied by an error message, `Fatal` when nothing matches
pub fn classify_message(message: &str) -> ErrorClass {
    let message = message.to_lowercase();
    if FALLBACK_PATTERNS.iter().any(|p| message.contains(p)) {
        ErrorClass::FallbackEligible
    } else if RETRYABLE_PATTERNS.iter().any(|p| message.contains(p)) {
        ErrorClass::Retryable
    } else {
        ErrorClass::Fatal
    }
}
