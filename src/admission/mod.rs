//! Admission control for expensive backend calls
//!
//! Per-session and global rate limits, exponential backoff with jitter and
//! a closed error classification shared with the generation client.

pub mod backoff;
pub mod classify;
pub mod executor;
pub mod global;
pub mod session;

pub use backoff::BackoffPolicy;
pub use classify::{classify, classify_message, classify_status, Classify, ErrorClass};
pub use executor::{AdmissionConfig, AdmissionExecutor, AdmissionPhase, AdmissionStats};
pub use global::{GlobalAdmission, GlobalLimits, GlobalSnapshot};
pub use session::{Outcome, SessionDecision, SessionLimit, SessionLimits, SessionRegistry, SessionSnapshot};
