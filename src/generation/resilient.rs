//! Generation client with admission control and backend fallback

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

use super::backend::{GenerationBackend, GenerationError, GenerationRequest};
use crate::admission::{AdmissionExecutor, Classify, ErrorClass};
use crate::metrics::METRICS;

/// Result of a successful generation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationOutcome {
    pub text: String,
    pub model_used: String,
    pub was_fallback: bool,
    /// Backend calls made, across both backends
    pub attempts: u32,
}

/// Fallback counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FallbackStats {
    pub fallback_count: u64,
    pub distinct_sessions: usize,
    pub last_error: Option<String>,
    pub last_fallback_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct FallbackState {
    count: u64,
    sessions: HashSet<String>,
    last_error: Option<String>,
    last_fallback_at: Option<DateTime<Utc>>,
}

/// Primary/secondary generation client
///
/// Both backends are only ever called through the admission executor.
pub struct ResilientGenerationClient {
    primary: Arc<dyn GenerationBackend>,
    secondary: Arc<dyn GenerationBackend>,
    executor: Arc<AdmissionExecutor>,
    fallback: Mutex<FallbackState>,
}

impl ResilientGenerationClient {
    pub fn new(
        primary: Arc<dyn GenerationBackend>,
        secondary: Arc<dyn GenerationBackend>,
        executor: Arc<AdmissionExecutor>,
    ) -> Self {
        Self {
            primary,
            secondary,
            executor,
            fallback: Mutex::new(FallbackState::default()),
        }
    }

    /// Generate with the primary backend, falling back to the secondary on overload
    ///
    /// The request is admitted once; a fallback does not take a second rate
    /// slot. Fatal primary errors are returned as-is. When both backends fail
    /// the caller gets a single [`GenerationError::Unavailable`].
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        session: &str,
    ) -> Result<GenerationOutcome, GenerationError> {
        let attempts = &AtomicU32::new(0);
        self.executor.admit(session, request.estimated_cost()).await;

        let primary_err = match self.call(self.primary.as_ref(), request, session, attempts).await {
            Ok(text) => {
                return Ok(GenerationOutcome {
                    text,
                    model_used: self.primary.name().to_string(),
                    was_fallback: false,
                    attempts: attempts.load(Ordering::SeqCst),
                });
            }
            Err(e) => e,
        };

        let class = primary_err.classify();
        if class == ErrorClass::Fatal {
            warn!(
                provider = %self.primary.name(),
                error = %primary_err,
                "Primary backend failed with a fatal error"
            );
            return Err(primary_err);
        }

        info!(
            provider = %self.secondary.name(),
            session = %session,
            class = %class,
            error = %primary_err,
            "Fallback: primary failed, trying secondary"
        );
        self.record_fallback(session, &primary_err);

        match self.call(self.secondary.as_ref(), request, session, attempts).await {
            Ok(text) => Ok(GenerationOutcome {
                text,
                model_used: self.secondary.name().to_string(),
                was_fallback: true,
                attempts: attempts.load(Ordering::SeqCst),
            }),
            Err(secondary_err) => {
                warn!(
                    primary_error = %primary_err,
                    secondary_error = %secondary_err,
                    "Fallback: both backends failed"
                );
                METRICS.record_unavailable();
                Err(GenerationError::Unavailable {
                    primary: primary_err.to_string(),
                    secondary: secondary_err.to_string(),
                })
            }
        }
    }

    async fn call(
        &self,
        backend: &dyn GenerationBackend,
        request: &GenerationRequest,
        session: &str,
        attempts: &AtomicU32,
    ) -> Result<String, GenerationError> {
        self.executor
            .execute_with_backoff(session, move || {
                attempts.fetch_add(1, Ordering::SeqCst);
                backend.generate(request)
            })
            .await
    }

    fn lock(&self) -> MutexGuard<'_, FallbackState> {
        self.fallback.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_fallback(&self, session: &str, err: &GenerationError) {
        let mut state = self.lock();
        state.count += 1;
        state.sessions.insert(session.to_string());
        state.last_error = Some(err.to_string());
        state.last_fallback_at = Some(Utc::now());
        METRICS.record_fallback();
    }

    pub fn fallback_stats(&self) -> FallbackStats {
        let state = self.lock();
        FallbackStats {
            fallback_count: state.count,
            distinct_sessions: state.sessions.len(),
            last_error: state.last_error.clone(),
            last_fallback_at: state.last_fallback_at,
        }
    }

    pub fn primary_name(&self) -> &str {
        self.primary.name()
    }

    pub fn secondary_name(&self) -> &str {
        self.secondary.name()
    }

    pub fn executor(&self) -> &Arc<AdmissionExecutor> {
        &self.executor
    }
}
