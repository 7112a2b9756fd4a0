//! Admission-controlled execution
//!
//! Every expensive call goes through [`AdmissionExecutor::execute`]:
//! 1. the session limit (window cap, high-cost spacing)
//! 2. the global window for high-cost calls
//! 3. the call itself, retried with backoff on transient failures
//!
//! Admission only ever delays; it never rejects.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::backoff::BackoffPolicy;
use super::classify::{Classify, ErrorClass};
use super::global::{GlobalAdmission, GlobalLimits};
use super::session::{Outcome, SessionLimits, SessionRegistry, SessionSnapshot};
use crate::metrics::METRICS;

/// Admission configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default = "default_session_requests_per_minute")]
    pub session_requests_per_minute: usize,
    /// Cost above which a request is high-cost
    #[serde(default = "default_high_cost_threshold")]
    pub high_cost_threshold: usize,
    #[serde(default = "default_min_high_cost_interval_ms")]
    pub min_high_cost_interval_ms: u64,
    #[serde(default = "default_throttle_buffer_ms")]
    pub throttle_buffer_ms: u64,
    #[serde(default = "default_global_requests_per_minute")]
    pub global_requests_per_minute: usize,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_stats_window_secs")]
    pub stats_window_secs: u64,
    /// How often the maintenance task evicts idle sessions
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_session_requests_per_minute() -> usize { 10 }
fn default_high_cost_threshold() -> usize { 1000 }
fn default_min_high_cost_interval_ms() -> u64 { 2000 }
fn default_throttle_buffer_ms() -> u64 { 1000 }
fn default_global_requests_per_minute() -> usize { 30 }
fn default_sweep_interval_ms() -> u64 { 1000 }
fn default_max_retries() -> u32 { 3 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_max_jitter_ms() -> u64 { 1000 }
fn default_max_backoff_secs() -> u64 { 30 }
fn default_session_ttl_secs() -> u64 { 3600 }
fn default_stats_window_secs() -> u64 { 300 }
fn default_cleanup_interval_secs() -> u64 { 60 }

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            session_requests_per_minute: default_session_requests_per_minute(),
            high_cost_threshold: default_high_cost_threshold(),
            min_high_cost_interval_ms: default_min_high_cost_interval_ms(),
            throttle_buffer_ms: default_throttle_buffer_ms(),
            global_requests_per_minute: default_global_requests_per_minute(),
            sweep_interval_ms: default_sweep_interval_ms(),
            max_retries: default_max_retries(),
            backoff_multiplier: default_backoff_multiplier(),
            max_jitter_ms: default_max_jitter_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            session_ttl_secs: default_session_ttl_secs(),
            stats_window_secs: default_stats_window_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl AdmissionConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn stats_window(&self) -> Duration {
        Duration::from_secs(self.stats_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            requests_per_window: self.session_requests_per_minute.max(1),
            window: Duration::from_secs(60),
            throttle_buffer: Duration::from_millis(self.throttle_buffer_ms),
            high_cost_threshold: self.high_cost_threshold,
            min_high_cost_interval: Duration::from_millis(self.min_high_cost_interval_ms),
            outcome_retention: self.stats_window(),
        }
    }

    fn global_limits(&self) -> GlobalLimits {
        GlobalLimits {
            requests_per_window: self.global_requests_per_minute.max(1),
            window: Duration::from_secs(60),
            sweep_interval: self.sweep_interval(),
        }
    }

    fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.backoff_multiplier,
            Duration::from_millis(self.max_jitter_ms),
            Duration::from_secs(self.max_backoff_secs),
        )
    }
}

/// Lifecycle of an admitted request, logged at debug level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPhase {
    Idle,
    Checking,
    Delayed,
    Admitted,
    Executing,
    Succeeded,
    Failed,
}

impl AdmissionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionPhase::Idle => "idle",
            AdmissionPhase::Checking => "checking",
            AdmissionPhase::Delayed => "delayed",
            AdmissionPhase::Admitted => "admitted",
            AdmissionPhase::Executing => "executing",
            AdmissionPhase::Succeeded => "succeeded",
            AdmissionPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for AdmissionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate admission statistics over the trailing stats window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdmissionStats {
    pub active_sessions: usize,
    pub queue_length: usize,
    pub global_window_count: usize,
    pub recent_successes: usize,
    pub recent_errors: usize,
    pub success_rate: f64,
    pub window_secs: u64,
}

/// Rate-limited executor with retry and backoff
pub struct AdmissionExecutor {
    config: AdmissionConfig,
    sessions: SessionRegistry,
    global: GlobalAdmission,
    backoff: BackoffPolicy,
}

impl AdmissionExecutor {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            sessions: SessionRegistry::new(config.session_limits()),
            global: GlobalAdmission::new(config.global_limits()),
            backoff: config.backoff(),
            config,
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(AdmissionConfig::default())
    }

    /// Admit and run `op` on behalf of `session`
    pub async fn execute<T, E, F, Fut>(&self, session: &str, cost: usize, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        self.admit(session, cost).await;
        self.execute_with_backoff(session, op).await
    }

    /// Pass the session limit, then the global limit for high-cost requests
    ///
    /// Takes one slot in each window that applies. Returns the total wait.
    pub async fn admit(&self, session: &str, cost: usize) -> Duration {
        debug!(session = %session, cost, phase = %AdmissionPhase::Idle, "Admission requested");

        let mut waited = self.enforce_session_limit(session, cost).await;
        if self.is_high_cost(cost) {
            waited += self.enforce_global_limit(session).await;
        }

        debug!(session = %session, phase = %AdmissionPhase::Admitted, "Admission granted");
        waited
    }

    /// Wait until the session's own limits admit a request of `cost`
    pub async fn enforce_session_limit(&self, session: &str, cost: usize) -> Duration {
        debug!(session = %session, cost, phase = %AdmissionPhase::Checking, "Checking session limit");
        let waited = self.sessions.acquire(session, cost).await;
        if !waited.is_zero() {
            debug!(
                session = %session,
                phase = %AdmissionPhase::Delayed,
                waited_ms = waited.as_millis() as u64,
                "Session limit delayed request"
            );
        }
        waited
    }

    /// Wait for a slot in the shared high-cost window
    pub async fn enforce_global_limit(&self, session: &str) -> Duration {
        debug!(session = %session, phase = %AdmissionPhase::Checking, "Checking global limit");
        let waited = self.global.acquire(session).await;
        if !waited.is_zero() {
            info!(
                session = %session,
                phase = %AdmissionPhase::Delayed,
                waited_ms = waited.as_millis() as u64,
                "Global limit delayed request"
            );
        }
        waited
    }

    /// Run `op`, retrying transient failures up to `max_retries` times
    pub async fn execute_with_backoff<T, E, F, Fut>(&self, session: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let mut attempt: u32 = 0;
        loop {
            debug!(session = %session, attempt, phase = %AdmissionPhase::Executing, "Executing");

            match op().await {
                Ok(value) => {
                    debug!(session = %session, attempt, phase = %AdmissionPhase::Succeeded, "Execution succeeded");
                    self.sessions.record_outcome(session, Outcome::Success);
                    METRICS.record_admission_outcome(true);
                    return Ok(value);
                }
                Err(e) => {
                    let class = e.classify();
                    if class.is_transient() && attempt < self.config.max_retries {
                        let delay = self.backoff.delay(attempt);
                        warn!(
                            session = %session,
                            attempt = attempt + 1,
                            class = %class,
                            error = %e,
                            "Attempt failed, retrying in {:?}",
                            delay
                        );
                        METRICS.record_retry(class);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    warn!(
                        session = %session,
                        attempts = attempt + 1,
                        class = %class,
                        error = %e,
                        phase = %AdmissionPhase::Failed,
                        "Execution failed"
                    );
                    self.sessions.record_outcome(session, Outcome::Failure(class));
                    METRICS.record_admission_outcome(false);
                    return Err(e);
                }
            }
        }
    }

    pub fn is_high_cost(&self, cost: usize) -> bool {
        cost > self.config.high_cost_threshold
    }

    /// Aggregate counters over the trailing stats window
    pub fn statistics(&self) -> AdmissionStats {
        let window = self.config.stats_window();
        let since = Instant::now()
            .checked_sub(window)
            .unwrap_or_else(Instant::now);
        let (recent_successes, recent_errors) = self.sessions.outcomes_since(since);
        let total = recent_successes + recent_errors;
        let success_rate = if total == 0 {
            1.0
        } else {
            recent_successes as f64 / total as f64
        };
        let global = self.global.snapshot();

        AdmissionStats {
            active_sessions: self.sessions.active_count(window),
            queue_length: global.queue_length,
            global_window_count: global.window_count,
            recent_successes,
            recent_errors,
            success_rate,
            window_secs: window.as_secs(),
        }
    }

    /// Evict sessions idle for longer than the session TTL
    pub fn cleanup(&self) -> usize {
        self.sessions.cleanup(self.config.session_ttl())
    }

    pub fn session_snapshot(&self, session: &str) -> Option<SessionSnapshot> {
        self.sessions.snapshot(session)
    }

    /// Run queue sweeps and session cleanup in the background
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(executor.config.sweep_interval());
            let cleanup_every = Duration::from_secs(executor.config.cleanup_interval_secs.max(1));
            let mut last_cleanup = Instant::now();
            loop {
                ticker.tick().await;
                executor.global.sweep();
                if last_cleanup.elapsed() >= cleanup_every {
                    let removed = executor.cleanup();
                    if removed > 0 {
                        info!(removed, "Evicted idle sessions");
                    }
                    last_cleanup = Instant::now();
                }
            }
        })
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }
}
