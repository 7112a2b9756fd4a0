//! Per-session rate state
//!
//! Each session keeps a sliding window of recent request costs, the time of
//! its last high-cost request, a rolling daily counter and a short log of
//! outcomes. State is created on first use and swept after inactivity.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::classify::ErrorClass;
use crate::metrics::METRICS;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Limits applied to every session
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub requests_per_window: usize,
    pub window: Duration,
    /// Added to the window remainder when the cap is hit
    pub throttle_buffer: Duration,
    pub high_cost_threshold: usize,
    pub min_high_cost_interval: Duration,
    /// Outcomes older than this are dropped from the log
    pub outcome_retention: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            requests_per_window: 10,
            window: Duration::from_secs(60),
            throttle_buffer: Duration::from_secs(1),
            high_cost_threshold: 1000,
            min_high_cost_interval: Duration::from_secs(2),
            outcome_retention: Duration::from_secs(300),
        }
    }
}

/// Which limit held a request back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLimit {
    Window,
    HighCostInterval,
}

impl SessionLimit {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionLimit::Window => "session",
            SessionLimit::HighCostInterval => "high_cost",
        }
    }
}

/// Result of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDecision {
    /// Request recorded against the session
    Admit,
    /// Nothing recorded; check again after `delay`
    Wait { delay: Duration, limit: SessionLimit },
}

/// Result of an admitted operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(ErrorClass),
}

#[derive(Debug)]
struct SessionRateState {
    window: VecDeque<(Instant, usize)>,
    last_high_cost: Option<Instant>,
    daily_count: u64,
    daily_started: Instant,
    last_seen: Instant,
    outcomes: VecDeque<(Instant, Outcome)>,
}

impl SessionRateState {
    fn new(now: Instant) -> Self {
        Self {
            window: VecDeque::new(),
            last_high_cost: None,
            daily_count: 0,
            daily_started: now,
            last_seen: now,
            outcomes: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant, limits: &SessionLimits) {
        while let Some((at, _)) = self.window.front() {
            if now.duration_since(*at) < limits.window {
                break;
            }
            self.window.pop_front();
        }
        if now.duration_since(self.daily_started) >= DAY {
            self.daily_count = 0;
            self.daily_started = now;
        }
        while let Some((at, _)) = self.outcomes.front() {
            if now.duration_since(*at) < limits.outcome_retention {
                break;
            }
            self.outcomes.pop_front();
        }
    }
}

/// Point-in-time view of one session's counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub window_count: usize,
    pub window_cost: usize,
    pub daily_count: u64,
    pub recent_successes: usize,
    pub recent_failures: usize,
    pub idle_secs: f64,
}

/// Rate state for every live session
pub struct SessionRegistry {
    sessions: DashMap<String, SessionRateState>,
    limits: SessionLimits,
}

impl SessionRegistry {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            sessions: DashMap::new(),
            limits,
        }
    }

    /// Check the session's limits and, if clear, record the request
    ///
    /// Check and record happen under the session's map entry, so two
    /// concurrent callers can never both take the last slot.
    pub fn try_admit(&self, session: &str, cost: usize, now: Instant) -> SessionDecision {
        let limits = &self.limits;
        let mut state = self
            .sessions
            .entry(session.to_string())
            .or_insert_with(|| SessionRateState::new(now));

        state.last_seen = now;
        state.prune(now, limits);

        if state.window.len() >= limits.requests_per_window {
            let oldest = state.window.front().map(|(at, _)| *at).unwrap_or(now);
            let remainder = limits.window.saturating_sub(now.duration_since(oldest));
            return SessionDecision::Wait {
                delay: remainder + limits.throttle_buffer,
                limit: SessionLimit::Window,
            };
        }

        let high_cost = cost > limits.high_cost_threshold;
        if high_cost {
            if let Some(last) = state.last_high_cost {
                let since = now.duration_since(last);
                if since < limits.min_high_cost_interval {
                    return SessionDecision::Wait {
                        delay: limits.min_high_cost_interval - since,
                        limit: SessionLimit::HighCostInterval,
                    };
                }
            }
            state.last_high_cost = Some(now);
        }

        state.window.push_back((now, cost));
        state.daily_count += 1;
        SessionDecision::Admit
    }

    /// Wait until the session admits the request, returning the time spent waiting
    pub async fn acquire(&self, session: &str, cost: usize) -> Duration {
        let start = Instant::now();
        loop {
            match self.try_admit(session, cost, Instant::now()) {
                SessionDecision::Admit => return start.elapsed(),
                SessionDecision::Wait { delay, limit } => {
                    debug!(
                        session = %session,
                        limit = limit.as_str(),
                        delay_ms = delay.as_millis() as u64,
                        "Session throttled"
                    );
                    METRICS.record_admission_delay(limit.as_str(), delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Append to the session's outcome log
    pub fn record_outcome(&self, session: &str, outcome: Outcome) {
        let now = Instant::now();
        let mut state = self
            .sessions
            .entry(session.to_string())
            .or_insert_with(|| SessionRateState::new(now));
        state.last_seen = now;
        state.prune(now, &self.limits);
        state.outcomes.push_back((now, outcome));
    }

    /// Successes and failures recorded since `since`, across all sessions
    pub fn outcomes_since(&self, since: Instant) -> (usize, usize) {
        let mut successes = 0;
        let mut failures = 0;
        for entry in self.sessions.iter() {
            for (at, outcome) in &entry.outcomes {
                if *at < since {
                    continue;
                }
                match outcome {
                    Outcome::Success => successes += 1,
                    Outcome::Failure(_) => failures += 1,
                }
            }
        }
        (successes, failures)
    }

    /// Sessions seen within `active_window`
    pub fn active_count(&self, active_window: Duration) -> usize {
        let now = Instant::now();
        self.sessions
            .iter()
            .filter(|entry| now.duration_since(entry.last_seen) < active_window)
            .count()
    }

    /// Drop sessions idle for at least `ttl`, returning how many were dropped
    pub fn cleanup(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions
            .retain(|_, state| now.duration_since(state.last_seen) < ttl);
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            debug!(removed, remaining = self.sessions.len(), "Session rate state swept");
        }
        removed
    }

    pub fn snapshot(&self, session: &str) -> Option<SessionSnapshot> {
        let now = Instant::now();
        let state = self.sessions.get(session)?;
        let in_window: Vec<usize> = state
            .window
            .iter()
            .filter(|(at, _)| now.duration_since(*at) < self.limits.window)
            .map(|(_, cost)| *cost)
            .collect();
        let successes = state
            .outcomes
            .iter()
            .filter(|(_, o)| *o == Outcome::Success)
            .count();

        Some(SessionSnapshot {
            window_count: in_window.len(),
            window_cost: in_window.iter().sum(),
            daily_count: state.daily_count,
            recent_successes: successes,
            recent_failures: state.outcomes.len() - successes,
            idle_secs: now.duration_since(state.last_seen).as_secs_f64(),
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(SessionLimits::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_cap_requests_wait() {
        let registry = registry();
        let now = Instant::now();

        for _ in 0..10 {
            assert_eq!(registry.try_admit("s1", 10, now), SessionDecision::Admit);
        }

        let later = now + Duration::from_secs(20);
        match registry.try_admit("s1", 10, later) {
            SessionDecision::Wait { delay, limit } => {
                assert_eq!(limit, SessionLimit::Window);
                assert_eq!(delay, Duration::from_secs(41));
            }
            other => panic!("expected wait, got {other:?}"),
        }

        // other sessions are unaffected
        assert_eq!(registry.try_admit("s2", 10, later), SessionDecision::Admit);

        // the window has rolled over
        let after = now + Duration::from_secs(61);
        assert_eq!(registry.try_admit("s1", 10, after), SessionDecision::Admit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_cost_interval() {
        let registry = registry();
        let now = Instant::now();

        assert_eq!(registry.try_admit("s1", 1500, now), SessionDecision::Admit);

        let soon = now + Duration::from_millis(500);
        assert_eq!(
            registry.try_admit("s1", 1500, soon),
            SessionDecision::Wait {
                delay: Duration::from_millis(1500),
                limit: SessionLimit::HighCostInterval,
            }
        );
        // low-cost requests are not spaced
        assert_eq!(registry.try_admit("s1", 100, soon), SessionDecision::Admit);

        let later = now + Duration::from_secs(2);
        assert_eq!(registry.try_admit("s1", 1500, later), SessionDecision::Admit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_sleeps_until_admitted() {
        let registry = registry();
        for _ in 0..10 {
            registry.acquire("s1", 10).await;
        }

        let start = Instant::now();
        let waited = registry.acquire("s1", 10).await;

        assert!(waited >= Duration::from_secs(60));
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert_eq!(registry.snapshot("s1").unwrap().window_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_daily_counter_rolls_over() {
        let registry = registry();
        let start = Instant::now();
        registry.try_admit("s1", 10, start);
        registry.try_admit("s1", 10, start + Duration::from_secs(120));
        assert_eq!(registry.snapshot("s1").unwrap().daily_count, 2);

        registry.try_admit("s1", 10, start + DAY + Duration::from_secs(1));
        assert_eq!(registry.snapshot("s1").unwrap().daily_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcomes_and_cleanup() {
        let registry = registry();
        let since = Instant::now();
        registry.record_outcome("s1", Outcome::Success);
        registry.record_outcome("s1", Outcome::Failure(ErrorClass::Retryable));
        registry.record_outcome("s2", Outcome::Success);

        assert_eq!(registry.outcomes_since(since), (2, 1));
        assert_eq!(registry.active_count(Duration::from_secs(60)), 2);

        tokio::time::advance(Duration::from_secs(30)).await;
        registry.record_outcome("s2", Outcome::Success);
        tokio::time::advance(Duration::from_secs(45)).await;

        assert_eq!(registry.cleanup(Duration::from_secs(60)), 1);
        assert!(registry.snapshot("s1").is_none());
        assert!(registry.snapshot("s2").is_some());
        assert_eq!(registry.len(), 1);
    }
}
