//! Shared admission window for high-cost requests
//!
//! Admitted requests are counted in a sliding window shared by all sessions.
//! When the window is full, callers join a strict FIFO queue and are promoted
//! by a periodic sweep as slots free up.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::metrics::METRICS;

/// Global window limits
#[derive(Debug, Clone)]
pub struct GlobalLimits {
    pub requests_per_window: usize,
    pub window: Duration,
    pub sweep_interval: Duration,
}

impl Default for GlobalLimits {
    fn default() -> Self {
        Self {
            requests_per_window: 30,
            window: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

struct Waiter {
    ticket: u64,
    session: String,
    enqueued_at: Instant,
    notify: oneshot::Sender<()>,
}

#[derive(Default)]
struct GlobalState {
    admitted: VecDeque<Instant>,
    queue: VecDeque<Waiter>,
    next_ticket: u64,
}

impl GlobalState {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(at) = self.admitted.front() {
            if now.duration_since(*at) < window {
                break;
            }
            self.admitted.pop_front();
        }
    }
}

/// Window and queue sizes at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GlobalSnapshot {
    pub window_count: usize,
    pub queue_length: usize,
}

/// Global sliding window plus FIFO wait queue
pub struct GlobalAdmission {
    state: Mutex<GlobalState>,
    limits: GlobalLimits,
}

impl GlobalAdmission {
    pub fn new(limits: GlobalLimits) -> Self {
        Self {
            state: Mutex::new(GlobalState::default()),
            limits,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GlobalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a slot in the window, waiting in line if it is full or others are queued
    ///
    /// Returns the time spent queued.
    pub async fn acquire(&self, session: &str) -> Duration {
        let mut notified = {
            let mut state = self.lock();
            let now = Instant::now();
            state.prune(now, self.limits.window);

            if state.queue.is_empty() && state.admitted.len() < self.limits.requests_per_window {
                state.admitted.push_back(now);
                return Duration::ZERO;
            }

            let (tx, rx) = oneshot::channel();
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.queue.push_back(Waiter {
                ticket,
                session: session.to_string(),
                enqueued_at: now,
                notify: tx,
            });
            debug!(
                session = %session,
                ticket,
                position = state.queue.len(),
                "Queued for global admission"
            );
            self.promote_locked(&mut state, now);
            rx
        };

        let start = Instant::now();
        loop {
            match tokio::time::timeout(self.limits.sweep_interval, &mut notified).await {
                Ok(_) => break,
                Err(_) => {
                    self.sweep();
                }
            }
        }

        let waited = start.elapsed();
        METRICS.record_admission_delay("global", waited);
        waited
    }

    /// Promote queue heads into free slots, returning how many were admitted
    pub fn sweep(&self) -> usize {
        let mut state = self.lock();
        let now = Instant::now();
        state.prune(now, self.limits.window);
        self.promote_locked(&mut state, now)
    }

    fn promote_locked(&self, state: &mut GlobalState, now: Instant) -> usize {
        let mut promoted = 0;
        while state.admitted.len() < self.limits.requests_per_window {
            let Some(waiter) = state.queue.pop_front() else {
                break;
            };
            if waiter.notify.is_closed() {
                debug!(ticket = waiter.ticket, "Skipping abandoned waiter");
                continue;
            }
            if waiter.notify.send(()).is_ok() {
                debug!(
                    session = %waiter.session,
                    ticket = waiter.ticket,
                    queued_ms = now.duration_since(waiter.enqueued_at).as_millis() as u64,
                    "Promoted from global queue"
                );
                state.admitted.push_back(now);
                promoted += 1;
            }
        }
        promoted
    }

    pub fn snapshot(&self) -> GlobalSnapshot {
        let mut state = self.lock();
        state.prune(Instant::now(), self.limits.window);
        GlobalSnapshot {
            window_count: state.admitted.len(),
            queue_length: state.queue.len(),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn limits(&self) -> &GlobalLimits {
        &self.limits
    }
}
