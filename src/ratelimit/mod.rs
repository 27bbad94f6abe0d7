//! Per-token sliding-window rate limiting for REST calls
//!
//! Each token keeps a log of request instants inside its trailing window.
//! A request is admitted while fewer than `requests_per_window` entries
//! remain after pruning. State is per process.

use crate::auth::RateLimitPolicy;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed {
        limit: u32,
        remaining: u32,
        window: Duration,
        /// Time until the window that starts now has fully elapsed
        reset_after: Duration,
    },
    Limited {
        limit: u32,
        window: Duration,
        retry_after_secs: u64,
    },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

#[derive(Debug, Default)]
struct SlidingWindow {
    hits: VecDeque<Instant>,
    window: Duration,
}

impl SlidingWindow {
    fn prune(&mut self, now: Instant) {
        while self
            .hits
            .front()
            .is_some_and(|oldest| now.saturating_duration_since(*oldest) >= self.window)
        {
            self.hits.pop_front();
        }
    }

    fn is_idle(&self, now: Instant) -> bool {
        self.hits
            .back()
            .map_or(true, |newest| now.saturating_duration_since(*newest) >= self.window)
    }
}

/// Sliding-window request limiter keyed by token id
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: DashMap<String, SlidingWindow>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check and record a request made now
    pub fn check(&self, token_id: &str, policy: &RateLimitPolicy) -> RateDecision {
        self.check_at(token_id, policy, Instant::now())
    }

    /// Check and record a request made at `now`
    pub fn check_at(&self, token_id: &str, policy: &RateLimitPolicy, now: Instant) -> RateDecision {
        let window = policy.window();
        let limit = policy.requests_per_window;

        // The shard lock is held for the whole check, serializing requests per token
        let mut entry = self.windows.entry(token_id.to_string()).or_default();
        let state = entry.value_mut();
        state.window = window;
        state.prune(now);

        let count = state.hits.len();
        if count >= limit as usize {
            let retry_after_secs = state
                .hits
                .front()
                .map(|oldest| retry_after(*oldest + window, now))
                .unwrap_or(1);

            debug!(token_id = %token_id, count, limit, retry_after_secs, "Rate limited");

            return RateDecision::Limited {
                limit,
                window,
                retry_after_secs,
            };
        }

        state.hits.push_back(now);

        RateDecision::Allowed {
            limit,
            remaining: limit - count as u32 - 1,
            window,
            reset_after: window,
        }
    }

    /// Drop windows with no requests inside their trailing window
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, state| !state.is_idle(now));
        before - self.windows.len()
    }

    /// Number of tokens currently tracked
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }

    /// Periodically sweep idle windows
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = self.sweep(Instant::now());
                if removed > 0 {
                    debug!(removed, "Swept idle rate limit windows");
                }
            }
        })
    }
}

/// Whole seconds until `free_at`, never less than one
fn retry_after(free_at: Instant, now: Instant) -> u64 {
    let millis = free_at.saturating_duration_since(now).as_millis() as u64;
    millis.div_ceil(1000).max(1)
}
