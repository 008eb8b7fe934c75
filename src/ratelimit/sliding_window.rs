//! Sliding window rate limiting.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy)]
pub enum RateLimitDecision {
    /// Event accepted; `remaining` slots are left in the current window.
    Allowed { remaining: usize },
    /// Event rejected; the window admits another event after `retry_after`.
    Denied { retry_after: Duration },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }

    pub fn retry_after_secs(&self) -> u64 {
        match self {
            RateLimitDecision::Allowed { .. } => 0,
            RateLimitDecision::Denied { retry_after } => retry_after.as_secs().max(1),
        }
    }
}

/// Sliding window of recent event timestamps.
///
/// Each connection exclusively owns one window for its inbound messages.
/// Expired timestamps are purged on every check, so memory stays bounded
/// by `max_events` regardless of traffic shape.
#[derive(Debug)]
pub struct SlidingWindow {
    max_events: usize,
    window: Duration,
    events: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    pub fn new(max_events: usize, window: Duration) -> Self {
        Self {
            max_events,
            window,
            events: Mutex::new(VecDeque::with_capacity(max_events.min(128))),
        }
    }

    /// Record one event if the window has room.
    pub fn check(&self) -> RateLimitDecision {
        let now = Instant::now();
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());

        while let Some(front) = events.front() {
            if now.duration_since(*front) >= self.window {
                events.pop_front();
            } else {
                break;
            }
        }

        if events.len() < self.max_events {
            events.push_back(now);
            RateLimitDecision::Allowed {
                remaining: self.max_events - events.len(),
            }
        } else {
            // Oldest event leaving the window frees the next slot
            let retry_after = events
                .front()
                .map(|front| self.window.saturating_sub(now.duration_since(*front)))
                .unwrap_or(self.window);
            RateLimitDecision::Denied { retry_after }
        }
    }

    /// Number of events currently inside the window.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events
            .iter()
            .filter(|t| now.duration_since(**t) < self.window)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
