//! Sliding-window limiter on job starts.
//!
//! Unlike a token bucket this counts actual starts inside the last `window`,
//! so "2 jobs per minute" never admits a third start within any 60s span.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Admits at most `max` starts per rolling `window`.
#[derive(Debug)]
pub struct RateLimiter {
    max: u32,
    window: Duration,
    starts: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max: max.max(1),
            window,
            starts: VecDeque::with_capacity(max as usize),
        }
    }

    /// `None` when a start is allowed at `now`, otherwise how long to wait.
    pub fn check(&mut self, now: Instant) -> Option<Duration> {
        self.evict(now);
        if (self.starts.len() as u32) < self.max {
            return None;
        }
        self.starts
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
    }

    /// Record a start at `now`.
    pub fn record(&mut self, now: Instant) {
        self.evict(now);
        self.starts.push_back(now);
    }

    /// Check and record in one go.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        match self.check(now) {
            None => {
                self.record(now);
                Ok(())
            }
            Some(wait) => Err(wait),
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(oldest) = self.starts.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.starts.pop_front();
            } else {
                break;
            }
        }
    }
}
