//! Rate Limiter
//!
//! Fixed-window request budget for the upstream service, kept in sync with
//! the quota headers the upstream returns.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per window
    pub max_requests: u64,
    /// Length of one window
    pub window: Duration,
}

impl Default for RateLimitConfig {
    /// ip-api free tier: 15 batch requests per minute.
    fn default() -> Self {
        Self {
            max_requests: 15,
            window: Duration::from_secs(60),
        }
    }
}

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitResult {
    /// Request is allowed
    Allowed { remaining: u64 },
    /// Request is rate limited
    Limited { retry_after_ms: u64 },
}

struct Window {
    /// Requests left in the current window
    remaining: u64,
    /// When the current window ends
    resets_at: Instant,
}

/// Upstream request budget.
///
/// Every upstream call consumes one request from the current window. The
/// upstream reports its own view of the quota after each response, which
/// overrides the local estimate so clock drift and restarts do not cause
/// 429s.
pub struct RateLimiter {
    config: RateLimitConfig,
    window: Mutex<Window>,
}

impl RateLimiter {
    /// Create a new rate limiter with a full budget.
    pub fn new(config: RateLimitConfig) -> Self {
        let window = Window {
            remaining: config.max_requests,
            resets_at: Instant::now() + config.window,
        };
        Self {
            config,
            window: Mutex::new(window),
        }
    }

    /// Try to take one request from the budget.
    pub fn check(&self) -> RateLimitResult {
        let now = Instant::now();
        let mut window = self.window.lock();

        if now >= window.resets_at {
            window.remaining = self.config.max_requests;
            window.resets_at = now + self.config.window;
        }

        if window.remaining == 0 {
            let wait = window.resets_at.saturating_duration_since(now);
            return RateLimitResult::Limited {
                retry_after_ms: wait.as_millis() as u64,
            };
        }

        window.remaining -= 1;
        RateLimitResult::Allowed {
            remaining: window.remaining,
        }
    }

    /// Wait until a request is allowed, then take it.
    pub async fn acquire(&self) {
        loop {
            match self.check() {
                RateLimitResult::Allowed { .. } => return,
                RateLimitResult::Limited { retry_after_ms } => {
                    tracing::debug!("upstream budget exhausted, waiting {}ms", retry_after_ms);
                    tokio::time::sleep(Duration::from_millis(retry_after_ms.max(1))).await;
                }
            }
        }
    }

    /// Adopt the quota reported by the upstream.
    ///
    /// `remaining` is the number of requests left and `ttl` the time until
    /// the upstream window resets.
    pub fn observe(&self, remaining: u64, ttl: Duration) {
        let mut window = self.window.lock();
        window.remaining = remaining.min(self.config.max_requests);
        window.resets_at = Instant::now() + ttl;
    }

    /// Requests left in the current window.
    pub fn remaining(&self) -> u64 {
        let window = self.window.lock();
        if Instant::now() >= window.resets_at {
            self.config.max_requests
        } else {
            window.remaining
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
