//! Fixed-window rate limiting per client

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use crate::clock::Clock;
use crate::config::RateLimitConfig;

/// Outcome of a rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Request may proceed
    Allowed,
    /// Ceiling reached; retry once the current window closes
    Limited {
        /// Whole seconds until the window resets (at least 1)
        retry_after_secs: u64,
    },
}

/// Counter for one client in one window
#[derive(Debug, Clone, Copy)]
struct Window {
    index: i64,
    count: u32,
}

/// Per-client fixed-window counter
pub struct RateLimiter {
    enabled: bool,
    max_requests: u32,
    window: Duration,
    exempt_paths: Vec<String>,
    counters: DashMap<String, Window>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a new rate limiter
    #[must_use]
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            enabled: config.enabled,
            max_requests: config.max_requests,
            window: config.window,
            exempt_paths: config.exempt_paths.clone(),
            counters: DashMap::new(),
            clock,
        }
    }

    fn window_millis(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX).max(1)
    }

    /// Whether `path` bypasses limiting
    #[must_use]
    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|p| p == path)
    }

    /// Count a request from `client` and decide whether it may proceed
    pub fn check(&self, client: &str) -> RateDecision {
        if !self.enabled {
            return RateDecision::Allowed;
        }

        let now_ms = self.clock.now().timestamp_millis();
        let window_ms = self.window_millis();
        let index = now_ms.div_euclid(window_ms);

        let count = {
            let mut entry = self
                .counters
                .entry(client.to_string())
                .or_insert(Window { index, count: 0 });
            if entry.index != index {
                *entry = Window { index, count: 0 };
            }
            entry.count = entry.count.saturating_add(1);
            entry.count
        };

        if count > self.max_requests {
            let window_end = (index + 1) * window_ms;
            let remaining_ms = u64::try_from(window_end - now_ms).unwrap_or(0);
            let retry_after_secs = remaining_ms.div_ceil(1000).max(1);
            debug!(client = %client, count, retry_after_secs, "Rate limit exceeded");
            RateDecision::Limited { retry_after_secs }
        } else {
            RateDecision::Allowed
        }
    }

    /// Drop counters belonging to closed windows
    pub fn prune(&self) -> usize {
        let current = self.clock.now().timestamp_millis().div_euclid(self.window_millis());
        let before = self.counters.len();
        self.counters.retain(|_, w| w.index == current);
        before - self.counters.len()
    }
}
