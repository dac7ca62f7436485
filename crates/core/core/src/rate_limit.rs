//! Sliding-window rate limiting for sensitive operations.
//!
//! The limiter is a plain injectable component; owners wrap it in a
//! `Mutex` for concurrent use. Time is passed in by the caller so tests
//! can drive the window directly.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Result of a rate limit check.
#[derive(Debug, Clone)]
pub enum RateLimitDecision {
    /// Attempt is allowed.
    Allowed { remaining: u32 },
    /// Attempt is rate limited.
    Limited {
        reset_at: DateTime<Utc>,
        retry_after_secs: u64,
    },
}

impl RateLimitDecision {
    /// Returns true if the attempt is allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }
}

/// Sliding-window limiter keyed by an arbitrary identifier, typically
/// `"<operation>:<tenant>:<user>"`.
#[derive(Debug, Default)]
pub struct SlidingWindowLimiter {
    attempts: HashMap<String, Vec<DateTime<Utc>>>,
    last_cleanup: Option<DateTime<Utc>>,
}

/// How often `maybe_cleanup` actually sweeps idle entries.
const CLEANUP_INTERVAL_SECS: i64 = 300;

impl SlidingWindowLimiter {
    /// Creates a new limiter.
    pub fn new() -> Self {
        Self {
            attempts: HashMap::new(),
            last_cleanup: None,
        }
    }

    /// Checks whether another attempt is allowed for `key`, recording it
    /// if so. Attempts older than `window` no longer count.
    pub fn check(
        &mut self,
        key: &str,
        max_attempts: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let cutoff = now - window;
        let entry = self.attempts.entry(key.to_string()).or_default();
        entry.retain(|at| *at > cutoff);

        if entry.len() >= max_attempts as usize {
            let oldest = entry.iter().min().copied().unwrap_or(now);
            let reset_at = oldest + window;
            let retry_after = (reset_at - now).num_seconds().max(0) as u64;
            return RateLimitDecision::Limited {
                reset_at,
                retry_after_secs: retry_after,
            };
        }

        entry.push(now);
        RateLimitDecision::Allowed {
            remaining: max_attempts - entry.len() as u32,
        }
    }

    /// Clears recorded attempts for a key.
    pub fn reset(&mut self, key: &str) {
        self.attempts.remove(key);
    }

    /// Evicts entries whose newest attempt is older than `retention`.
    pub fn cleanup(&mut self, retention: Duration, now: DateTime<Utc>) {
        let cutoff = now - retention;
        self.attempts
            .retain(|_, attempts| attempts.iter().any(|at| *at > cutoff));
        self.last_cleanup = Some(now);
    }

    /// Runs `cleanup` when the last sweep is older than the cleanup
    /// interval. Callers invoke this opportunistically on each check.
    pub fn maybe_cleanup(&mut self, retention: Duration, now: DateTime<Utc>) {
        let due = match self.last_cleanup {
            Some(last) => now - last >= Duration::seconds(CLEANUP_INTERVAL_SECS),
            None => true,
        };
        if due {
            self.cleanup(retention, now);
        }
    }

    /// Number of tracked keys.
    pub fn tracked_keys(&self) -> usize {
        self.attempts.len()
    }
}
