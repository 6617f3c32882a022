//! Fixed-window admission control keyed by client identity.
//!
//! Each named policy (upload, process, global) is an instance of the same
//! primitive configured with its own ceiling and window. A window counter is
//! reset and its deadline advanced the first time it is touched after the
//! deadline passes; the post-increment count is compared against the ceiling.
//! The limiter never propagates its own bookkeeping problems to callers: a
//! poisoned map admits the request and logs a warning.

use crate::config::RatePolicy;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Requests left in the current window (0 when denied).
    pub remaining: u32,
    /// Moment the current window ends and the counter resets.
    pub reset_at: Instant,
    /// Exact wait until `reset_at`, present only on denial.
    pub retry_after: Option<Duration>,
}

struct WindowCounter {
    count: u32,
    reset_at: Instant,
}

/// Fixed-window request counter for one admission policy.
pub struct RateLimiter {
    name: &'static str,
    max_count: u32,
    window: Duration,
    counters: Mutex<HashMap<String, WindowCounter>>,
}

impl RateLimiter {
    /// Build a limiter for a named policy.
    pub fn new(name: &'static str, policy: RatePolicy) -> Self {
        Self {
            name,
            max_count: policy.max_count,
            window: policy.window,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Count a request against `client_key` and decide whether to admit it.
    pub fn admit(&self, client_key: &str) -> RateDecision {
        let now = Instant::now();
        let mut counters = match self.counters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                // Fail open: a broken counter map must not take the service down.
                tracing::warn!(policy = self.name, "Rate limiter state poisoned");
                poisoned.into_inner()
            }
        };

        let counter = counters
            .entry(client_key.to_string())
            .or_insert(WindowCounter {
                count: 0,
                reset_at: now + self.window,
            });
        if now >= counter.reset_at {
            counter.count = 0;
            counter.reset_at = now + self.window;
        }
        counter.count += 1;

        if counter.count > self.max_count {
            tracing::warn!(
                policy = self.name,
                client = client_key,
                count = counter.count,
                max = self.max_count,
                "Request denied by rate limiter"
            );
            RateDecision {
                allowed: false,
                remaining: 0,
                reset_at: counter.reset_at,
                retry_after: Some(counter.reset_at.saturating_duration_since(now)),
            }
        } else {
            RateDecision {
                allowed: true,
                remaining: self.max_count - counter.count,
                reset_at: counter.reset_at,
                retry_after: None,
            }
        }
    }

    /// Drop counters whose window has expired, bounding memory growth.
    pub fn prune(&self) {
        let now = Instant::now();
        let mut counters = match self.counters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        counters.retain(|_, counter| now < counter.reset_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_count: u32, window_ms: u64) -> RatePolicy {
        RatePolicy {
            max_count,
            window: Duration::from_millis(window_ms),
        }
    }

    #[test]
    fn admits_under_the_ceiling() {
        let limiter = RateLimiter::new("test", policy(3, 60_000));
        assert!(limiter.admit("client-a").allowed);
        assert!(limiter.admit("client-a").allowed);
        let third = limiter.admit("client-a");
        assert!(third.allowed);
        assert_eq!(third.remaining, 0);
    }

    #[test]
    fn denies_past_the_ceiling_with_future_reset() {
        let limiter = RateLimiter::new("test", policy(10, 60_000));
        for _ in 0..10 {
            assert!(limiter.admit("client-a").allowed);
        }
        let now = Instant::now();
        let eleventh = limiter.admit("client-a");
        assert!(!eleventh.allowed);
        assert!(eleventh.reset_at > now);
        assert!(eleventh.retry_after.expect("wait duration") > Duration::ZERO);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new("test", policy(1, 60_000));
        assert!(limiter.admit("client-a").allowed);
        assert!(limiter.admit("client-b").allowed);
        assert!(!limiter.admit("client-a").allowed);
    }

    #[test]
    fn fresh_window_admits_after_expiry() {
        let limiter = RateLimiter::new("test", policy(1, 30));
        assert!(limiter.admit("client-a").allowed);
        assert!(!limiter.admit("client-a").allowed);
        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.admit("client-a").allowed);
    }

    #[test]
    fn prune_drops_expired_windows() {
        let limiter = RateLimiter::new("test", policy(5, 10));
        limiter.admit("client-a");
        std::thread::sleep(Duration::from_millis(20));
        limiter.prune();
        let counters = limiter.counters.lock().expect("lock");
        assert!(counters.is_empty());
    }
}
