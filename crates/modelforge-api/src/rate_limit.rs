//! Sliding-window rate limiting keyed by `(tenant, endpoint)`.
//!
//! A per-key log of request instants is pruned to the window on every
//! check, so the count over any trailing window never exceeds the limit.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after_secs: u64,
}

pub struct RateLimiter {
    window: Duration,
    requests: DashMap<(String, String), VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(window_secs: u64) -> Self {
        Self {
            window: Duration::from_secs(window_secs.max(1)),
            requests: DashMap::new(),
        }
    }

    /// Record-and-check: a denied request is not recorded, so it does not
    /// extend the caller's penalty.
    pub fn check(&self, tenant: &str, endpoint: &str, limit: u32) -> RateDecision {
        let now = Instant::now();
        let key = (tenant.to_string(), endpoint.to_string());
        let mut log = self.requests.entry(key).or_default();

        while let Some(front) = log.front() {
            if now.duration_since(*front) >= self.window {
                log.pop_front();
            } else {
                break;
            }
        }

        if log.len() as u32 >= limit {
            let oldest = *log.front().expect("non-empty at limit");
            let retry_after = self
                .window
                .saturating_sub(now.duration_since(oldest))
                .as_secs()
                .max(1);
            return RateDecision {
                allowed: false,
                remaining: 0,
                retry_after_secs: retry_after,
            };
        }

        log.push_back(now);
        RateDecision {
            allowed: true,
            remaining: limit - log.len() as u32,
            retry_after_secs: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_is_enforced_within_the_window() {
        let limiter = RateLimiter::new(60);
        for i in 0..30 {
            let decision = limiter.check("t1", "predict", 30);
            assert!(decision.allowed, "request {i} should pass");
        }
        let denied = limiter.check("t1", "predict", 30);
        assert!(!denied.allowed);
        assert!(denied.retry_after_secs >= 1);
        assert!(denied.retry_after_secs <= 60);
    }

    #[test]
    fn remaining_counts_down_consistently() {
        let limiter = RateLimiter::new(60);
        let first = limiter.check("t1", "predict", 5);
        assert_eq!(first.remaining, 4);
        let second = limiter.check("t1", "predict", 5);
        assert_eq!(second.remaining, 3);
    }

    #[test]
    fn tenants_and_endpoints_are_independent() {
        let limiter = RateLimiter::new(60);
        for _ in 0..5 {
            limiter.check("t1", "predict", 5);
        }
        assert!(!limiter.check("t1", "predict", 5).allowed);
        assert!(limiter.check("t2", "predict", 5).allowed);
        assert!(limiter.check("t1", "batch", 5).allowed);
    }
}
