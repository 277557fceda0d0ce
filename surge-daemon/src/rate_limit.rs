use std::sync::Arc;

use dashmap::DashMap;

use surge_core::unix_time;

const WINDOW_MS: i64 = 60_000;

/// Sliding one-minute window per (caller, action) pair.
#[derive(Clone, Default)]
pub struct RateLimiter {
    windows: Arc<DashMap<(String, &'static str), Vec<i64>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, key: &str, action: &'static str, limit: usize) -> bool {
        self.check_at(key, action, limit, unix_time())
    }

    fn check_at(&self, key: &str, action: &'static str, limit: usize, now: i64) -> bool {
        let mut window = self
            .windows
            .entry((key.to_string(), action))
            .or_default();

        window.retain(|at| *at > now - WINDOW_MS);

        if window.len() >= limit {
            return false;
        }

        window.push(now);

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enforces_limit_within_window() {
        let limiter = RateLimiter::new();

        for _ in 0..5 {
            assert!(limiter.check_at("alice", "register", 5, 1_000));
        }

        assert!(!limiter.check_at("alice", "register", 5, 1_000));
    }

    #[test]
    fn window_slides() {
        let limiter = RateLimiter::new();

        for _ in 0..5 {
            assert!(limiter.check_at("alice", "register", 5, 1_000));
        }

        assert!(!limiter.check_at("alice", "register", 5, 30_000));

        assert!(limiter.check_at("alice", "register", 5, 61_001));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new();

        assert!(limiter.check_at("alice", "login", 1, 1_000));
        assert!(!limiter.check_at("alice", "login", 1, 1_000));

        assert!(limiter.check_at("bob", "login", 1, 1_000));
        assert!(limiter.check_at("alice", "register", 1, 1_000));
    }
}
