//! Per-identity, per-tier sliding-window rate limiter.
//!
//! The window admits at most N calls; the (N+1)th is denied and becomes
//! admissible again exactly one window after the oldest recorded call.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use fg_domain::config::RateLimitConfig;
use fg_domain::tool::ToolTier;
use fg_domain::{Error, Result};

pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<(String, ToolTier), VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn limit_for(&self, tier: ToolTier) -> u32 {
        match tier {
            ToolTier::Fundamental => self.config.fundamental_per_window,
            ToolTier::Advanced => self.config.advanced_per_window,
            ToolTier::Professional => self.config.professional_per_window,
        }
    }

    /// Check and record one call attempt.
    pub fn check(&self, identity: &str, tier: ToolTier) -> Result<()> {
        self.check_at(identity, tier, Instant::now())
    }

    fn check_at(&self, identity: &str, tier: ToolTier, now: Instant) -> Result<()> {
        let window = Duration::from_secs(self.config.window_secs);
        let limit = self.limit_for(tier) as usize;

        let mut windows = self.windows.lock();
        let calls = windows
            .entry((identity.to_string(), tier))
            .or_default();

        while calls.front().is_some_and(|t| now.duration_since(*t) >= window) {
            calls.pop_front();
        }

        if calls.len() >= limit {
            let oldest = *calls.front().expect("non-empty at limit");
            let retry_after = window.saturating_sub(now.duration_since(oldest));
            return Err(Error::RateLimitExceeded {
                retry_after_secs: retry_after.as_secs().max(1),
            });
        }

        calls.push_back(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(per_window: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            window_secs,
            fundamental_per_window: per_window,
            advanced_per_window: per_window,
            professional_per_window: per_window,
        })
    }

    #[test]
    fn denies_n_plus_one_and_readmits_after_window() {
        let limiter = limiter(3, 60);
        let start = Instant::now();

        for _ in 0..3 {
            limiter.check_at("alice", ToolTier::Advanced, start).unwrap();
        }
        let err = limiter
            .check_at("alice", ToolTier::Advanced, start)
            .unwrap_err();
        assert!(matches!(err, Error::RateLimitExceeded { .. }));

        // Exactly one window after the oldest call, a slot opens.
        let later = start + Duration::from_secs(60);
        limiter.check_at("alice", ToolTier::Advanced, later).unwrap();
    }

    #[test]
    fn identities_are_isolated() {
        let limiter = limiter(1, 60);
        let now = Instant::now();
        limiter.check_at("alice", ToolTier::Fundamental, now).unwrap();
        limiter.check_at("bob", ToolTier::Fundamental, now).unwrap();
        assert!(limiter.check_at("alice", ToolTier::Fundamental, now).is_err());
    }

    #[test]
    fn tiers_are_isolated() {
        let limiter = limiter(1, 60);
        let now = Instant::now();
        limiter.check_at("alice", ToolTier::Fundamental, now).unwrap();
        limiter.check_at("alice", ToolTier::Professional, now).unwrap();
        assert!(limiter
            .check_at("alice", ToolTier::Professional, now)
            .is_err());
    }

    #[test]
    fn retry_after_is_reported() {
        let limiter = limiter(1, 60);
        let start = Instant::now();
        limiter.check_at("alice", ToolTier::Advanced, start).unwrap();
        let err = limiter
            .check_at("alice", ToolTier::Advanced, start + Duration::from_secs(10))
            .unwrap_err();
        match err {
            Error::RateLimitExceeded { retry_after_secs } => {
                assert!(retry_after_secs <= 50 && retry_after_secs >= 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
