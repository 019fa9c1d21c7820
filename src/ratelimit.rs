//! Per-identity token-bucket rate limiting.
//!
//! Each identity (the client IP as observed by the edge) gets a bucket of
//! `burst` tokens refilled at `rate` tokens per second. Buckets are created
//! on first use and reclaimed by a janitor once idle for five minutes, so the
//! working set is bounded by the number of distinct identities seen recently.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const JANITOR_INTERVAL: Duration = Duration::from_secs(60);
const IDLE_EVICTION_AFTER: Duration = Duration::from_secs(5 * 60);

struct Bucket {
    tokens: f64,
    last_update: Instant,
}

/// Token-bucket limiter keyed by identity string.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    rate: f64,
    burst: f64,
}

impl RateLimiter {
    pub fn new(rate_per_second: u32, burst: u32) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            rate: f64::from(rate_per_second),
            burst: f64::from(burst),
        }
    }

    /// Take one token for `identity`, refilling for elapsed time first.
    /// Returns false when the bucket is empty.
    pub fn allow(&self, identity: &str) -> bool {
        self.allow_at(identity, Instant::now())
    }

    pub(crate) fn allow_at(&self, identity: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock();

        let bucket = buckets.entry(identity.to_string()).or_insert(Bucket {
            tokens: self.burst,
            last_update: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_update).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_update = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop buckets idle for five minutes or more. Returns the number removed.
    pub fn remove_idle(&self, now: Instant) -> usize {
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            now.saturating_duration_since(bucket.last_update) < IDLE_EVICTION_AFTER
        });
        before - buckets.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Periodic reclamation of idle buckets.
    pub fn spawn_janitor(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = self.remove_idle(Instant::now());
                if removed > 0 {
                    debug!(removed, "rate limiter janitor removed idle buckets");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_bounds_immediate_requests() {
        let limiter = RateLimiter::new(1, 3);
        let now = Instant::now();

        assert!(limiter.allow_at("1.2.3.4", now));
        assert!(limiter.allow_at("1.2.3.4", now));
        assert!(limiter.allow_at("1.2.3.4", now));
        assert!(!limiter.allow_at("1.2.3.4", now));
    }

    #[test]
    fn identities_are_independent() {
        let limiter = RateLimiter::new(1, 1);
        let now = Instant::now();

        assert!(limiter.allow_at("1.1.1.1", now));
        assert!(!limiter.allow_at("1.1.1.1", now));
        assert!(limiter.allow_at("2.2.2.2", now));
    }

    #[test]
    fn tokens_refill_at_configured_rate() {
        let limiter = RateLimiter::new(2, 2);
        let now = Instant::now();

        assert!(limiter.allow_at("ip", now));
        assert!(limiter.allow_at("ip", now));
        assert!(!limiter.allow_at("ip", now));

        // 0.5s at 2 tokens/s refills exactly one token.
        assert!(limiter.allow_at("ip", now + Duration::from_millis(500)));
        assert!(!limiter.allow_at("ip", now + Duration::from_millis(500)));
    }

    #[test]
    fn refill_is_capped_at_burst() {
        let limiter = RateLimiter::new(100, 2);
        let now = Instant::now();

        assert!(limiter.allow_at("ip", now));
        // A long idle period must not accumulate more than `burst` tokens.
        let later = now + Duration::from_secs(3600);
        assert!(limiter.allow_at("ip", later));
        assert!(limiter.allow_at("ip", later));
        assert!(!limiter.allow_at("ip", later));
    }

    #[test]
    fn successes_over_window_bounded_by_burst_plus_rate_times_time() {
        let rate = 5;
        let burst = 10;
        let limiter = RateLimiter::new(rate, burst);
        let start = Instant::now();
        let window = 4; // seconds

        let mut allowed = 0;
        // Hammer the limiter every 10ms across the window.
        for tick in 0..=(window * 100) {
            let now = start + Duration::from_millis(tick * 10);
            if limiter.allow_at("ip", now) {
                allowed += 1;
            }
        }

        assert!(allowed <= burst + rate * window as u32);
        // The sustained rate should actually be achievable, not just bounded.
        assert!(allowed >= rate * window as u32);
    }

    #[test]
    fn idle_buckets_are_removed_after_five_minutes() {
        let limiter = RateLimiter::new(1, 1);
        let now = Instant::now();

        limiter.allow_at("stale", now);
        limiter.allow_at("fresh", now + Duration::from_secs(299));
        assert_eq!(limiter.bucket_count(), 2);

        let removed = limiter.remove_idle(now + Duration::from_secs(300));
        assert_eq!(removed, 1);
        assert_eq!(limiter.bucket_count(), 1);
    }
}
