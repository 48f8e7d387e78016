//! Per-IP rate limiting
//!
//! One atomic counter per client IP, all cleared together once per window by
//! a background task. The ceiling is a hard cap: once a counter reaches it,
//! further requests in the same window are rejected without incrementing.

use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug)]
struct RateCounter {
    count: AtomicU64,
    /// Unix timestamp of the most recent request
    last_hit: AtomicI64,
}

impl RateCounter {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            last_hit: AtomicI64::new(0),
        }
    }
}

/// Rate limit result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed { remaining: u64 },
    Denied { retry_after_secs: u64 },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    counters: Arc<DashMap<IpAddr, RateCounter>>,
    window: Duration,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            counters: Arc::new(DashMap::new()),
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Count a request from `ip` against `ceiling`; a ceiling of 0 always allows
    pub fn check(&self, ip: IpAddr, ceiling: u64) -> RateLimitResult {
        if ceiling == 0 {
            return RateLimitResult::Allowed { remaining: u64::MAX };
        }

        let counter = self.counters.entry(ip).or_insert_with(RateCounter::new);
        counter
            .last_hit
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);

        let result = counter
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < ceiling).then_some(n + 1)
            });

        match result {
            Ok(previous) => RateLimitResult::Allowed {
                remaining: ceiling - previous - 1,
            },
            Err(_) => {
                debug!(ip = %ip, ceiling, "Rate limit exceeded");
                RateLimitResult::Denied {
                    retry_after_secs: self.window.as_secs().max(1),
                }
            }
        }
    }

    /// Current count for `ip` in this window
    pub fn count(&self, ip: &IpAddr) -> u64 {
        self.counters
            .get(ip)
            .map(|c| c.count.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Unix timestamp of the last request from `ip`
    pub fn last_hit(&self, ip: &IpAddr) -> Option<i64> {
        self.counters.get(ip).map(|c| c.last_hit.load(Ordering::Relaxed))
    }

    /// Clear every counter
    pub fn reset(&self) {
        self.counters.clear();
    }

    /// Reset all counters once per window until `shutdown` flips to true
    pub fn spawn_reset_task(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(limiter.window);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => limiter.reset(),
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Rate limit reset task stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_ceiling_is_hard_cap() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        for i in 0..5 {
            assert_eq!(
                limiter.check(ip(1), 5),
                RateLimitResult::Allowed { remaining: 4 - i }
            );
        }
        assert_eq!(
            limiter.check(ip(1), 5),
            RateLimitResult::Denied { retry_after_secs: 1 }
        );
        assert!(!limiter.check(ip(1), 5).is_allowed());
        assert_eq!(limiter.count(&ip(1)), 5);
        assert!(limiter.last_hit(&ip(1)).is_some());
    }

    #[test]
    fn test_counters_are_per_ip() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        assert!(limiter.check(ip(1), 1).is_allowed());
        assert!(!limiter.check(ip(1), 1).is_allowed());
        assert!(limiter.check(ip(2), 1).is_allowed());
    }

    #[test]
    fn test_reset_allows_again() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        for _ in 0..3 {
            limiter.check(ip(1), 3);
        }
        assert!(!limiter.check(ip(1), 3).is_allowed());
        limiter.reset();
        assert!(limiter.check(ip(1), 3).is_allowed());
    }

    #[test]
    fn test_zero_ceiling_disables() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        for _ in 0..100 {
            assert!(limiter.check(ip(1), 0).is_allowed());
        }
        assert_eq!(limiter.count(&ip(1)), 0);
    }

    #[tokio::test]
    async fn test_reset_task_clears_and_stops() {
        let limiter = RateLimiter::new(Duration::from_millis(50));
        let (tx, rx) = watch::channel(false);
        let handle = limiter.spawn_reset_task(rx);

        limiter.check(ip(1), 1);
        assert!(!limiter.check(ip(1), 1).is_allowed());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(limiter.check(ip(1), 1).is_allowed());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
