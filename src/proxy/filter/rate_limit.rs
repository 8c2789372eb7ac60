use crate::config::RateLimitConfig;
use crate::error::GatewayError;
use crate::proxy::context::RequestContext;
use dashmap::DashMap;
use http::HeaderMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::FilterResult;

/// Per-client fixed-window request counter.
///
/// Each client key owns one window. The window resets lazily on the first
/// request that arrives more than `window` after it started; there is no
/// background timer. Every request increments the count, rejected ones
/// included, so a client that keeps hammering stays limited until the
/// window rolls over.
///
/// Counters are never removed unless idle eviction is enabled, in which
/// case a background task drops windows untouched for longer than the
/// configured idle period.
pub struct RateLimiter {
    windows: DashMap<String, Arc<ClientWindow>>,
    max_requests: u64,
    window_us: u64,
}

/// `tokio::sync::Mutex` is used so that waiting for the lock yields back to
/// the tokio runtime instead of blocking the worker thread.
struct ClientWindow {
    inner: Mutex<WindowState>,
    /// Last access timestamp in microseconds (for GC), updated outside the lock.
    last_access: AtomicU64,
}

struct WindowState {
    count: u64,
    window_start: u64,
}

/// GC runs every this many seconds when idle eviction is enabled.
const GC_INTERVAL_SECS: u64 = 60;

impl RateLimiter {
    pub fn new(cfg: &RateLimitConfig) -> Self {
        Self {
            windows: DashMap::new(),
            max_requests: cfg.max_requests.max(1),
            window_us: cfg.window.as_micros() as u64,
        }
    }

    /// Returns `true` if allowed, `false` if rate limited.
    pub async fn check(&self, key: &str) -> bool {
        self.check_at(key, now_us()).await
    }

    /// `now` is in microseconds on the limiter's clock.
    pub async fn check_at(&self, key: &str, now: u64) -> bool {
        // Fast path: key already exists, no allocation.
        let window = if let Some(entry) = self.windows.get(key) {
            entry.value().clone()
        } else {
            self.windows
                .entry(key.to_string())
                .or_insert_with(|| {
                    Arc::new(ClientWindow {
                        inner: Mutex::new(WindowState {
                            count: 0,
                            window_start: now,
                        }),
                        last_access: AtomicU64::new(now),
                    })
                })
                .clone()
        };

        window.last_access.store(now, Ordering::Relaxed);

        let mut w = window.inner.lock().await;
        if now.saturating_sub(w.window_start) > self.window_us {
            w.count = 0;
            w.window_start = now;
        }
        w.count += 1;
        w.count <= self.max_requests
    }

    /// Number of client keys currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }

    /// Spawn a background tokio task that periodically evicts windows idle
    /// for longer than `idle`. Call this once after constructing the limiter.
    pub fn start_gc(self: &Arc<Self>, idle: Duration) {
        let limiter = Arc::clone(self);
        let idle_us = idle.as_micros() as u64;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(GC_INTERVAL_SECS));
            loop {
                interval.tick().await;
                let evicted = limiter.evict_idle(now_us(), idle_us);
                if evicted > 0 {
                    tracing::debug!(
                        "filter: rate_limit: evicted idle clients, count={}, remaining={}",
                        evicted,
                        limiter.tracked_clients()
                    );
                }
            }
        });
    }

    fn evict_idle(&self, now: u64, idle_us: u64) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, v| now.saturating_sub(v.last_access.load(Ordering::Relaxed)) <= idle_us);
        before.saturating_sub(self.windows.len())
    }
}

fn now_us() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}

/// Key a request by client address. With `trust_forwarded_for` the
/// left-most `X-Forwarded-For` entry wins over the TCP peer.
pub fn client_key(peer: SocketAddr, headers: &HeaderMap, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }
    peer.ip().to_string()
}

pub(super) async fn rate_limit_on_request(
    limiter: &RateLimiter,
    ctx: &mut RequestContext,
) -> FilterResult {
    if !limiter.check(&ctx.client_key).await {
        tracing::debug!(
            "filter: rate_limit: rejected, client={}, path={}",
            ctx.client_key,
            ctx.path
        );
        metrics::counter!("gateway_rate_limit_rejected_total").increment(1);
        return FilterResult::Reject(GatewayError::RateLimited);
    }

    metrics::counter!("gateway_rate_limit_allowed_total").increment(1);
    FilterResult::Continue
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE_US: u64 = 60_000_000;

    fn limiter(max: u64) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            max_requests: max,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_fifty_first_request_rejected() {
        let limiter = limiter(50);
        for i in 0..50 {
            assert!(
                limiter.check_at("10.0.0.1", 1_000 + i).await,
                "request {} should be allowed",
                i + 1
            );
        }
        assert!(!limiter.check_at("10.0.0.1", 2_000).await);
    }

    #[tokio::test]
    async fn test_window_resets_lazily() {
        let limiter = limiter(2);
        let t0 = 5_000_000;
        assert!(limiter.check_at("c", t0).await);
        assert!(limiter.check_at("c", t0 + 1).await);
        assert!(!limiter.check_at("c", t0 + 2).await);

        // Exactly one window later is still the same window.
        assert!(!limiter.check_at("c", t0 + MINUTE_US).await);

        assert!(limiter.check_at("c", t0 + MINUTE_US + 1).await);
        assert!(limiter.check_at("c", t0 + MINUTE_US + 2).await);
        assert!(!limiter.check_at("c", t0 + MINUTE_US + 3).await);
    }

    #[tokio::test]
    async fn test_rejected_requests_still_count() {
        let limiter = limiter(1);
        assert!(limiter.check_at("c", 0).await);
        for i in 1..10 {
            assert!(!limiter.check_at("c", i).await);
        }
        let w = limiter.windows.get("c").unwrap().clone();
        assert_eq!(w.inner.lock().await.count, 10);
    }

    #[tokio::test]
    async fn test_different_clients_independent() {
        let limiter = limiter(2);
        assert!(limiter.check_at("a", 0).await);
        assert!(limiter.check_at("a", 1).await);
        assert!(!limiter.check_at("a", 2).await);

        assert!(limiter.check_at("b", 3).await);
        assert!(limiter.check_at("b", 4).await);
        assert!(!limiter.check_at("b", 5).await);
        assert_eq!(limiter.tracked_clients(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_requests_same_client() {
        let limiter = Arc::new(limiter(50));
        let mut handles = Vec::new();
        for _ in 0..100 {
            let l = limiter.clone();
            handles.push(tokio::spawn(async move { l.check_at("shared", 10).await }));
        }
        let mut allowed = 0;
        for h in handles {
            if h.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 50);
    }

    #[tokio::test]
    async fn test_evict_idle() {
        let limiter = limiter(5);
        limiter.check_at("old", 0).await;
        limiter.check_at("fresh", 10 * MINUTE_US).await;

        let evicted = limiter.evict_idle(10 * MINUTE_US + 1, 5 * MINUTE_US);
        assert_eq!(evicted, 1);
        assert_eq!(limiter.tracked_clients(), 1);
        assert!(limiter.windows.contains_key("fresh"));
    }

    #[test]
    fn test_client_key() {
        let peer: SocketAddr = "192.168.1.7:51234".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());

        assert_eq!(client_key(peer, &headers, false), "192.168.1.7");
        assert_eq!(client_key(peer, &headers, true), "203.0.113.9");
        assert_eq!(client_key(peer, &HeaderMap::new(), true), "192.168.1.7");
    }
}
