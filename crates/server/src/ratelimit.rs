//! Token-bucket rate limiting for the HTTP edge.
//!
//! Two layers:
//! - per client IP, applied to every request before authentication
//! - per user, applied after authentication resolved a session
//!
//! Each layer tracks last access per key so stale keys can be evicted. The
//! governor limiter cannot drop individual keys, so after a large eviction
//! (or every few minutes) it is rebuilt from its quota.
//!
//! Forwarded headers (`X-Forwarded-For`, `X-Real-IP`) are only read when the
//! direct peer is listed in `trusted_proxies`. `["*"]` trusts every peer.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::{DashMap, mapref::entry::Entry};
use governor::{
    Quota, RateLimiter, clock::DefaultClock, middleware::NoOpMiddleware, state::InMemoryState,
};
use ipnet::IpNet;
use std::{
    net::{IpAddr, SocketAddr},
    num::NonZeroU32,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use teldrive_core::config::RateLimitConfig;

type KeyedLimiter =
    RateLimiter<String, DashMap<String, InMemoryState>, DefaultClock, NoOpMiddleware>;

/// Rebuild once evictions reach this fraction of tracked keys.
const REBUILD_EVICTION_THRESHOLD_FRACTION: f64 = 0.10;

/// Rebuild once at least this many keys were evicted.
const REBUILD_EVICTION_MIN_COUNT: usize = 100;

/// Rebuild at least this often while evictions happen.
const REBUILD_MIN_INTERVAL: Duration = Duration::from_secs(300);

/// Retry hint returned when the key table is full.
const AT_CAPACITY_RETRY_SECS: u64 = 60;

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One keyed limiter with its eviction bookkeeping.
struct Bucket {
    name: &'static str,
    limiter: RwLock<KeyedLimiter>,
    quota: Quota,
    last_access: DashMap<String, Instant>,
    last_rebuild: RwLock<Instant>,
    at_capacity_warned: AtomicBool,
}

impl Bucket {
    fn new(name: &'static str, quota: Quota) -> Self {
        Self {
            name,
            limiter: RwLock::new(RateLimiter::dashmap(quota)),
            quota,
            last_access: DashMap::new(),
            last_rebuild: RwLock::new(Instant::now()),
            at_capacity_warned: AtomicBool::new(false),
        }
    }

    fn check(&self, key: &str, max_entries: u32) -> Result<(), RateLimitError> {
        let now = Instant::now();

        // len() must not run while an entry guard is held.
        let current_len = self.last_access.len();
        let at_capacity = current_len >= max_entries as usize;

        match self.last_access.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.insert(now);
            }
            Entry::Vacant(entry) => {
                if at_capacity {
                    if !self.at_capacity_warned.swap(true, Ordering::Relaxed) {
                        tracing::warn!(
                            current_entries = current_len,
                            max_entries,
                            limiter = self.name,
                            "rate limiter at capacity, rejecting new keys"
                        );
                    }
                    return Err(RateLimitError {
                        retry_after_secs: AT_CAPACITY_RETRY_SECS,
                        reason: RateLimitReason::AtCapacity,
                    });
                }
                entry.insert(now);
            }
        }

        let limiter = read_lock(&self.limiter);
        limiter.check_key(&key.to_string()).map_err(|not_until| {
            let wait = not_until.wait_time_from(governor::clock::Clock::now(&DefaultClock::default()));
            RateLimitError {
                retry_after_secs: wait.as_secs() + 1,
                reason: RateLimitReason::RateLimited,
            }
        })
    }

    /// Drop keys idle for longer than `ttl`, rebuilding the limiter when worthwhile.
    fn evict(&self, ttl: Duration, now: Instant) -> usize {
        let stale: Vec<String> = self
            .last_access
            .iter()
            .filter(|entry| now.duration_since(*entry.value()) > ttl)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for key in stale {
            // Re-check under the entry lock; the key may have been touched since.
            if self
                .last_access
                .remove_if(&key, |_, last| now.duration_since(*last) > ttl)
                .is_some()
            {
                evicted += 1;
            }
        }
        if evicted == 0 {
            return 0;
        }

        let before = self.last_access.len() + evicted;
        if self.should_rebuild(evicted, before, now) {
            *write_lock(&self.limiter) = RateLimiter::dashmap(self.quota);
            *write_lock(&self.last_rebuild) = Instant::now();
            tracing::debug!(
                limiter = self.name,
                evicted,
                remaining = self.last_access.len(),
                "rebuilt rate limiter after cleanup"
            );
        }
        self.at_capacity_warned.store(false, Ordering::Relaxed);
        evicted
    }

    fn should_rebuild(&self, evicted: usize, before: usize, now: Instant) -> bool {
        let by_fraction = (before as f64 * REBUILD_EVICTION_THRESHOLD_FRACTION) as usize;
        if evicted >= by_fraction.max(REBUILD_EVICTION_MIN_COUNT) {
            return true;
        }
        now.duration_since(*read_lock(&self.last_rebuild)) >= REBUILD_MIN_INTERVAL
    }
}

struct RateLimitInner {
    ip: Bucket,
    user: Bucket,
    trusted_proxies: TrustedProxies,
    max_entries: u32,
    entry_ttl: Duration,
    connect_info_warned: AtomicBool,
}

/// Rate limiter state shared across requests.
#[derive(Clone)]
pub struct RateLimitState {
    inner: Option<Arc<RateLimitInner>>,
}

#[derive(Clone, Debug)]
enum TrustedEntry {
    Ip(IpAddr),
    Cidr(IpNet),
}

#[derive(Clone, Debug)]
enum TrustedProxies {
    None,
    All,
    List(Vec<TrustedEntry>),
}

impl TrustedProxies {
    fn from_config(proxies: &[String]) -> Self {
        if proxies.is_empty() {
            return Self::None;
        }
        if proxies.len() == 1 && proxies[0] == "*" {
            return Self::All;
        }
        let entries = proxies
            .iter()
            .filter_map(|p| {
                let parsed = if p.contains('/') {
                    p.parse::<IpNet>().map(TrustedEntry::Cidr).map_err(|e| e.to_string())
                } else {
                    p.parse::<IpAddr>().map(TrustedEntry::Ip).map_err(|e| e.to_string())
                };
                match parsed {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        tracing::warn!(proxy = %p, error = %e, "ignoring invalid trusted proxy");
                        None
                    }
                }
            })
            .collect();
        Self::List(entries)
    }

    fn is_trusted(&self, connection_ip: &str) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::List(entries) => {
                let Ok(ip) = connection_ip.parse::<IpAddr>() else {
                    return false;
                };
                entries.iter().any(|entry| match entry {
                    TrustedEntry::Ip(trusted) => *trusted == ip,
                    TrustedEntry::Cidr(network) => network.contains(&ip),
                })
            }
        }
    }
}

fn per_minute(requests: u32, burst: u32) -> Quota {
    Quota::per_minute(NonZeroU32::new(requests).unwrap_or(NonZeroU32::MIN))
        .allow_burst(NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN))
}

impl RateLimitState {
    pub fn new(config: &RateLimitConfig) -> Self {
        if !config.enabled {
            return Self { inner: None };
        }
        let ip_quota = per_minute(config.ip_requests_per_minute, config.burst_size);
        // Authenticated users get twice the burst of anonymous peers.
        let user_quota = per_minute(
            config.user_requests_per_minute,
            config.burst_size.saturating_mul(2),
        );
        Self {
            inner: Some(Arc::new(RateLimitInner {
                ip: Bucket::new("ip", ip_quota),
                user: Bucket::new("user", user_quota),
                trusted_proxies: TrustedProxies::from_config(&config.trusted_proxies),
                max_entries: config.max_entries,
                entry_ttl: Duration::from_secs(config.entry_ttl_secs),
                connect_info_warned: AtomicBool::new(false),
            })),
        }
    }

    pub fn check_ip(&self, ip: &str) -> Result<(), RateLimitError> {
        match &self.inner {
            Some(inner) => inner.ip.check(ip, inner.max_entries),
            None => Ok(()),
        }
    }

    pub fn check_user(&self, user_id: i64) -> Result<(), RateLimitError> {
        match &self.inner {
            Some(inner) => inner.user.check(&user_id.to_string(), inner.max_entries),
            None => Ok(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Evict stale keys from both layers. Returns the number evicted.
    pub fn cleanup(&self) -> usize {
        let Some(inner) = &self.inner else {
            return 0;
        };
        let now = Instant::now();
        let ip_evicted = inner.ip.evict(inner.entry_ttl, now);
        let user_evicted = inner.user.evict(inner.entry_ttl, now);
        if ip_evicted + user_evicted > 0 {
            tracing::debug!(
                ip_evicted,
                user_evicted,
                ip_entries = inner.ip.last_access.len(),
                user_entries = inner.user.last_access.len(),
                "rate limiter cleanup completed"
            );
        }
        ip_evicted + user_evicted
    }

    /// Tracked `(ip, user)` key counts.
    pub fn entry_count(&self) -> (usize, usize) {
        match &self.inner {
            Some(inner) => (inner.ip.last_access.len(), inner.user.last_access.len()),
            None => (0, 0),
        }
    }

    fn warn_connect_info_missing(&self) {
        if let Some(inner) = &self.inner
            && !inner.connect_info_warned.swap(true, Ordering::Relaxed)
        {
            tracing::warn!(
                "ConnectInfo not available for rate limiting; all peers share the 'unknown' bucket. \
                 Serve with into_make_service_with_connect_info::<SocketAddr>()."
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitReason {
    RateLimited,
    /// The key table is full and cannot track a new client.
    AtCapacity,
}

#[derive(Debug)]
pub struct RateLimitError {
    pub retry_after_secs: u64,
    pub reason: RateLimitReason,
}

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        let (code, message) = match self.reason {
            RateLimitReason::RateLimited => (
                "rate_limit_exceeded",
                format!("rate limit exceeded, retry after {} seconds", self.retry_after_secs),
            ),
            RateLimitReason::AtCapacity => (
                "rate_limiter_at_capacity",
                "server is under heavy load, retry later".to_string(),
            ),
        };
        let body = serde_json::json!({
            "code": code,
            "message": message,
            "retry_after": self.retry_after_secs,
        });
        (
            StatusCode::TOO_MANY_REQUESTS,
            [("Retry-After", self.retry_after_secs.to_string())],
            axum::Json(body),
        )
            .into_response()
    }
}

fn extract_forwarded_ip(req: &Request<Body>) -> Option<String> {
    if let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(s) = forwarded.to_str()
        && let Some(ip) = s.split(',').next()
    {
        return Some(ip.trim().to_string());
    }
    req.headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
}

fn extract_connection_ip(req: &Request<Body>) -> Option<String> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
}

fn extract_ip(req: &Request<Body>, state: &RateLimitState) -> String {
    let Some(inner) = &state.inner else {
        return "unknown".to_string();
    };
    let connection_ip = extract_connection_ip(req);
    let trust_headers = match (&connection_ip, &inner.trusted_proxies) {
        (None, TrustedProxies::All) => true,
        (None, _) => false,
        (Some(ip), proxies) => proxies.is_trusted(ip),
    };
    if trust_headers && let Some(forwarded) = extract_forwarded_ip(req) {
        return forwarded;
    }
    connection_ip.unwrap_or_else(|| {
        state.warn_connect_info_missing();
        "unknown".to_string()
    })
}

/// Per-IP rate limiting; runs before authentication.
pub async fn ip_rate_limit_middleware(
    State(rate_limit): State<RateLimitState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if !rate_limit.is_enabled() {
        return next.run(req).await;
    }
    let ip = extract_ip(&req, &rate_limit);
    match rate_limit.check_ip(&ip) {
        Ok(()) => next.run(req).await,
        Err(e) => e.into_response(),
    }
}

/// Per-user rate limiting; unauthenticated requests pass through.
pub async fn user_rate_limit_middleware(
    State(rate_limit): State<RateLimitState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if !rate_limit.is_enabled() {
        return next.run(req).await;
    }
    match req.extensions().get::<UserIdExtension>() {
        Some(user) => match rate_limit.check_user(user.0) {
            Ok(()) => next.run(req).await,
            Err(e) => e.into_response(),
        },
        None => next.run(req).await,
    }
}

/// Authenticated user id, set by the auth middleware.
#[derive(Clone, Copy, Debug)]
pub struct UserIdExtension(pub i64);

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled(config: RateLimitConfig) -> RateLimitState {
        RateLimitState::new(&RateLimitConfig {
            enabled: true,
            ..config
        })
    }

    #[test]
    fn test_disabled_allows_everything() {
        let state = RateLimitState::new(&RateLimitConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(!state.is_enabled());
        assert!(state.check_ip("127.0.0.1").is_ok());
        assert!(state.check_user(7).is_ok());
        assert_eq!(state.cleanup(), 0);
    }

    #[test]
    fn test_ip_burst_then_limited() {
        let state = enabled(RateLimitConfig {
            ip_requests_per_minute: 60,
            burst_size: 5,
            max_entries: 1000,
            ..Default::default()
        });
        for _ in 0..5 {
            assert!(state.check_ip("127.0.0.1").is_ok());
        }
        let err = state.check_ip("127.0.0.1").unwrap_err();
        assert_eq!(err.reason, RateLimitReason::RateLimited);
        assert!(err.retry_after_secs >= 1);
        assert!(state.check_ip("192.168.1.1").is_ok());
    }

    #[test]
    fn test_user_bucket_has_double_burst() {
        let state = enabled(RateLimitConfig {
            user_requests_per_minute: 60,
            burst_size: 2,
            max_entries: 1000,
            ..Default::default()
        });
        for _ in 0..4 {
            assert!(state.check_user(1).is_ok());
        }
        assert!(state.check_user(1).is_err());
        assert!(state.check_user(2).is_ok());
    }

    #[test]
    fn test_max_entries_rejects_new_keys() {
        let state = enabled(RateLimitConfig {
            ip_requests_per_minute: 60,
            burst_size: 5,
            max_entries: 2,
            ..Default::default()
        });
        assert!(state.check_ip("1.1.1.1").is_ok());
        assert!(state.check_ip("2.2.2.2").is_ok());
        let err = state.check_ip("3.3.3.3").unwrap_err();
        assert_eq!(err.reason, RateLimitReason::AtCapacity);
        assert!(state.check_ip("1.1.1.1").is_ok());
    }

    #[test]
    fn test_cleanup_evicts_stale_keys() {
        let state = enabled(RateLimitConfig {
            max_entries: 1000,
            entry_ttl_secs: 0,
            ..Default::default()
        });
        assert!(state.check_ip("1.1.1.1").is_ok());
        assert!(state.check_user(9).is_ok());
        assert_eq!(state.entry_count(), (1, 1));

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(state.cleanup(), 2);
        assert_eq!(state.entry_count(), (0, 0));
    }

    #[test]
    fn test_trusted_proxies() {
        assert!(!TrustedProxies::from_config(&[]).is_trusted("127.0.0.1"));
        assert!(TrustedProxies::from_config(&["*".to_string()]).is_trusted("anything"));

        let proxies = TrustedProxies::from_config(&[
            "127.0.0.1".to_string(),
            "10.0.0.0/8".to_string(),
            "not-an-ip".to_string(),
        ]);
        assert!(proxies.is_trusted("127.0.0.1"));
        assert!(proxies.is_trusted("10.255.255.255"));
        assert!(!proxies.is_trusted("192.168.1.1"));
    }

    #[test]
    fn test_forwarded_header_needs_trusted_peer() {
        let state = enabled(RateLimitConfig {
            trusted_proxies: vec!["10.0.0.1".to_string()],
            ..Default::default()
        });
        let mut req = Request::builder()
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 1], 4000))));
        assert_eq!(extract_ip(&req, &state), "203.0.113.9");

        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 1], 4000))));
        assert_eq!(extract_ip(&req, &state), "192.0.2.1");
    }
}
