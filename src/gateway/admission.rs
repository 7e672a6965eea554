//! Admission control: API-key gate, rate limiting, security headers.
//!
//! These run in front of the pipeline for every route except `/health`,
//! which stays open for monitors.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use tracing::warn;

use crate::config::DEV_API_KEY;

/// Shared admission state, one per process.
pub struct Admission {
    pub require_api_key: bool,
    pub production: bool,
    pub security_headers: bool,
    pub rate_limiter: Option<RateLimiter>,
}

/// Token bucket per caller with whole-bucket refill every window.
///
/// Buckets start full, drain one token per request, and snap back to
/// capacity when the window rolls over. The map is guarded by a plain
/// mutex held only for the bookkeeping.
pub struct RateLimiter {
    capacity: u32,
    window: Duration,
    buckets: Mutex<HashMap<String, Bucket>>,
}

struct Bucket {
    tokens: u32,
    window_start: Instant,
}

impl RateLimiter {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for `key`. Returns false when the bucket is empty.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());

        // Bound the map: evict stale buckets once it grows unreasonable.
        if buckets.len() > 10_000 {
            let window = self.window;
            buckets.retain(|_, b| now.duration_since(b.window_start) < window);
        }

        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            window_start: now,
        });

        if now.duration_since(bucket.window_start) >= self.window {
            bucket.tokens = self.capacity;
            bucket.window_start = now;
        }

        if bucket.tokens == 0 {
            return false;
        }
        bucket.tokens -= 1;
        true
    }
}

/// Reject requests that present neither an API key nor a bearer token.
///
/// Key values are not authenticated here — tenant keys resolve downstream —
/// with one exception: the well-known development key is hard-rejected in
/// production.
pub async fn api_key_gate(
    State(admission): State<Arc<Admission>>,
    req: Request,
    next: Next,
) -> Response {
    if !admission.require_api_key || req.uri().path() == "/health" {
        return next.run(req).await;
    }

    let headers = req.headers();
    let has_bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Bearer "));
    let api_key = headers.get("x-api-key").and_then(|v| v.to_str().ok());

    match (has_bearer, api_key) {
        (false, None) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Missing x-api-key header or bearer token" })),
        )
            .into_response(),
        (_, Some(key)) if admission.production && key == DEV_API_KEY => {
            warn!("development API key rejected in production");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Invalid API key" })),
            )
                .into_response()
        }
        _ => next.run(req).await,
    }
}

/// 429 requests whose caller has drained their bucket. Keyed by API key
/// when present, else client IP. `/health` is exempt so monitors can poll.
pub async fn rate_limit(
    State(admission): State<Arc<Admission>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(limiter) = &admission.rate_limiter else {
        return next.run(req).await;
    };
    if req.uri().path() == "/health" {
        return next.run(req).await;
    }

    let key = client_key(&req);
    if !limiter.check(&key) {
        warn!(client = %key.chars().take(24).collect::<String>(), "rate limit exceeded");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "Too many requests" })),
        )
            .into_response();
    }

    next.run(req).await
}

fn client_key(req: &Request) -> String {
    if let Some(key) = req.headers().get("x-api-key").and_then(|v| v.to_str().ok()) {
        return format!("key:{key}");
    }
    if let Some(ip) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
    {
        return format!("ip:{ip}");
    }
    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return format!("ip:{}", addr.ip());
    }
    "anonymous".to_string()
}

/// Hardening headers on every response, when configured.
pub async fn security_headers(
    State(admission): State<Arc<Admission>>,
    req: Request,
    next: Next,
) -> Response {
    let mut response = next.run(req).await;
    if admission.security_headers {
        let headers = response.headers_mut();
        headers.insert(
            "x-content-type-options",
            HeaderValue::from_static("nosniff"),
        );
        headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
        headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_starts_full_and_drains() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.check("a"));
        assert!(limiter.check("a"));
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
    }

    #[test]
    fn buckets_are_per_key() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
        assert!(limiter.check("b"));
    }

    #[test]
    fn bucket_refills_to_capacity_after_the_window() {
        let limiter = RateLimiter::new(2, Duration::from_millis(20));
        assert!(limiter.check("a"));
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));

        std::thread::sleep(Duration::from_millis(30));
        // Full refill, not partial: both tokens are back.
        assert!(limiter.check("a"));
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
    }

    #[test]
    fn zero_capacity_still_grants_one_request() {
        let limiter = RateLimiter::new(0, Duration::from_secs(60));
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
    }
}
