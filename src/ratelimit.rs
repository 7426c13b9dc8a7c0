//! Per-client-IP rate limiting for the webhook routes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

/// Entries older than this are swept once the store grows large.
const SWEEP_THRESHOLD: usize = 10_000;

/// Token bucket per client IP behind a single mutex.
pub struct RateLimiter {
    store: Mutex<HashMap<String, Entry>>,
    rps: f64,
    burst: f64,
    ttl: Duration,
}

struct Entry {
    tokens: f64,
    last: Instant,
}

impl RateLimiter {
    pub fn new(rps: u64, burst: u64, ttl: Duration) -> Self {
        let rps = rps as f64;
        let mut burst = burst as f64;
        if burst <= 0.0 {
            burst = rps.max(1.0);
        }
        Self {
            store: Mutex::new(HashMap::new()),
            rps,
            burst,
            ttl,
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());

        if store.len() >= SWEEP_THRESHOLD {
            let ttl = self.ttl;
            store.retain(|_, entry| now.duration_since(entry.last) < ttl);
        }

        let Some(entry) = store.get_mut(key) else {
            store.insert(
                key.to_string(),
                Entry {
                    tokens: self.burst - 1.0,
                    last: now,
                },
            );
            return true;
        };

        let elapsed = now.duration_since(entry.last).as_secs_f64();
        entry.tokens = (entry.tokens + elapsed * self.rps).min(self.burst);
        entry.last = now;

        if entry.tokens < 1.0 {
            return false;
        }
        entry.tokens -= 1.0;
        true
    }
}

/// Axum middleware: 429 when the client's bucket is empty.
pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let ip = client_ip(request.headers(), &request);
    if !limiter.allow(&ip) {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    next.run(request).await
}

fn client_ip(headers: &HeaderMap, request: &Request) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        return real.to_string();
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
