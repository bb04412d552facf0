use crate::config::LimitPolicy;
use axum::http::{self, HeaderMap, header::HeaderValue};
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};

/// Fixed-window request counter keyed by an arbitrary string (IP, email).
///
/// A bucket is created lazily on the first request of a window and replaced
/// once `now >= reset_at`; counts never carry over into the next window.
#[derive(Clone)]
pub struct FixedWindowLimiter {
    name: &'static str,
    policy: LimitPolicy,
    buckets: Arc<Mutex<HashMap<String, RateBucket>>>,
}

#[derive(Debug, Clone, Copy)]
struct RateBucket {
    count: u32,
    reset_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_after: Duration,
}

impl FixedWindowLimiter {
    pub fn new(name: &'static str, policy: LimitPolicy) -> Self {
        Self {
            name,
            policy,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn check(&self, key: &str) -> RateDecision {
        self.check_at(key, Instant::now()).await
    }

    pub async fn check_at(&self, key: &str, now: Instant) -> RateDecision {
        let mut guard = self.buckets.lock().await;
        let bucket = guard.entry(key.to_string()).or_insert(RateBucket {
            count: 0,
            reset_at: now + self.policy.window,
        });
        if now >= bucket.reset_at {
            *bucket = RateBucket {
                count: 0,
                reset_at: now + self.policy.window,
            };
        }
        bucket.count = bucket.count.saturating_add(1);

        RateDecision {
            allowed: bucket.count <= self.policy.max,
            limit: self.policy.max,
            remaining: self.policy.max.saturating_sub(bucket.count),
            reset_after: bucket.reset_at.saturating_duration_since(now),
        }
    }

    /// Drops buckets whose window has already closed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.buckets.lock().await;
        let before = guard.len();
        guard.retain(|_, bucket| bucket.reset_at > now);
        before - guard.len()
    }

    #[cfg(test)]
    pub(crate) async fn count_of(&self, key: &str) -> Option<u32> {
        self.buckets.lock().await.get(key).map(|b| b.count)
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.buckets.lock().await.len()
    }
}

impl RateDecision {
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        let reset = self.reset_after.as_secs_f64().ceil() as u64;
        headers.insert("X-RateLimit-Limit", header_number(self.limit as u64));
        headers.insert(
            "X-RateLimit-Remaining",
            header_number(self.remaining as u64),
        );
        headers.insert("X-RateLimit-Reset", header_number(reset));
        if !self.allowed {
            headers.insert(http::header::RETRY_AFTER, header_number(reset.max(1)));
        }
    }
}

fn header_number(value: u64) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

/// First `X-Forwarded-For` hop, then the socket peer, then `ip:unknown`.
pub fn ip_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    match (forwarded, peer) {
        (Some(ip), _) => format!("ip:{ip}"),
        (None, Some(addr)) => format!("ip:{}", addr.ip()),
        (None, None) => "ip:unknown".to_string(),
    }
}

pub fn email_key(email: Option<&str>) -> String {
    match email.map(|e| e.trim().to_lowercase()).filter(|e| !e.is_empty()) {
        Some(email) => format!("email:{email}"),
        None => "email:missing".to_string(),
    }
}
