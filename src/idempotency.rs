use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};
use tracing::warn;

/// Headers that upstream webhook senders reuse on retries, in priority order.
const KEY_HEADERS: &[&str] = &[
    "framer-webhook-submission-id",
    "x-request-id",
    "idempotency-key",
];

const REDIS_PREFIX: &str = "audit:seen:";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubmissionKey(String);

impl SubmissionKey {
    /// Caller-supplied header wins; otherwise a SHA-256 of the normalized body.
    pub fn derive(headers: &HeaderMap, body: &[u8]) -> Self {
        let supplied = KEY_HEADERS.iter().find_map(|name| {
            headers
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        });
        match supplied {
            Some(value) => Self(format!("hdr:{value}")),
            None => Self(format!("body:{}", body_digest(body))),
        }
    }

    #[cfg(test)]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubmissionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Re-serializing through `serde_json::Value` sorts object keys, so formatting
/// and key order do not change the digest.
fn body_digest(body: &[u8]) -> String {
    let normalized = serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|value| serde_json::to_vec(&value).ok())
        .unwrap_or_else(|| body.to_vec());
    hex::encode(Sha256::digest(&normalized))
}

/// Short-lived dedup of submissions. Entries expire lazily on lookup.
#[derive(Clone)]
pub struct IdempotencyGuard {
    ttl: Duration,
    seen: Arc<Mutex<HashMap<SubmissionKey, Instant>>>,
    redis: Option<redis::Client>,
}

impl IdempotencyGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Arc::new(Mutex::new(HashMap::new())),
            redis: None,
        }
    }

    pub fn with_redis(mut self, client: Option<redis::Client>) -> Self {
        self.redis = client;
        self
    }

    /// Lookup without marking. The front door only uses `check_and_mark`.
    #[cfg(test)]
    pub async fn is_duplicate(&self, key: &SubmissionKey) -> bool {
        let mut guard = self.seen.lock().await;
        self.seen_recently(&mut guard, key, Instant::now())
    }

    #[cfg(test)]
    pub async fn mark_seen(&self, key: SubmissionKey) {
        self.seen.lock().await.insert(key, Instant::now());
    }

    /// Drops an expired entry on the way.
    fn seen_recently(
        &self,
        seen: &mut HashMap<SubmissionKey, Instant>,
        key: &SubmissionKey,
        now: Instant,
    ) -> bool {
        match seen.get(key) {
            Some(first_seen) if now.duration_since(*first_seen) < self.ttl => true,
            Some(_) => {
                seen.remove(key);
                false
            }
            None => false,
        }
    }

    /// Test-and-set in one step. Returns `true` when the key was already seen.
    pub async fn check_and_mark(&self, key: &SubmissionKey) -> bool {
        if let Some(client) = &self.redis {
            match redis_set_nx(client, key, self.ttl).await {
                Ok(inserted) => return !inserted,
                Err(err) => warn!(
                    target = "audit.idempotency",
                    error = %err,
                    "redis unavailable, using in-memory seen map"
                ),
            }
        }

        let now = Instant::now();
        let mut guard = self.seen.lock().await;
        if self.seen_recently(&mut guard, key, now) {
            return true;
        }
        guard.insert(key.clone(), now);
        false
    }

    /// Releases a key so the caller may retry, e.g. when the hand-off failed.
    pub async fn forget(&self, key: &SubmissionKey) {
        if let Some(client) = &self.redis
            && let Err(err) = redis_del(client, key).await
        {
            warn!(target = "audit.idempotency", error = %err, "redis delete failed");
        }
        self.seen.lock().await.remove(key);
    }

    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.seen.lock().await;
        let before = guard.len();
        guard.retain(|_, first_seen| now.duration_since(*first_seen) < self.ttl);
        before - guard.len()
    }
}

async fn redis_set_nx(
    client: &redis::Client,
    key: &SubmissionKey,
    ttl: Duration,
) -> Result<bool, redis::RedisError> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    let reply: Option<String> = redis::cmd("SET")
        .arg(format!("{REDIS_PREFIX}{key}"))
        .arg(1)
        .arg("NX")
        .arg("EX")
        .arg(ttl.as_secs().max(1))
        .query_async(&mut conn)
        .await?;
    Ok(reply.is_some())
}

async fn redis_del(client: &redis::Client, key: &SubmissionKey) -> Result<(), redis::RedisError> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    redis::cmd("DEL")
        .arg(format!("{REDIS_PREFIX}{key}"))
        .query_async::<()>(&mut conn)
        .await
}
