//! Per-key token-bucket rate limiter.
//!
//! Adapters use this on their send paths to stay under provider limits, and
//! on inbound to shed abusive senders. Buckets are keyed by an arbitrary
//! string (chat id, sender id) and refill continuously.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tokio::time::Instant;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    /// `capacity` requests burst, refilling at `refill_per_sec`.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_per_sec,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for `key`. Returns `false` when the bucket is empty.
    pub async fn allow(&self, key: &str) -> bool {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        let bucket = buckets.entry(key.to_owned()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop idle buckets older than `max_idle_secs` to bound memory.
    pub async fn prune(&self, max_idle_secs: u64) {
        let now = Instant::now();
        let max_idle = tokio::time::Duration::from_secs(max_idle_secs);
        self.buckets
            .lock()
            .await
            .retain(|_, bucket| now.duration_since(bucket.last_refill) < max_idle);
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
