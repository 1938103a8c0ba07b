//! Abuse-resistant rate limiting backed by Redis
//!
//! Counters are keyed by `(operation, identifier)` with a fixed expiry
//! window. The increment is a single atomic `INCR` at the storage layer,
//! so concurrent attempts from distributed request handlers cannot
//! read-modify-write past the threshold. The expiry is set only on the
//! first increment of a window.
//!
//! When Redis is unreachable (or was never configured) the limiter
//! degrades to an in-process counter. That mode is best-effort only - it
//! is not correct across multiple server instances - but a cache outage
//! must never become an auth outage.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;

/// Bound on the in-process fallback map to keep degraded mode from
/// growing without limit under a key-spraying client.
const MAX_LOCAL_ENTRIES: usize = 10_000;

/// Fixed-window counter for the in-process fallback
#[derive(Debug)]
struct LocalCounter {
    count: u64,
    window_ends_at: Instant,
}

/// Counter store for sign-in, reset-request and OTP-issuance throttling
#[derive(Clone)]
pub struct RateLimiter {
    redis: Option<ConnectionManager>,
    local: Arc<Mutex<HashMap<String, LocalCounter>>>,
}

impl RateLimiter {
    /// Connect to Redis; on failure, start in degraded in-process mode
    pub async fn connect(redis_url: &str) -> Self {
        let redis = match redis::Client::open(redis_url) {
            Ok(client) => match client.get_connection_manager().await {
                Ok(manager) => {
                    tracing::info!("Rate limiter connected to Redis");
                    Some(manager)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Redis unreachable - rate limiter running in degraded in-process mode");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Invalid Redis URL - rate limiter running in degraded in-process mode");
                None
            }
        };

        Self {
            redis,
            local: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// In-process-only limiter (no cache configured, or tests)
    pub fn new_in_memory() -> Self {
        Self {
            redis: None,
            local: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Atomically increment the counter for `(operation, identifier)`,
    /// returning the count within the current window.
    ///
    /// The window starts at the first increment; later increments never
    /// extend it. Errors from Redis demote the call to the in-process
    /// counter instead of propagating.
    pub async fn increment(&self, operation: &str, identifier: &str, window_secs: u64) -> u64 {
        let key = format!("ratelimit:{operation}:{identifier}");

        if let Some(manager) = &self.redis {
            match Self::increment_redis(manager.clone(), &key, window_secs).await {
                Ok(count) => return count,
                Err(e) => {
                    tracing::warn!(error = %e, key = %key, "Redis increment failed - falling back to in-process counter");
                }
            }
        }

        self.increment_local(&key, window_secs).await
    }

    /// Convenience gate: returns true when the attempt count for this
    /// window (including the current attempt) exceeds `limit`.
    pub async fn is_limited(
        &self,
        operation: &str,
        identifier: &str,
        limit: u64,
        window_secs: u64,
    ) -> bool {
        let count = self.increment(operation, identifier, window_secs).await;
        if count > limit {
            tracing::warn!(
                operation = operation,
                count = count,
                limit = limit,
                "Rate limit exceeded"
            );
            return true;
        }
        false
    }

    async fn increment_redis(
        mut manager: ConnectionManager,
        key: &str,
        window_secs: u64,
    ) -> Result<u64, redis::RedisError> {
        let count: u64 = manager.incr(key, 1u64).await?;

        // EXPIRE NX: only sets a TTL when the key has none, so the first
        // increment of a window owns the expiry and a missed one (client
        // dropped between INCR and EXPIRE) heals on the next attempt
        // instead of leaving the key counting forever.
        let _: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(window_secs as i64)
            .arg("NX")
            .query_async(&mut manager)
            .await?;

        Ok(count)
    }

    async fn increment_local(&self, key: &str, window_secs: u64) -> u64 {
        let now = Instant::now();
        let mut map = self.local.lock().await;

        // Admitting a new key at the bound: drop expired windows first,
        // then evict the soonest-expiring live one so the map never
        // exceeds MAX_LOCAL_ENTRIES even under a key-spraying client.
        if map.len() >= MAX_LOCAL_ENTRIES && !map.contains_key(key) {
            map.retain(|_, counter| counter.window_ends_at > now);
            if map.len() >= MAX_LOCAL_ENTRIES {
                let evict = map
                    .iter()
                    .min_by_key(|(_, counter)| counter.window_ends_at)
                    .map(|(k, _)| k.clone());
                if let Some(evict) = evict {
                    map.remove(&evict);
                }
            }
        }

        let counter = map.entry(key.to_string()).or_insert_with(|| LocalCounter {
            count: 0,
            window_ends_at: now + Duration::from_secs(window_secs),
        });

        if counter.window_ends_at <= now {
            counter.count = 0;
            counter.window_ends_at = now + Duration::from_secs(window_secs);
        }

        counter.count += 1;
        counter.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_within_a_window() {
        let limiter = RateLimiter::new_in_memory();

        assert_eq!(limiter.increment("signin", "a@example.com", 60).await, 1);
        assert_eq!(limiter.increment("signin", "a@example.com", 60).await, 2);
        assert_eq!(limiter.increment("signin", "a@example.com", 60).await, 3);
    }

    #[tokio::test]
    async fn keys_are_isolated_per_operation_and_identifier() {
        let limiter = RateLimiter::new_in_memory();

        assert_eq!(limiter.increment("signin", "a@example.com", 60).await, 1);
        assert_eq!(limiter.increment("reset", "a@example.com", 60).await, 1);
        assert_eq!(limiter.increment("signin", "b@example.com", 60).await, 1);
    }

    #[tokio::test]
    async fn window_elapsing_resets_the_count() {
        let limiter = RateLimiter::new_in_memory();

        assert_eq!(limiter.increment("signin", "a@example.com", 1).await, 1);
        assert_eq!(limiter.increment("signin", "a@example.com", 1).await, 2);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(limiter.increment("signin", "a@example.com", 1).await, 1);
    }

    #[tokio::test]
    async fn local_map_never_exceeds_its_bound() {
        let limiter = RateLimiter::new_in_memory();

        // Fill to the bound with live windows, then keep spraying keys
        for i in 0..MAX_LOCAL_ENTRIES {
            limiter.increment("spray", &format!("id-{i}"), 300).await;
        }
        for i in 0..16 {
            assert_eq!(
                limiter.increment("spray", &format!("extra-{i}"), 300).await,
                1
            );
        }

        assert!(limiter.local.lock().await.len() <= MAX_LOCAL_ENTRIES);
    }

    #[tokio::test]
    async fn missed_redis_expiry_heals_on_the_next_increment() {
        // Exercised only against a real Redis
        let Ok(url) = std::env::var("REDIS_URL") else {
            return;
        };
        let limiter = RateLimiter::connect(&url).await;
        if limiter.redis.is_none() {
            return;
        }

        let id = format!(
            "heal-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        );
        let key = format!("ratelimit:signin:{id}");

        assert_eq!(limiter.increment("signin", &id, 60).await, 1);

        // Strip the TTL, as if the client dropped between INCR and EXPIRE
        let client = redis::Client::open(url.as_str()).expect("client");
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .expect("conn");
        let _: i64 = redis::cmd("PERSIST")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .expect("persist");

        assert_eq!(limiter.increment("signin", &id, 60).await, 2);

        let ttl: i64 = redis::cmd("TTL")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .expect("ttl");
        assert!(ttl > 0, "expiry was not restored (ttl {ttl})");

        let _: i64 = redis::cmd("DEL")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .expect("del");
    }

    #[tokio::test]
    async fn is_limited_trips_above_threshold() {
        let limiter = RateLimiter::new_in_memory();

        for _ in 0..5 {
            assert!(!limiter.is_limited("signin", "a@example.com", 5, 60).await);
        }
        // The (threshold + 1)-th attempt within the window is throttled
        assert!(limiter.is_limited("signin", "a@example.com", 5, 60).await);
    }
}
