//! C1 — rate-limit engine. Atomic window counters for requests/tokens per client.
//!
//! The two server-side scripts are `redis::Script` values so the increment and the TTL
//! establishment happen as one atomic step, exactly as required by §4.1/§6.

use async_trait::async_trait;
use log::warn;
use std::collections::HashMap;
use std::sync::Mutex;

const MINUTE_TTL: i64 = 60;
const DAY_TTL: i64 = 86_400;

/// The three counter kinds a client can be limited on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    RequestsPerMinute,
    RequestsPerDay,
    TokensPerMinute,
}

impl CounterKind {
    fn tag(&self) -> &'static str {
        match self {
            CounterKind::RequestsPerMinute => "rpm",
            CounterKind::RequestsPerDay => "rpd",
            CounterKind::TokensPerMinute => "tpm",
        }
    }

    fn window_seconds(&self) -> i64 {
        match self {
            CounterKind::RequestsPerMinute | CounterKind::TokensPerMinute => MINUTE_TTL,
            CounterKind::RequestsPerDay => DAY_TTL,
        }
    }
}

/// `Allow(client) → ok|denied` and `RecordTokens(client, n) → ok|denied` outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitOutcome {
    Ok,
    Denied,
}

fn counter_key(prefix: &str, client_id: &str, kind: CounterKind) -> String {
    format!("{}:{}:{}", prefix, client_id, kind.tag())
}

/// Storage abstraction for the atomic increment-and-maybe-set-TTL primitive, so the engine can
/// be backed by Redis in production and an in-memory fake in tests.
#[async_trait]
pub trait CounterBackend: Send + Sync {
    /// Request-counter script: `INCR <key>`; if the post-increment value is 1, `EXPIRE <key>
    /// <seconds>`; return the count. Malformed stored values are treated as 0 (§4.1, §7).
    async fn incr_with_window(&self, key: &str, window_seconds: i64) -> Result<i64, String>;

    /// Token-counter script: `INCRBY <key> <n>`; if the key has no TTL, `EXPIRE <key> 60`;
    /// return the count.
    async fn incrby_with_window(&self, key: &str, n: i64, window_seconds: i64) -> Result<i64, String>;
}

/// Redis-backed counter storage using `redis::Script` for the atomic increment+expire pair.
pub struct RedisCounterBackend {
    manager: redis::aio::ConnectionManager,
    incr_script: redis::Script,
    incrby_script: redis::Script,
}

impl RedisCounterBackend {
    pub async fn connect(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let manager = client.get_connection_manager().await?;
        Ok(RedisCounterBackend {
            manager,
            incr_script: redis::Script::new(
                r"
                local count = redis.call('INCR', KEYS[1])
                if count == 1 then
                    redis.call('EXPIRE', KEYS[1], ARGV[1])
                end
                return count
                ",
            ),
            incrby_script: redis::Script::new(
                r"
                local count = redis.call('INCRBY', KEYS[1], ARGV[1])
                local ttl = redis.call('TTL', KEYS[1])
                if ttl == -1 then
                    redis.call('EXPIRE', KEYS[1], ARGV[2])
                end
                return count
                ",
            ),
        })
    }
}

#[async_trait]
impl CounterBackend for RedisCounterBackend {
    async fn incr_with_window(&self, key: &str, window_seconds: i64) -> Result<i64, String> {
        let mut conn = self.manager.clone();
        self.incr_script
            .key(key)
            .arg(window_seconds)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| e.to_string())
    }

    async fn incrby_with_window(&self, key: &str, n: i64, window_seconds: i64) -> Result<i64, String> {
        let mut conn = self.manager.clone();
        self.incrby_script
            .key(key)
            .arg(n)
            .arg(window_seconds)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| e.to_string())
    }
}

/// In-memory counter backend for tests; replicates the atomic-increment-plus-TTL contract
/// without a live Redis instance.
pub struct InMemoryCounterBackend {
    counters: Mutex<HashMap<String, (i64, std::time::Instant, i64)>>,
}

impl InMemoryCounterBackend {
    pub fn new() -> Self {
        InMemoryCounterBackend {
            counters: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryCounterBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterBackend for InMemoryCounterBackend {
    async fn incr_with_window(&self, key: &str, window_seconds: i64) -> Result<i64, String> {
        self.incrby_with_window(key, 1, window_seconds).await
    }

    async fn incrby_with_window(&self, key: &str, n: i64, window_seconds: i64) -> Result<i64, String> {
        let mut counters = self.counters.lock().unwrap();
        let now = std::time::Instant::now();
        let entry = counters.entry(key.to_string()).or_insert((0, now, window_seconds));
        if now.duration_since(entry.1).as_secs() as i64 >= entry.2 {
            *entry = (0, now, window_seconds);
        }
        entry.0 += n;
        Ok(entry.0)
    }
}

/// `Allow`/`RecordTokens` contract. `Default` limits apply when a tenant or client limit is
/// zero; only when both are zero is the dimension unlimited.
pub struct RateLimiter<B: CounterBackend> {
    backend: B,
    prefix: String,
    disabled: bool,
    default_rpm: u32,
    default_rpd: u32,
    default_tpm: u32,
}

impl<B: CounterBackend> RateLimiter<B> {
    pub fn new(backend: B, prefix: impl Into<String>) -> Self {
        RateLimiter {
            backend,
            prefix: prefix.into(),
            disabled: false,
            default_rpm: 60,
            default_rpd: 10_000,
            default_tpm: 100_000,
        }
    }

    /// Globally disable the engine (development mode): all calls short-circuit to `Ok`.
    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    fn effective_limit(&self, tenant_override: u32, client_limit: u32, default: u32) -> u32 {
        if tenant_override == 0 && client_limit == 0 {
            return 0;
        }
        let tenant_eff = if tenant_override != 0 { tenant_override } else { default };
        let client_eff = if client_limit != 0 { client_limit } else { default };
        tenant_eff.min(client_eff)
    }

    async fn check(&self, client_id: &str, kind: CounterKind, limit: u32) -> LimitOutcome {
        if self.disabled {
            return LimitOutcome::Ok;
        }
        if limit == 0 {
            // Both tenant override and client limit were zero: unlimited dimension.
            return LimitOutcome::Ok;
        }
        let key = counter_key(&self.prefix, client_id, kind);
        match self.backend.incr_with_window(&key, kind.window_seconds()).await {
            Ok(count) => {
                if count <= limit as i64 {
                    LimitOutcome::Ok
                } else {
                    LimitOutcome::Denied
                }
            }
            Err(e) => {
                warn!("rate-limit counter script failed for {}: {}", key, e);
                // An unparseable/unexpected result is surfaced as 0 to avoid false denials,
                // consistent with the corrupted-counter recovery policy in §7.
                LimitOutcome::Ok
            }
        }
    }

    /// `Allow(client) → ok|denied`, checked against both the per-minute and per-day windows.
    pub async fn allow(
        &self,
        client_id: &str,
        tenant_rpm: u32,
        tenant_rpd: u32,
        client_rpm: u32,
        client_rpd: u32,
    ) -> LimitOutcome {
        let rpm = self.effective_limit(tenant_rpm, client_rpm, self.default_rpm);
        let rpd = self.effective_limit(tenant_rpd, client_rpd, self.default_rpd);
        let minute = self.check(client_id, CounterKind::RequestsPerMinute, rpm).await;
        if minute == LimitOutcome::Denied {
            return LimitOutcome::Denied;
        }
        self.check(client_id, CounterKind::RequestsPerDay, rpd).await
    }

    /// `RecordTokens(client, n) → ok|denied`. Non-positive `n` is ignored (no counter movement).
    pub async fn record_tokens(
        &self,
        client_id: &str,
        n: i64,
        tenant_tpm: u32,
        client_tpm: u32,
    ) -> LimitOutcome {
        if n <= 0 {
            return LimitOutcome::Ok;
        }
        if self.disabled {
            return LimitOutcome::Ok;
        }
        let tpm = self.effective_limit(tenant_tpm, client_tpm, self.default_tpm);
        if tpm == 0 {
            return LimitOutcome::Ok;
        }
        let key = counter_key(&self.prefix, client_id, CounterKind::TokensPerMinute);
        match self.backend.incrby_with_window(&key, n, MINUTE_TTL).await {
            Ok(count) => {
                if count <= tpm as i64 {
                    LimitOutcome::Ok
                } else {
                    LimitOutcome::Denied
                }
            }
            Err(e) => {
                warn!("token counter script failed for {}: {}", key, e);
                LimitOutcome::Ok
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter<InMemoryCounterBackend> {
        RateLimiter::new(InMemoryCounterBackend::new(), "test")
    }

    #[tokio::test]
    async fn burst_of_eleven_with_rpm_ten_denies_the_eleventh() {
        let limiter = limiter();
        let mut outcomes = Vec::new();
        for _ in 0..11 {
            outcomes.push(limiter.allow("client-a", 0, 0, 10, 1000).await);
        }
        assert_eq!(&outcomes[..10], &[LimitOutcome::Ok; 10]);
        assert_eq!(outcomes[10], LimitOutcome::Denied);
    }

    #[tokio::test]
    async fn zero_tokens_recorded_causes_no_movement() {
        let limiter = limiter();
        let key = counter_key("test", "client-b", CounterKind::TokensPerMinute);
        assert_eq!(limiter.record_tokens("client-b", 0, 0, 1000).await, LimitOutcome::Ok);
        assert!(!limiter.backend.counters.lock().unwrap().contains_key(&key));
    }

    #[tokio::test]
    async fn disabled_engine_always_allows() {
        let limiter = limiter().disabled(true);
        for _ in 0..100 {
            assert_eq!(limiter.allow("client-c", 0, 0, 1, 1).await, LimitOutcome::Ok);
        }
    }

    #[tokio::test]
    async fn both_zero_limits_are_unlimited() {
        let limiter = limiter();
        for _ in 0..1000 {
            assert_eq!(limiter.allow("client-d", 0, 0, 0, 0).await, LimitOutcome::Ok);
        }
    }
}
