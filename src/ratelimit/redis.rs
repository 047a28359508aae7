//! Shared-store limiter backed by Redis.
//!
//! Every decision is a single Lua script evaluation, so the block check,
//! the prune, the count and the append happen atomically inside Redis no
//! matter how many application processes share the store. Timestamps are
//! passed in as integer microseconds and kept as strings on the Lua side,
//! since Lua's number formatting would otherwise drop precision.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::Script;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::backend::Limiter;
use super::key::ClientKey;
use super::policy::Policy;
use super::window::{Decision, Escalation};
use crate::error::{Result, TollgateError};

/// Default prefix for every key this limiter writes.
pub const DEFAULT_KEY_PREFIX: &str = "tollgate:";
/// Default bound on a whole decision, connecting included.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(50);
/// Default pause after a failed call before the store is tried again.
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// KEYS: admitted zset, rejected zset, block key.
/// ARGV: now_us, window_us, limit, threshold, block_us, member.
/// Returns {allowed, remaining, reset_us, retry_us, blocked}.
const DECIDE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local threshold = tonumber(ARGV[4])
local block = tonumber(ARGV[5])
local member = ARGV[6]

local blocked_until = tonumber(redis.call('GET', KEYS[3]))
if blocked_until then
  if now < blocked_until then
    return {0, 0, blocked_until, blocked_until - now, 1}
  end
  redis.call('DEL', KEYS[3])
end

local cutoff = string.format('%d', now - window)
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', cutoff)
redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', cutoff)
local admitted = redis.call('ZCARD', KEYS[1])
local rejected = redis.call('ZCARD', KEYS[2])
local ttl_ms = math.ceil(window / 1000)

if admitted >= limit then
  if admitted + rejected >= threshold then
    local expiry = now + block
    redis.call('SET', KEYS[3], string.format('%d', expiry), 'PX', math.ceil(block / 1000))
    return {0, 0, expiry, block, 1}
  end
  redis.call('ZADD', KEYS[2], ARGV[1], member)
  redis.call('PEXPIRE', KEYS[2], ttl_ms)
  local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
  local reset = tonumber(oldest[2]) + window
  return {0, 0, reset, reset - now, 0}
end

redis.call('ZADD', KEYS[1], ARGV[1], member)
redis.call('PEXPIRE', KEYS[1], ttl_ms)
return {1, limit - admitted - 1, now + window, 0, 0}
"#;

/// Limiter state shared through Redis.
///
/// The connection is established lazily and outside any lock, so a hung
/// store costs each caller at most one timeout. After a failure the store
/// is left alone for the reconnect backoff and calls fail fast meanwhile.
pub struct RedisLimiter {
    /// Client used to (re)connect
    client: redis::Client,
    /// Link state, never locked across an await
    link: Mutex<Link>,
    /// The decision script
    script: Script,
    /// Prefix for all keys
    key_prefix: String,
    /// Bound on a whole decision
    timeout: Duration,
    /// Pause after a failure before reconnecting
    reconnect_backoff: Duration,
    /// Block policy applied on repeated violations
    escalation: Escalation,
}

enum Link {
    Idle,
    Ready(MultiplexedConnection),
    Down(Instant),
}

/// Storage keys for one client key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    /// Sorted set of admitted request timestamps
    pub admitted: String,
    /// Sorted set of rejected attempt timestamps
    pub rejected: String,
    /// Block marker holding the expiry
    pub blocked: String,
}

impl RedisLimiter {
    /// Create a limiter for the store at `url`. Does not connect.
    pub fn new(url: &str, escalation: Escalation) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| TollgateError::Config(format!("invalid redis url: {}", e)))?;
        Ok(Self {
            client,
            link: Mutex::new(Link::Idle),
            script: Script::new(DECIDE_SCRIPT),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            timeout: DEFAULT_TIMEOUT,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            escalation,
        })
    }

    /// Set the prefix for all keys.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the bound on a whole decision.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the pause after a failure before the store is tried again.
    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Storage keys for a client key.
    ///
    /// The client key is a hash tag, so all three keys land in one cluster slot.
    pub fn store_keys(&self, key: &ClientKey) -> StoreKeys {
        let tag = format!("{{{}}}", key.to_string_key());
        StoreKeys {
            admitted: format!("{}requests:{}", self.key_prefix, tag),
            rejected: format!("{}rejected:{}", self.key_prefix, tag),
            blocked: format!("{}blocked:{}", self.key_prefix, tag),
        }
    }

    /// The cached connection, `None` when a connect is due, or an error
    /// while backing off.
    fn cached_connection(&self) -> Result<Option<MultiplexedConnection>> {
        match &*self.link.lock() {
            Link::Ready(conn) => Ok(Some(conn.clone())),
            Link::Down(until) if Instant::now() < *until => Err(TollgateError::BackendUnavailable(
                "store marked down, waiting to reconnect".to_string(),
            )),
            _ => Ok(None),
        }
    }

    async fn connect(&self) -> Result<MultiplexedConnection> {
        debug!("Connecting to redis");
        let conn = self.client.get_multiplexed_async_connection().await?;
        *self.link.lock() = Link::Ready(conn.clone());
        Ok(conn)
    }

    fn mark_down(&self) {
        *self.link.lock() = Link::Down(Instant::now() + self.reconnect_backoff);
    }

    async fn evaluate(
        &self,
        cached: Option<MultiplexedConnection>,
        keys: &StoreKeys,
        policy: &Policy,
        now: DateTime<Utc>,
    ) -> Result<(i64, i64, i64, i64, i64)> {
        let mut conn = match cached {
            Some(conn) => conn,
            None => self.connect().await?,
        };

        let mut invocation = self.script.key(&keys.admitted);
        invocation
            .key(&keys.rejected)
            .key(&keys.blocked)
            .arg(now.timestamp_micros())
            .arg(policy.window_secs.saturating_mul(1_000_000))
            .arg(policy.limit)
            .arg(self.escalation.threshold(policy.limit))
            .arg(self.escalation.block_duration_secs.saturating_mul(1_000_000))
            .arg(uuid::Uuid::new_v4().to_string());

        let reply = invocation.invoke_async(&mut conn).await?;
        Ok(reply)
    }
}

/// Turn the script's reply into a decision.
fn decision_from_reply(
    reply: (i64, i64, i64, i64, i64),
    limit: u32,
    now: DateTime<Utc>,
) -> Result<Decision> {
    let (allowed, remaining, reset_us, retry_us, blocked) = reply;
    let reset_time = DateTime::from_timestamp(
        reset_us.div_euclid(1_000_000),
        (reset_us.rem_euclid(1_000_000) * 1_000) as u32,
    )
    .ok_or_else(|| {
        TollgateError::BackendUnavailable(format!("reset timestamp out of range: {}", reset_us))
    })?;

    if allowed == 1 {
        let remaining = u32::try_from(remaining.max(0)).unwrap_or(0);
        return Ok(Decision::admitted(limit, remaining, reset_time));
    }

    let mut decision = if blocked == 1 {
        Decision::blocked(limit, reset_time, now)
    } else {
        Decision::rejected(limit, reset_time, now)
    };
    decision.retry_after = chrono::Duration::microseconds(retry_us.max(0));
    Ok(decision)
}

#[async_trait]
impl Limiter for RedisLimiter {
    async fn decide(
        &self,
        key: &ClientKey,
        policy: &Policy,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let keys = self.store_keys(key);
        let cached = self.cached_connection()?;

        trace!(key = %key, "Checking shared rate limit");

        let result =
            match tokio::time::timeout(self.timeout, self.evaluate(cached, &keys, policy, now))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(TollgateError::BackendUnavailable(format!(
                    "no reply within {:?}",
                    self.timeout
                ))),
            };

        match result {
            Ok(reply) => decision_from_reply(reply, policy.limit, now),
            Err(e) => {
                warn!(
                    error = %e,
                    backoff_ms = self.reconnect_backoff.as_millis() as u64,
                    "Redis call failed, backing off"
                );
                self.mark_down();
                Err(e)
            }
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::policy::PolicyClass;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Set to run the tests that need a live store, e.g. `redis://127.0.0.1:6379/15`.
    const LIVE_URL_VAR: &str = "TOLLGATE_TEST_REDIS_URL";

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn micros(secs: i64) -> i64 {
        at(secs).timestamp_micros()
    }

    /// A limiter on the live store under a fresh key prefix, or `None` when
    /// no store is configured.
    fn live_limiter(escalation: Escalation) -> Option<(RedisLimiter, String)> {
        let url = std::env::var(LIVE_URL_VAR).ok().filter(|url| !url.is_empty())?;
        let limiter = RedisLimiter::new(&url, escalation)
            .unwrap()
            .with_key_prefix(format!("tollgate-test:{}:", uuid::Uuid::new_v4()))
            .with_timeout(Duration::from_secs(2));
        Some((limiter, url))
    }

    async fn pttl(url: &str, key: &str) -> i64 {
        let client = redis::Client::open(url).unwrap();
        let mut conn = client.get_multiplexed_async_connection().await.unwrap();
        redis::cmd("PTTL").arg(key).query_async(&mut conn).await.unwrap()
    }

    /// A listener that accepts connections and never answers.
    async fn silent_store() -> (String, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(socket);
            }
        });
        (format!("redis://{}", addr), accepted)
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        let result = RedisLimiter::new("not a url", Escalation::default());
        assert!(matches!(result, Err(TollgateError::Config(_))));
    }

    #[test]
    fn test_store_keys_layout() {
        let limiter = RedisLimiter::new("redis://127.0.0.1:6379", Escalation::default())
            .unwrap()
            .with_key_prefix("app:");
        let keys = limiter.store_keys(&ClientKey::new(PolicyClass::AuthLogin, "10.0.0.1"));

        assert_eq!(keys.admitted, "app:requests:{auth_login:10.0.0.1}");
        assert_eq!(keys.rejected, "app:rejected:{auth_login:10.0.0.1}");
        assert_eq!(keys.blocked, "app:blocked:{auth_login:10.0.0.1}");
    }

    #[test]
    fn test_store_keys_share_hash_tag() {
        let limiter = RedisLimiter::new("redis://127.0.0.1:6379", Escalation::default()).unwrap();
        let keys = limiter.store_keys(&ClientKey::new(PolicyClass::Upload, "2001:db8::1"));

        let tag = |k: &str| {
            let open = k.find('{').unwrap();
            let close = open + k[open..].find('}').unwrap();
            k[open + 1..close].to_string()
        };
        assert_eq!(tag(&keys.admitted), "upload:2001:db8::1");
        assert_eq!(tag(&keys.admitted), tag(&keys.rejected));
        assert_eq!(tag(&keys.admitted), tag(&keys.blocked));
    }

    #[test]
    fn test_admitted_reply() {
        let reply = (1, 3, micros(60), 0, 0);
        let decision = decision_from_reply(reply, 5, at(0)).unwrap();

        assert!(decision.allowed);
        assert_eq!(decision.remaining, 3);
        assert_eq!(decision.reset_time, at(60));
        assert_eq!(decision.retry_after_secs(), 0);
    }

    #[test]
    fn test_rejected_reply() {
        let reply = (0, 0, micros(60), 55_000_000, 0);
        let decision = decision_from_reply(reply, 5, at(5)).unwrap();

        assert!(!decision.allowed);
        assert!(!decision.blocked);
        assert_eq!(decision.retry_after_secs(), 55);
    }

    #[test]
    fn test_blocked_reply() {
        let reply = (0, 0, micros(910), 900_000_000, 1);
        let decision = decision_from_reply(reply, 5, at(10)).unwrap();

        assert!(decision.blocked);
        assert_eq!(decision.reset_epoch_secs(), at(910).timestamp());
        assert_eq!(decision.retry_after_secs(), 900);
    }

    #[tokio::test]
    async fn test_unreachable_store_is_backend_unavailable() {
        // Port 1 on loopback refuses connections
        let limiter = RedisLimiter::new("redis://127.0.0.1:1", Escalation::default())
            .unwrap()
            .with_timeout(Duration::from_millis(200));
        let key = ClientKey::new(PolicyClass::ApiGeneral, "10.0.0.1");

        let result = limiter.decide(&key, &Policy::new(5, 60), at(0)).await;
        assert!(matches!(result, Err(TollgateError::BackendUnavailable(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_hung_store_bounds_every_caller_by_one_timeout() {
        let (url, _) = silent_store().await;
        let limiter = Arc::new(
            RedisLimiter::new(&url, Escalation::default())
                .unwrap()
                .with_timeout(Duration::from_millis(50)),
        );

        let started = std::time::Instant::now();
        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    let key = ClientKey::new(PolicyClass::ApiGeneral, format!("10.0.0.{}", i));
                    limiter.decide(&key, &Policy::new(5, 60), at(0)).await
                })
            })
            .collect();
        let results = futures::future::join_all(tasks).await;
        let elapsed = started.elapsed();

        for result in results {
            assert!(matches!(
                result.unwrap(),
                Err(TollgateError::BackendUnavailable(_))
            ));
        }
        assert!(elapsed < Duration::from_millis(200), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_failed_store_is_left_alone_during_backoff() {
        let (url, accepted) = silent_store().await;
        let limiter = RedisLimiter::new(&url, Escalation::default())
            .unwrap()
            .with_timeout(Duration::from_millis(50))
            .with_reconnect_backoff(Duration::from_secs(60));
        let key = ClientKey::new(PolicyClass::ApiGeneral, "10.0.0.1");
        let policy = Policy::new(5, 60);

        assert!(limiter.decide(&key, &policy, at(0)).await.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let seen = accepted.load(Ordering::SeqCst);

        let started = std::time::Instant::now();
        let result = limiter.decide(&key, &policy, at(1)).await;
        assert!(matches!(result, Err(TollgateError::BackendUnavailable(_))));
        assert!(started.elapsed() < Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_store_is_retried_after_backoff() {
        let (url, accepted) = silent_store().await;
        let limiter = RedisLimiter::new(&url, Escalation::default())
            .unwrap()
            .with_timeout(Duration::from_millis(50))
            .with_reconnect_backoff(Duration::ZERO);
        let key = ClientKey::new(PolicyClass::ApiGeneral, "10.0.0.1");
        let policy = Policy::new(5, 60);

        assert!(limiter.decide(&key, &policy, at(0)).await.is_err());
        assert!(limiter.decide(&key, &policy, at(1)).await.is_err());

        for _ in 0..50 {
            if accepted.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(accepted.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_live_scenario_limit_five_per_minute() {
        let Some((limiter, _)) = live_limiter(Escalation::default()) else {
            return;
        };
        let key = ClientKey::new(PolicyClass::ApiGeneral, "192.0.2.1");
        let policy = Policy::new(5, 60);

        for i in 0..5 {
            let decision = limiter.decide(&key, &policy, at(i)).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, 4 - i as u32);
            assert_eq!(decision.reset_time, at(i + 60));
        }

        let decision = limiter.decide(&key, &policy, at(5)).await.unwrap();
        assert!(!decision.allowed);
        assert!(!decision.blocked);
        assert_eq!(decision.reset_time, at(60));
        assert_eq!(decision.retry_after_secs(), 55);
    }

    #[tokio::test]
    async fn test_live_entries_expire_at_window_boundary() {
        let Some((limiter, _)) = live_limiter(Escalation::default()) else {
            return;
        };
        let key = ClientKey::new(PolicyClass::ApiStrict, "192.0.2.2");
        let policy = Policy::new(1, 60);

        assert!(limiter.decide(&key, &policy, at(0)).await.unwrap().allowed);
        assert!(!limiter.decide(&key, &policy, at(59)).await.unwrap().allowed);

        let decision = limiter.decide(&key, &policy, at(60)).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_live_escalation_blocks_eleventh_attempt() {
        let Some((limiter, _)) = live_limiter(Escalation::new(900, 2)) else {
            return;
        };
        let key = ClientKey::new(PolicyClass::AuthLogin, "203.0.113.7");
        let policy = Policy::new(5, 900);

        for i in 0..5 {
            assert!(limiter.decide(&key, &policy, at(i)).await.unwrap().allowed);
        }
        for i in 5..10 {
            let decision = limiter.decide(&key, &policy, at(i)).await.unwrap();
            assert!(!decision.allowed);
            assert!(!decision.blocked);
        }

        let decision = limiter.decide(&key, &policy, at(10)).await.unwrap();
        assert!(decision.blocked);
        assert_eq!(decision.retry_after_secs(), 900);
        assert_eq!(decision.reset_time, at(910));

        let decision = limiter.decide(&key, &policy, at(905)).await.unwrap();
        assert!(decision.blocked);
        assert_eq!(decision.retry_after_secs(), 5);
        assert_eq!(decision.reset_time, at(910));

        let decision = limiter.decide(&key, &policy, at(910)).await.unwrap();
        assert!(decision.allowed);
        assert!(!decision.blocked);
        assert_eq!(decision.remaining, 4);
    }

    #[tokio::test]
    async fn test_live_key_ttls_are_in_milliseconds() {
        let Some((limiter, url)) = live_limiter(Escalation::new(300, 1)) else {
            return;
        };
        let key = ClientKey::new(PolicyClass::Upload, "198.51.100.9");
        let keys = limiter.store_keys(&key);
        let policy = Policy::new(1, 60);

        assert!(limiter.decide(&key, &policy, at(0)).await.unwrap().allowed);
        let ttl = pttl(&url, &keys.admitted).await;
        assert!((55_000..=60_000).contains(&ttl), "admitted ttl {}", ttl);

        assert!(limiter.decide(&key, &policy, at(1)).await.unwrap().blocked);
        let ttl = pttl(&url, &keys.blocked).await;
        assert!((295_000..=300_000).contains(&ttl), "block ttl {}", ttl);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_live_concurrent_requests_admit_exactly_limit() {
        let Some((limiter, _)) = live_limiter(Escalation::default()) else {
            return;
        };
        let limiter = Arc::new(limiter);
        let policy = Policy::new(25, 60);

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    let key = ClientKey::new(PolicyClass::ApiGeneral, "198.51.100.4");
                    limiter.decide(&key, &policy, at(0)).await.unwrap().allowed
                })
            })
            .collect();

        let admitted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(admitted, 25);
    }
}
