use std::{
    collections::BTreeSet,
    future::Future,
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use redis::{
    RedisResult,
    Script,
    aio::ConnectionManager,
};

use crate::{
    error::{GatewayError, GatewayResult},
    ratelimit::{
        CounterStore, RateLimitDecision, Tier, TierLimits, UsageSnapshot, Window, WindowUsage,
    },
};

// KEYS: one counter per window. ARGV[1..4]: quotas, ARGV[5..8]: window lengths in ms.
// Returns {allowed, retry_after_ms, count1, ttl1, ..., count4, ttl4}.
const CHECK_LUA: &str = r#"
local counts = {}
local ttls = {}
local retry = -1

for i = 1, 4 do
  local count = tonumber(redis.call('GET', KEYS[i]) or '0')
  local ttl = redis.call('PTTL', KEYS[i])
  if ttl < 0 then
    count = 0
    ttl = tonumber(ARGV[4 + i])
  end
  counts[i] = count
  ttls[i] = ttl
  if count >= tonumber(ARGV[i]) then
    if retry < 0 or ttl < retry then
      retry = ttl
    end
  end
end

if retry >= 0 then
  return {0, math.max(1, retry), counts[1], ttls[1], counts[2], ttls[2], counts[3], ttls[3], counts[4], ttls[4]}
end

for i = 1, 4 do
  if counts[i] == 0 then
    redis.call('SET', KEYS[i], 1, 'PX', ARGV[4 + i])
    ttls[i] = tonumber(ARGV[4 + i])
  else
    redis.call('INCR', KEYS[i])
  end
  counts[i] = counts[i] + 1
end

return {1, 0, counts[1], ttls[1], counts[2], ttls[2], counts[3], ttls[3], counts[4], ttls[4]}
"#;

// Read-only view of the same counters. ARGV[1..4]: window lengths in ms.
const USAGE_LUA: &str = r#"
local out = {}
for i = 1, 4 do
  local count = tonumber(redis.call('GET', KEYS[i]) or '0')
  local ttl = redis.call('PTTL', KEYS[i])
  if ttl < 0 then
    count = 0
    ttl = tonumber(ARGV[i])
  end
  out[2 * i - 1] = count
  out[2 * i] = ttl
end
return out
"#;

/// Shares counters across gateway processes. Expiry is delegated to redis key TTLs.
pub struct RedisCounterStore {
    manager: ConnectionManager,
    key_prefix: String,
    timeout: Duration,
    check_script: Script,
    usage_script: Script,
}

impl RedisCounterStore {
    pub async fn new(url: String, key_prefix: String, timeout: Duration) -> GatewayResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = bounded(timeout, client.get_connection_manager()).await?;
        Ok(Self {
            manager,
            key_prefix,
            timeout,
            check_script: Script::new(CHECK_LUA),
            usage_script: Script::new(USAGE_LUA),
        })
    }

    fn window_keys(&self, key: &str, tier: Tier) -> [String; 4] {
        Window::ALL.map(|w| window_key(&self.key_prefix, key, tier, w))
    }
}

fn window_key(prefix: &str, key: &str, tier: Tier, window: Window) -> String {
    format!("{prefix}:{key}:{tier}:{}", window.as_str())
}

/// Recovers the caller key from `prefix:key:tier:window`; keys may contain `:` themselves.
fn caller_key<'a>(prefix: &str, full_key: &'a str) -> Option<&'a str> {
    let rest = full_key.strip_prefix(prefix)?.strip_prefix(':')?;
    let mut parts = rest.rsplitn(3, ':');
    let _window = parts.next()?;
    let _tier = parts.next()?;
    parts.next().filter(|k| !k.is_empty())
}

async fn bounded<T>(
    timeout: Duration,
    fut: impl Future<Output = RedisResult<T>>,
) -> GatewayResult<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(GatewayError::CounterStoreUnavailable(format!(
            "redis call exceeded {}ms",
            timeout.as_millis()
        ))),
    }
}

/// Turns the flat `count, ttl` pairs returned by the scripts into a usage snapshot.
fn snapshot_from_pairs(
    pairs: &[i64],
    limits: &TierLimits,
    now_ms: i64,
) -> GatewayResult<UsageSnapshot> {
    if pairs.len() != 8 {
        return Err(GatewayError::CounterStoreUnavailable(format!(
            "unexpected script reply of {} values",
            pairs.len()
        )));
    }

    Ok(Window::ALL
        .iter()
        .map(|w| {
            let count = pairs[w.index() * 2].max(0) as u64;
            let ttl_ms = pairs[w.index() * 2 + 1].max(0);
            (*w, WindowUsage::new(limits.quota(*w), count, now_ms + ttl_ms))
        })
        .collect())
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn check(
        &self,
        key: &str,
        tier: Tier,
        limits: &TierLimits,
    ) -> GatewayResult<RateLimitDecision> {
        let mut conn = self.manager.clone();
        let now_ms = Utc::now().timestamp_millis();

        let mut invocation = self.check_script.prepare_invoke();
        for full_key in self.window_keys(key, tier) {
            invocation.key(full_key);
        }
        for window in Window::ALL {
            invocation.arg(limits.quota(window));
        }
        for window in Window::ALL {
            invocation.arg(window.length_ms());
        }

        let reply: Vec<i64> = bounded(self.timeout, invocation.invoke_async(&mut conn)).await?;
        let (head, pairs) = reply.split_at(reply.len().min(2));
        let [allowed, retry_after_ms] = head else {
            return Err(GatewayError::CounterStoreUnavailable(
                "empty script reply".to_string(),
            ));
        };

        Ok(RateLimitDecision {
            allowed: *allowed == 1,
            retry_after: (*allowed != 1)
                .then(|| Duration::from_millis((*retry_after_ms).max(1) as u64)),
            usage: snapshot_from_pairs(pairs, limits, now_ms)?,
        })
    }

    async fn usage(&self, key: &str, tier: Tier, limits: &TierLimits) -> GatewayResult<UsageSnapshot> {
        let mut conn = self.manager.clone();
        let now_ms = Utc::now().timestamp_millis();

        let mut invocation = self.usage_script.prepare_invoke();
        for full_key in self.window_keys(key, tier) {
            invocation.key(full_key);
        }
        for window in Window::ALL {
            invocation.arg(window.length_ms());
        }

        let reply: Vec<i64> = bounded(self.timeout, invocation.invoke_async(&mut conn)).await?;
        snapshot_from_pairs(&reply, limits, now_ms)
    }

    async fn reset(&self, key: &str) -> GatewayResult<()> {
        let mut conn = self.manager.clone();
        let keys = Tier::ALL
            .iter()
            .flat_map(|tier| self.window_keys(key, *tier))
            .collect::<Vec<_>>();

        let _deleted: i64 = bounded(
            self.timeout,
            redis::cmd("DEL").arg(&keys).query_async(&mut conn),
        )
        .await?;
        Ok(())
    }

    async fn keys(&self) -> GatewayResult<Vec<String>> {
        let mut conn = self.manager.clone();
        let pattern = format!("{}:*", self.key_prefix);
        let mut cursor = 0u64;
        let mut found = BTreeSet::new();

        loop {
            let (next, batch): (u64, Vec<String>) = bounded(
                self.timeout,
                redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(500)
                    .query_async(&mut conn),
            )
            .await?;

            found.extend(
                batch
                    .iter()
                    .filter_map(|full| caller_key(&self.key_prefix, full))
                    .map(ToString::to_string),
            );

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(found.into_iter().collect())
    }
}
