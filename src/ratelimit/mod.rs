pub mod in_memory;
pub mod redis_backend;

use std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::{sync::broadcast, task::JoinHandle, time};

use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Basic,
    Premium,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Free, Tier::Basic, Tier::Premium];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Basic => "basic",
            Self::Premium => "premium",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "basic" => Ok(Self::Basic),
            "premium" => Ok(Self::Premium),
            other => Err(GatewayError::InvalidKeyOrTier(format!(
                "unknown tier `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    Second,
    Minute,
    Hour,
    Day,
}

impl Window {
    pub const ALL: [Window; 4] = [Window::Second, Window::Minute, Window::Hour, Window::Day];

    pub fn duration(self) -> Duration {
        match self {
            Self::Second => Duration::from_secs(1),
            Self::Minute => Duration::from_secs(60),
            Self::Hour => Duration::from_secs(3_600),
            Self::Day => Duration::from_secs(86_400),
        }
    }

    pub fn length_ms(self) -> i64 {
        self.duration().as_millis() as i64
    }

    pub fn index(self) -> usize {
        match self {
            Self::Second => 0,
            Self::Minute => 1,
            Self::Hour => 2,
            Self::Day => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }
}

/// Quotas for one tier, one per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierLimits {
    pub per_second: u64,
    pub per_minute: u64,
    pub per_hour: u64,
    pub per_day: u64,
}

impl TierLimits {
    pub const fn new(per_second: u64, per_minute: u64, per_hour: u64, per_day: u64) -> Self {
        Self {
            per_second,
            per_minute,
            per_hour,
            per_day,
        }
    }

    pub fn quota(&self, window: Window) -> u64 {
        match window {
            Window::Second => self.per_second,
            Window::Minute => self.per_minute,
            Window::Hour => self.per_hour,
            Window::Day => self.per_day,
        }
    }
}

impl FromStr for TierLimits {
    type Err = String;

    /// Parses `second,minute,hour,day`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let values = s
            .split(',')
            .map(str::trim)
            .map(|v| v.parse::<u64>().map_err(|e| format!("invalid quota `{v}`: {e}")))
            .collect::<Result<Vec<_>, _>>()?;

        match values.as_slice() {
            [s, m, h, d] => Ok(Self::new(*s, *m, *h, *d)),
            _ => Err(format!("expected 4 quotas (second,minute,hour,day), got {}", values.len())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierTable {
    free: TierLimits,
    basic: TierLimits,
    premium: TierLimits,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            free: TierLimits::new(5, 60, 1_000, 10_000),
            basic: TierLimits::new(20, 300, 10_000, 100_000),
            premium: TierLimits::new(100, 2_000, 100_000, 1_000_000),
        }
    }
}

impl TierTable {
    pub fn limits(&self, tier: Tier) -> &TierLimits {
        match tier {
            Tier::Free => &self.free,
            Tier::Basic => &self.basic,
            Tier::Premium => &self.premium,
        }
    }

    pub fn with_limits(mut self, tier: Tier, limits: TierLimits) -> Self {
        match tier {
            Tier::Free => self.free = limits,
            Tier::Basic => self.basic = limits,
            Tier::Premium => self.premium = limits,
        }
        self
    }

    /// Every quota is positive and each tier is at least as generous as the one below it.
    pub fn validate(&self) -> GatewayResult<()> {
        for window in Window::ALL {
            for tier in Tier::ALL {
                if self.limits(tier).quota(window) == 0 {
                    return Err(GatewayError::Internal(format!(
                        "{tier} quota for the {} window must be positive",
                        window.as_str()
                    )));
                }
            }

            let (free, basic, premium) = (
                self.free.quota(window),
                self.basic.quota(window),
                self.premium.quota(window),
            );
            if basic < free || premium < basic {
                return Err(GatewayError::Internal(format!(
                    "tier quotas for the {} window are not monotonic: free={free} basic={basic} premium={premium}",
                    window.as_str()
                )));
            }
        }
        Ok(())
    }
}

/// Counter state for one (key, tier, window).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageWindow {
    pub count: u64,
    pub started_at_ms: i64,
}

impl UsageWindow {
    pub fn fresh(now_ms: i64) -> Self {
        Self {
            count: 0,
            started_at_ms: now_ms,
        }
    }

    pub fn reset_at_ms(&self, window: Window) -> i64 {
        self.started_at_ms + window.length_ms()
    }

    /// A window whose boundary has passed restarts at `now_ms` with an empty count.
    pub fn reclaimed(self, window: Window, now_ms: i64) -> Self {
        if now_ms >= self.reset_at_ms(window) {
            Self::fresh(now_ms)
        } else {
            self
        }
    }

    pub fn usage(&self, window: Window, limit: u64) -> WindowUsage {
        WindowUsage::new(limit, self.count, self.reset_at_ms(window))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowUsage {
    pub limit: u64,
    pub used: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

impl WindowUsage {
    pub fn new(limit: u64, used: u64, reset_at_ms: i64) -> Self {
        Self {
            limit,
            used,
            remaining: limit.saturating_sub(used),
            reset_at: Utc
                .timestamp_millis_opt(reset_at_ms)
                .single()
                .unwrap_or_else(Utc::now),
        }
    }
}

pub type UsageSnapshot = BTreeMap<Window, WindowUsage>;

#[derive(Debug, Clone, Default)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub retry_after: Option<Duration>,
    pub usage: UsageSnapshot,
}

impl RateLimitDecision {
    pub fn minute(&self) -> Option<&WindowUsage> {
        self.usage.get(&Window::Minute)
    }

    fn fail_open() -> Self {
        Self {
            allowed: true,
            retry_after: None,
            usage: BTreeMap::new(),
        }
    }
}

/// What the limiter does when its counter store cannot answer in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFailureMode {
    FailOpen,
    FailClosed,
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Evaluates all four windows and increments them together only when every one has headroom.
    async fn check(&self, key: &str, tier: Tier, limits: &TierLimits)
    -> GatewayResult<RateLimitDecision>;

    async fn usage(&self, key: &str, tier: Tier, limits: &TierLimits) -> GatewayResult<UsageSnapshot>;

    async fn reset(&self, key: &str) -> GatewayResult<()>;

    async fn keys(&self) -> GatewayResult<Vec<String>>;

    /// Drops counters whose every window has expired. Returns how many keys were dropped.
    async fn evict_expired(&self) -> usize {
        0
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    tiers: Arc<TierTable>,
    failure_mode: StoreFailureMode,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        tiers: TierTable,
        failure_mode: StoreFailureMode,
    ) -> GatewayResult<Self> {
        tiers.validate()?;
        Ok(Self {
            store,
            tiers: Arc::new(tiers),
            failure_mode,
        })
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    /// `endpoint` is accepted for per-route overrides; every endpoint shares the key's budget.
    pub async fn check(
        &self,
        key: &str,
        tier: Tier,
        endpoint: &str,
    ) -> GatewayResult<RateLimitDecision> {
        validate_key(key)?;
        let limits = self.tiers.limits(tier);

        match self.store.check(key, tier, limits).await {
            Ok(decision) => Ok(decision),
            Err(GatewayError::CounterStoreUnavailable(reason)) => match self.failure_mode {
                StoreFailureMode::FailOpen => {
                    tracing::warn!(
                        key,
                        tier = %tier,
                        endpoint,
                        store = self.store.name(),
                        error = %reason,
                        "counter store failed; admitting request because fail-open is enabled"
                    );
                    Ok(RateLimitDecision::fail_open())
                }
                StoreFailureMode::FailClosed => {
                    Err(GatewayError::CounterStoreUnavailable(reason))
                }
            },
            Err(err) => Err(err),
        }
    }

    pub async fn get_usage(&self, key: &str, tier: Tier) -> GatewayResult<UsageSnapshot> {
        validate_key(key)?;
        self.store.usage(key, tier, self.tiers.limits(tier)).await
    }

    pub async fn reset(&self, key: &str) -> GatewayResult<()> {
        validate_key(key)?;
        self.store.reset(key).await?;
        tracing::info!(key, store = self.store.name(), "rate limit counters reset");
        Ok(())
    }

    pub async fn tracked_keys(&self) -> GatewayResult<Vec<String>> {
        let mut keys = self.store.keys().await?;
        keys.sort();
        Ok(keys)
    }

    pub async fn evict_expired(&self) -> usize {
        self.store.evict_expired().await
    }
}

/// Periodically drops fully expired counters so idle keys do not accumulate.
pub fn spawn_eviction_task(
    limiter: RateLimiter,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = limiter.evict_expired().await;
                    if evicted > 0 {
                        tracing::debug!(evicted, "expired rate limit counters evicted");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("counter eviction task received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    })
}

fn validate_key(key: &str) -> GatewayResult<()> {
    if key.trim().is_empty() {
        return Err(GatewayError::InvalidKeyOrTier(
            "rate limit key must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Shortest wait until one of the saturated windows reopens, or `None` when all have headroom.
pub(crate) fn earliest_reopen(
    windows: &[UsageWindow; 4],
    limits: &TierLimits,
    now_ms: i64,
) -> Option<Duration> {
    Window::ALL
        .iter()
        .filter(|w| windows[w.index()].count >= limits.quota(**w))
        .map(|w| (windows[w.index()].reset_at_ms(*w) - now_ms).max(1))
        .min()
        .map(|ms| Duration::from_millis(ms as u64))
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use async_trait::async_trait;

    use super::{
        CounterStore, RateLimitDecision, RateLimiter, StoreFailureMode, Tier, TierLimits,
        TierTable, UsageSnapshot, Window,
    };
    use crate::error::{GatewayError, GatewayResult};

    struct UnreachableStore;

    #[async_trait]
    impl CounterStore for UnreachableStore {
        fn name(&self) -> &'static str {
            "unreachable"
        }

        async fn check(&self, _: &str, _: Tier, _: &TierLimits) -> GatewayResult<RateLimitDecision> {
            Err(GatewayError::CounterStoreUnavailable("timed out".to_string()))
        }

        async fn usage(&self, _: &str, _: Tier, _: &TierLimits) -> GatewayResult<UsageSnapshot> {
            Err(GatewayError::CounterStoreUnavailable("timed out".to_string()))
        }

        async fn reset(&self, _: &str) -> GatewayResult<()> {
            Ok(())
        }

        async fn keys(&self) -> GatewayResult<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn default_tiers_are_monotonic() {
        let table = TierTable::default();
        table.validate().expect("default table is valid");

        for window in Window::ALL {
            let free = table.limits(Tier::Free).quota(window);
            let basic = table.limits(Tier::Basic).quota(window);
            let premium = table.limits(Tier::Premium).quota(window);
            assert!(basic >= free, "{window:?}");
            assert!(premium >= basic, "{window:?}");
        }
    }

    #[test]
    fn rejects_inverted_tier_table() {
        let table = TierTable::default().with_limits(Tier::Basic, TierLimits::new(1, 60, 1_000, 10_000));
        assert!(table.validate().is_err());
    }

    #[test]
    fn parses_tier_names_and_rejects_unknown() {
        assert_eq!("PREMIUM".parse::<Tier>().unwrap(), Tier::Premium);
        assert!(matches!(
            "gold".parse::<Tier>(),
            Err(GatewayError::InvalidKeyOrTier(_))
        ));
    }

    #[test]
    fn parses_tier_limits() {
        let limits: TierLimits = "1, 2, 3, 4".parse().unwrap();
        assert_eq!(limits, TierLimits::new(1, 2, 3, 4));
        assert!("1,2,3".parse::<TierLimits>().is_err());
    }

    #[tokio::test]
    async fn empty_key_is_rejected() {
        let limiter = RateLimiter::new(
            Arc::new(UnreachableStore),
            TierTable::default(),
            StoreFailureMode::FailClosed,
        )
        .unwrap();

        let err = limiter.check("  ", Tier::Free, "/").await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidKeyOrTier(_)));
    }

    #[tokio::test]
    async fn store_failure_honours_configured_mode() {
        let open = RateLimiter::new(
            Arc::new(UnreachableStore),
            TierTable::default(),
            StoreFailureMode::FailOpen,
        )
        .unwrap();
        let decision = open.check("ip:10.0.0.1", Tier::Free, "/").await.unwrap();
        assert!(decision.allowed);
        assert!(decision.retry_after.is_none());

        let closed = RateLimiter::new(
            Arc::new(UnreachableStore),
            TierTable::default(),
            StoreFailureMode::FailClosed,
        )
        .unwrap();
        let err = closed.check("ip:10.0.0.1", Tier::Free, "/").await.unwrap_err();
        assert!(matches!(err, GatewayError::CounterStoreUnavailable(_)));
    }

    #[test]
    fn window_lengths() {
        assert_eq!(Window::Minute.duration(), Duration::from_secs(60));
        assert_eq!(Window::Day.length_ms(), 86_400_000);
    }
}
