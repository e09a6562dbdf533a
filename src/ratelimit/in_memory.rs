use std::{
    collections::HashMap,
    sync::Arc,
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::{
    clock::{Clock, SystemClock},
    error::GatewayResult,
    ratelimit::{
        CounterStore, RateLimitDecision, Tier, TierLimits, UsageSnapshot, UsageWindow, Window,
        earliest_reopen,
    },
};

/// Process-local counters, one lock per key.
pub struct InMemoryCounterStore {
    state: DashMap<String, Arc<Mutex<KeyCounters>>>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Default)]
struct KeyCounters {
    tiers: HashMap<Tier, [UsageWindow; 4]>,
}

impl KeyCounters {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.tiers.values().all(|windows| {
            Window::ALL
                .iter()
                .all(|w| windows[w.index()].count == 0 || now_ms >= windows[w.index()].reset_at_ms(*w))
        })
    }
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: DashMap::new(),
            clock,
        }
    }

    fn entry_for(&self, key: &str) -> Arc<Mutex<KeyCounters>> {
        self.state
            .entry(key.to_string())
            .or_default()
            .clone()
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot(windows: &[UsageWindow; 4], limits: &TierLimits) -> UsageSnapshot {
    Window::ALL
        .iter()
        .map(|w| (*w, windows[w.index()].usage(*w, limits.quota(*w))))
        .collect()
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn check(
        &self,
        key: &str,
        tier: Tier,
        limits: &TierLimits,
    ) -> GatewayResult<RateLimitDecision> {
        let counters = self.entry_for(key);
        let mut counters = counters.lock().await;
        let now_ms = self.clock.now_ms();

        let windows = counters
            .tiers
            .entry(tier)
            .or_insert_with(|| [UsageWindow::fresh(now_ms); 4]);
        for window in Window::ALL {
            let slot = &mut windows[window.index()];
            *slot = slot.reclaimed(window, now_ms);
        }

        if let Some(retry_after) = earliest_reopen(windows, limits, now_ms) {
            return Ok(RateLimitDecision {
                allowed: false,
                retry_after: Some(retry_after),
                usage: snapshot(windows, limits),
            });
        }

        for slot in windows.iter_mut() {
            slot.count += 1;
        }

        Ok(RateLimitDecision {
            allowed: true,
            retry_after: None,
            usage: snapshot(windows, limits),
        })
    }

    async fn usage(&self, key: &str, tier: Tier, limits: &TierLimits) -> GatewayResult<UsageSnapshot> {
        let now_ms = self.clock.now_ms();
        let existing = self.state.get(key).map(|entry| entry.value().clone());

        let mut windows = [UsageWindow::fresh(now_ms); 4];
        if let Some(counters) = existing {
            let counters = counters.lock().await;
            if let Some(current) = counters.tiers.get(&tier) {
                windows = *current;
            }
        }

        for window in Window::ALL {
            let slot = &mut windows[window.index()];
            *slot = slot.reclaimed(window, now_ms);
        }

        Ok(snapshot(&windows, limits))
    }

    async fn reset(&self, key: &str) -> GatewayResult<()> {
        let existing = self.state.get(key).map(|entry| entry.value().clone());
        if let Some(counters) = existing {
            counters.lock().await.tiers.clear();
        }
        Ok(())
    }

    async fn keys(&self) -> GatewayResult<Vec<String>> {
        let entries = self
            .state
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect::<Vec<_>>();

        let mut keys = Vec::with_capacity(entries.len());
        for (key, counters) in entries {
            if !counters.lock().await.tiers.is_empty() {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    async fn evict_expired(&self) -> usize {
        let now_ms = self.clock.now_ms();
        let before = self.state.len();
        // Keys with an outstanding handle are mid-check; they are revisited on the next sweep.
        self.state.retain(|_, counters| {
            if Arc::strong_count(counters) > 1 {
                return true;
            }
            match counters.try_lock() {
                Ok(guard) => !guard.is_expired(now_ms),
                Err(_) => true,
            }
        });
        before.saturating_sub(self.state.len())
    }
}
