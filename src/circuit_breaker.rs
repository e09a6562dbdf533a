use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::time::Instant;

use crate::error::GatewayError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_calls: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

/// Either the breaker refused the call or the wrapped call itself failed.
#[derive(Debug)]
pub enum BreakerError<E> {
    Open { name: String },
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open { name } => write!(f, "circuit breaker `{name}` is open"),
            Self::Inner(err) => err.fmt(f),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open { .. } => None,
            Self::Inner(err) => Some(err),
        }
    }
}

impl From<BreakerError<GatewayError>> for GatewayError {
    fn from(err: BreakerError<GatewayError>) -> Self {
        match err {
            BreakerError::Open { name } => GatewayError::CircuitBreakerOpen { name },
            BreakerError::Inner(inner) => inner,
        }
    }
}

/// Independent breakers keyed by the name of what they protect.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerConfig,
    overrides: Arc<HashMap<String, CircuitBreakerConfig>>,
    breakers: Arc<DashMap<String, Arc<Breaker>>>,
}

struct Breaker {
    cfg: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

#[derive(Debug)]
struct BreakerState {
    phase: CircuitState,
    failure_count: u32,
    half_open_calls: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    // Bumped on every transition so late outcomes from an earlier phase are ignored.
    generation: u64,
}

#[derive(Debug, Clone, Copy)]
struct Permit {
    generation: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            phase: CircuitState::Closed,
            failure_count: 0,
            half_open_calls: 0,
            opened_at: None,
            opened_at_wall: None,
            generation: 0,
        }
    }

    fn close(&mut self) {
        self.phase = CircuitState::Closed;
        self.failure_count = 0;
        self.half_open_calls = 0;
        self.opened_at = None;
        self.opened_at_wall = None;
        self.generation += 1;
    }

    fn open(&mut self) {
        self.phase = CircuitState::Open;
        self.half_open_calls = 0;
        self.opened_at = Some(Instant::now());
        self.opened_at_wall = Some(Utc::now());
        self.generation += 1;
    }
}

impl Breaker {
    fn new(cfg: CircuitBreakerConfig) -> Self {
        let cfg = CircuitBreakerConfig {
            failure_threshold: cfg.failure_threshold.max(1),
            half_open_max_calls: cfg.half_open_max_calls.max(1),
            ..cfg
        };
        Self {
            cfg,
            state: Mutex::new(BreakerState::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        // Critical sections never panic midway, so a poisoned state is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn acquire(&self, name: &str) -> Result<Permit, String> {
        let mut state = self.lock();

        match state.phase {
            CircuitState::Closed => Ok(Permit {
                generation: state.generation,
            }),
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|at| at.elapsed() >= self.cfg.recovery_timeout)
                    .unwrap_or(true);
                if !elapsed {
                    return Err(name.to_string());
                }

                // Only the caller holding the lock at expiry performs this transition.
                state.phase = CircuitState::HalfOpen;
                state.half_open_calls = 1;
                state.generation += 1;
                tracing::info!(breaker = name, "circuit half-open; admitting trial call");
                Ok(Permit {
                    generation: state.generation,
                })
            }
            CircuitState::HalfOpen => {
                if state.half_open_calls < self.cfg.half_open_max_calls {
                    state.half_open_calls += 1;
                    Ok(Permit {
                        generation: state.generation,
                    })
                } else {
                    Err(name.to_string())
                }
            }
        }
    }

    fn on_success(&self, name: &str, permit: Permit) {
        let mut state = self.lock();
        if permit.generation != state.generation {
            return;
        }

        match state.phase {
            CircuitState::Closed => state.failure_count = 0,
            CircuitState::HalfOpen => {
                state.close();
                tracing::info!(breaker = name, "circuit closed after successful trial");
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, name: &str, permit: Permit) {
        let mut state = self.lock();
        if permit.generation != state.generation {
            return;
        }

        match state.phase {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.cfg.failure_threshold {
                    state.open();
                    tracing::warn!(
                        breaker = name,
                        failures = state.failure_count,
                        recovery_ms = self.cfg.recovery_timeout.as_millis() as u64,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                state.failure_count += 1;
                state.open();
                tracing::warn!(breaker = name, "trial failed; circuit re-opened");
            }
            CircuitState::Open => {}
        }
    }

    /// A trial dropped before it finished leaves no outcome to close on, so the breaker
    /// re-opens and the recovery timer restarts. Abandoned calls while CLOSED are not failures.
    fn on_abandoned(&self, name: &str, permit: Permit) {
        let mut state = self.lock();
        if permit.generation != state.generation || state.phase != CircuitState::HalfOpen {
            return;
        }
        state.open();
        tracing::warn!(breaker = name, "half-open trial abandoned; circuit re-opened");
    }

    fn snapshot(&self, name: &str) -> BreakerSnapshot {
        let state = self.lock();
        BreakerSnapshot {
            name: name.to_string(),
            state: state.phase,
            failure_count: state.failure_count,
            half_open_calls: state.half_open_calls,
            opened_at: state.opened_at_wall,
        }
    }
}

/// An admitted call that has not reported its outcome yet. Dropping it unsettled, e.g.
/// when the caller's future is cancelled, is reported as abandoned.
struct Trial<'a> {
    breaker: &'a Breaker,
    name: &'a str,
    permit: Option<Permit>,
}

impl Trial<'_> {
    fn settle(mut self, succeeded: bool) {
        if let Some(permit) = self.permit.take() {
            if succeeded {
                self.breaker.on_success(self.name, permit);
            } else {
                self.breaker.on_failure(self.name, permit);
            }
        }
    }
}

impl Drop for Trial<'_> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.breaker.on_abandoned(self.name, permit);
        }
    }
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            defaults,
            overrides: Arc::new(HashMap::new()),
            breakers: Arc::new(DashMap::new()),
        }
    }

    /// Per-name configuration that replaces the defaults for breakers created afterwards.
    pub fn with_overrides(mut self, overrides: HashMap<String, CircuitBreakerConfig>) -> Self {
        self.overrides = Arc::new(overrides);
        self
    }

    fn breaker_for(&self, name: &str) -> Arc<Breaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let cfg = self
                    .overrides
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| self.defaults.clone());
                Arc::new(Breaker::new(cfg))
            })
            .clone()
    }

    /// Runs `f` under the named breaker. `f` is never invoked while the breaker is open,
    /// and its error is handed back untouched after being counted.
    pub async fn call<T, E, F, Fut>(&self, name: &str, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = self.breaker_for(name);
        let permit = breaker
            .acquire(name)
            .map_err(|name| BreakerError::Open { name })?;
        let trial = Trial {
            breaker: &breaker,
            name,
            permit: Some(permit),
        };

        let result = f().await;
        trial.settle(result.is_ok());
        result.map_err(BreakerError::Inner)
    }

    pub async fn get_state(&self, name: &str) -> BreakerSnapshot {
        self.breaker_for(name).snapshot(name)
    }

    pub async fn get_all_states(&self) -> BTreeMap<String, CircuitState> {
        self.snapshots()
            .await
            .into_iter()
            .map(|snapshot| (snapshot.name, snapshot.state))
            .collect()
    }

    pub async fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect::<Vec<_>>();

        let mut out = Vec::with_capacity(breakers.len());
        for (name, breaker) in breakers {
            out.push(breaker.snapshot(&name));
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Forces the breaker closed with zeroed counters, whatever its current state.
    pub async fn reset(&self, name: &str) {
        let breaker = self.breaker_for(name);
        breaker.lock().close();
        tracing::info!(breaker = name, "circuit breaker reset");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            Arc,
            atomic::{AtomicU32, Ordering},
        },
        time::Duration,
    };

    use super::{BreakerError, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};

    fn registry(threshold: u32, recovery_ms: u64, half_open: u32) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_millis(recovery_ms),
            half_open_max_calls: half_open,
        })
    }

    async fn fail(registry: &CircuitBreakerRegistry, name: &str) -> BreakerError<&'static str> {
        registry
            .call(name, || async { Err::<(), _>("boom") })
            .await
            .unwrap_err()
    }

    async fn succeed(registry: &CircuitBreakerRegistry, name: &str) {
        registry
            .call(name, || async { Ok::<_, &'static str>(()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn opens_exactly_on_threshold() {
        let breakers = registry(3, 10_000, 1);

        for expected in 1..=2 {
            assert!(matches!(fail(&breakers, "svc").await, BreakerError::Inner("boom")));
            let state = breakers.get_state("svc").await;
            assert_eq!(state.state, CircuitState::Closed);
            assert_eq!(state.failure_count, expected);
        }

        fail(&breakers, "svc").await;
        assert_eq!(breakers.get_state("svc").await.state, CircuitState::Open);
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let breakers = registry(3, 10_000, 1);

        fail(&breakers, "svc").await;
        fail(&breakers, "svc").await;
        succeed(&breakers, "svc").await;
        assert_eq!(breakers.get_state("svc").await.failure_count, 0);

        fail(&breakers, "svc").await;
        fail(&breakers, "svc").await;
        assert_eq!(breakers.get_state("svc").await.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn open_breaker_fails_fast_without_invoking() {
        let breakers = registry(1, 10_000, 1);
        fail(&breakers, "svc").await;

        let invoked = AtomicU32::new(0);
        let err = breakers
            .call("svc", || async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("should not surface")
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BreakerError::Open { ref name } if name == "svc"));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn trial_after_timeout_moves_to_half_open_then_closed() {
        let breakers = registry(1, 30, 1);
        fail(&breakers, "svc").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let observed = breakers
            .call("svc", || async {
                Ok::<_, &'static str>(breakers.get_state("svc").await.state)
            })
            .await
            .unwrap();
        assert_eq!(observed, CircuitState::HalfOpen);

        let state = breakers.get_state("svc").await;
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens() {
        let breakers = registry(1, 30, 2);
        fail(&breakers, "svc").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(fail(&breakers, "svc").await, BreakerError::Inner(_)));
        assert_eq!(breakers.get_state("svc").await.state, CircuitState::Open);
        assert!(matches!(fail(&breakers, "svc").await, BreakerError::Open { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn thundering_herd_admits_at_most_half_open_budget() {
        let breakers = registry(1, 20, 2);
        fail(&breakers, "svc").await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let invoked = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..32 {
            let breakers = breakers.clone();
            let invoked = invoked.clone();
            handles.push(tokio::spawn(async move {
                breakers
                    .call("svc", || async {
                        invoked.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, &'static str>(())
                    })
                    .await
            }));
        }

        let mut rejected = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), Err(BreakerError::Open { .. })) {
                rejected += 1;
            }
        }

        assert_eq!(invoked.load(Ordering::SeqCst), 2);
        assert_eq!(rejected, 30);
        assert_eq!(breakers.get_state("svc").await.state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_half_open_trial_reopens_breaker() {
        let breakers = registry(1, 20, 1);
        fail(&breakers, "svc").await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let stuck = {
            let breakers = breakers.clone();
            tokio::spawn(async move {
                breakers
                    .call("svc", || async move {
                        let _ = started_tx.send(());
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok::<_, &'static str>(())
                    })
                    .await
            })
        };
        started_rx.await.unwrap();
        assert_eq!(breakers.get_state("svc").await.state, CircuitState::HalfOpen);

        stuck.abort();
        assert!(stuck.await.unwrap_err().is_cancelled());

        let state = breakers.get_state("svc").await;
        assert_eq!(state.state, CircuitState::Open);
        assert_eq!(state.half_open_calls, 0);
        assert!(matches!(fail(&breakers, "svc").await, BreakerError::Open { .. }));

        tokio::time::sleep(Duration::from_millis(40)).await;
        succeed(&breakers, "svc").await;
        assert_eq!(breakers.get_state("svc").await.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn abandoned_call_while_closed_is_not_a_failure() {
        let breakers = registry(1, 60_000, 1);
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let stuck = {
            let breakers = breakers.clone();
            tokio::spawn(async move {
                breakers
                    .call("svc", || async move {
                        let _ = started_tx.send(());
                        std::future::pending::<Result<(), &'static str>>().await
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        stuck.abort();
        let _ = stuck.await;
        let state = breakers.get_state("svc").await;
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.failure_count, 0);
    }

    #[tokio::test]
    async fn names_are_independent_and_overridable() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "fragile".to_string(),
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
                half_open_max_calls: 1,
            },
        );
        let breakers =
            CircuitBreakerRegistry::new(CircuitBreakerConfig::default()).with_overrides(overrides);

        fail(&breakers, "fragile").await;
        fail(&breakers, "sturdy").await;

        let states = breakers.get_all_states().await;
        assert_eq!(states["fragile"], CircuitState::Open);
        assert_eq!(states["sturdy"], CircuitState::Closed);
    }

    #[tokio::test]
    async fn reset_forces_closed() {
        let breakers = registry(1, 60_000, 1);
        fail(&breakers, "svc").await;
        assert_eq!(breakers.get_state("svc").await.state, CircuitState::Open);

        breakers.reset("svc").await;
        let state = breakers.get_state("svc").await;
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.failure_count, 0);
        assert!(state.opened_at.is_none());
        succeed(&breakers, "svc").await;
    }

    #[tokio::test]
    async fn late_failure_from_previous_phase_is_ignored() {
        let breakers = registry(2, 60_000, 1);
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let slow = {
            let breakers = breakers.clone();
            tokio::spawn(async move {
                breakers
                    .call("svc", || async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        Err::<(), _>("late")
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        fail(&breakers, "svc").await;
        fail(&breakers, "svc").await;
        breakers.reset("svc").await;

        release_tx.send(()).unwrap();
        slow.await.unwrap().unwrap_err();
        assert_eq!(breakers.get_state("svc").await.failure_count, 0);
    }
}
