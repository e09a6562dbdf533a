pub mod health;
pub mod strategy;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use crate::{
    circuit_breaker::{BreakerError, CircuitBreakerRegistry},
    error::{GatewayError, GatewayResult},
    router::{
        health::{HealthCheckConfig, HealthProbe},
        strategy::SelectionStrategy,
    },
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSpec {
    pub name: String,
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub health_check_url: Option<String>,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug)]
pub struct Backend {
    pub name: String,
    pub service: String,
    pub url: String,
    pub weight: u32,
    pub health_check_url: Option<String>,
    healthy: AtomicBool,
    stats: BackendStats,
}

#[derive(Debug, Default)]
struct BackendStats {
    requests: AtomicU64,
    failures: AtomicU64,
    avg_latency_micros: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendStatsSnapshot {
    pub service: String,
    pub url: String,
    pub weight: u32,
    pub is_healthy: bool,
    pub requests: u64,
    pub failures: u64,
    pub avg_latency_ms: u64,
}

impl Backend {
    pub fn new(service: &str, spec: BackendSpec) -> Self {
        Self {
            name: spec.name,
            service: service.to_string(),
            url: spec.url.trim_end_matches('/').to_string(),
            weight: spec.weight,
            health_check_url: spec.health_check_url.filter(|u| !u.trim().is_empty()),
            healthy: AtomicBool::new(true),
            stats: BackendStats::default(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Returns the previous value.
    pub(crate) fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::AcqRel)
    }

    fn record_success(&self, latency: Duration) {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);

        let latency_micros = latency.as_micros() as u64;
        let current = self.stats.avg_latency_micros.load(Ordering::Relaxed);
        let updated = if current == 0 {
            latency_micros
        } else {
            (current * 7 + latency_micros) / 8
        };
        self.stats.avg_latency_micros.store(updated, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        self.stats.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BackendStatsSnapshot {
        BackendStatsSnapshot {
            service: self.service.clone(),
            url: self.url.clone(),
            weight: self.weight,
            is_healthy: self.is_healthy(),
            requests: self.stats.requests.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            avg_latency_ms: self.stats.avg_latency_micros.load(Ordering::Relaxed) / 1_000,
        }
    }
}

/// A value produced by the backend the router dispatched to.
#[derive(Debug)]
pub struct Routed<T> {
    pub backend: String,
    pub value: T,
}

#[derive(Debug)]
pub enum DispatchError<E> {
    NoHealthyBackend { service: String },
    BreakerOpen { name: String },
    Backend { backend: String, error: E },
}

impl<E: fmt::Display> fmt::Display for DispatchError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoHealthyBackend { service } => {
                write!(f, "no healthy backend for service `{service}`")
            }
            Self::BreakerOpen { name } => write!(f, "circuit breaker `{name}` is open"),
            Self::Backend { error, .. } => error.fmt(f),
        }
    }
}

impl From<DispatchError<GatewayError>> for GatewayError {
    fn from(err: DispatchError<GatewayError>) -> Self {
        match err {
            DispatchError::NoHealthyBackend { service } => GatewayError::NoHealthyBackend { service },
            DispatchError::BreakerOpen { name } => GatewayError::CircuitBreakerOpen { name },
            DispatchError::Backend { error, .. } => error,
        }
    }
}

type Table = Arc<Vec<Arc<Backend>>>;

/// Backend tables per logical service. Each table is replaced wholesale on mutation,
/// so a selection always works from a complete snapshot.
pub struct RequestRouter {
    tables: DashMap<String, Table>,
    strategy: Arc<dyn SelectionStrategy>,
    probe: Arc<dyn HealthProbe>,
    health: HealthCheckConfig,
}

impl RequestRouter {
    pub fn new(
        strategy: Arc<dyn SelectionStrategy>,
        probe: Arc<dyn HealthProbe>,
        health: HealthCheckConfig,
    ) -> Self {
        Self {
            tables: DashMap::new(),
            strategy,
            probe,
            health,
        }
    }

    fn table(&self, service: &str) -> Table {
        self.tables
            .get(service)
            .map(|t| t.value().clone())
            .unwrap_or_default()
    }

    pub fn services(&self) -> Vec<String> {
        let mut services = self.tables.iter().map(|t| t.key().clone()).collect::<Vec<_>>();
        services.sort();
        services
    }

    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.tables
            .iter()
            .flat_map(|t| t.value().iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn add_backend(&self, service: &str, spec: BackendSpec) -> GatewayResult<Arc<Backend>> {
        if service.trim().is_empty() {
            return Err(GatewayError::InvalidBackend("service must not be empty".to_string()));
        }
        if spec.name.trim().is_empty() {
            return Err(GatewayError::InvalidBackend("name must not be empty".to_string()));
        }
        if spec.weight == 0 {
            return Err(GatewayError::InvalidBackend(format!(
                "backend `{}` weight must be positive",
                spec.name
            )));
        }
        reqwest::Url::parse(&spec.url).map_err(|e| {
            GatewayError::InvalidBackend(format!("backend `{}` url: {e}", spec.name))
        })?;

        if let Some(owner) = self
            .backends()
            .into_iter()
            .find(|b| b.name == spec.name && b.service != service)
        {
            return Err(GatewayError::InvalidBackend(format!(
                "backend `{}` already serves `{}`",
                spec.name, owner.service
            )));
        }

        let backend = Arc::new(Backend::new(service, spec));
        let mut entry = self.tables.entry(service.to_string()).or_default();
        let mut next = entry
            .iter()
            .filter(|b| b.name != backend.name)
            .cloned()
            .collect::<Vec<_>>();
        next.push(backend.clone());
        *entry = Arc::new(next);

        tracing::info!(
            service,
            backend = %backend.name,
            url = %backend.url,
            weight = backend.weight,
            "backend added"
        );
        Ok(backend)
    }

    /// Returns whether a backend with that name existed.
    pub fn remove_backend(&self, name: &str) -> bool {
        let mut removed = false;
        for service in self.services() {
            if let Some(mut entry) = self.tables.get_mut(&service)
                && entry.iter().any(|b| b.name == name)
            {
                let next = entry
                    .iter()
                    .filter(|b| b.name != name)
                    .cloned()
                    .collect::<Vec<_>>();
                *entry = Arc::new(next);
                removed = true;
                tracing::info!(service = %service, backend = name, "backend removed");
            }
        }
        removed
    }

    pub fn select(&self, service: &str) -> GatewayResult<Arc<Backend>> {
        self.select_excluding(service, &HashSet::new())
    }

    fn select_excluding(
        &self,
        service: &str,
        excluded: &HashSet<String>,
    ) -> GatewayResult<Arc<Backend>> {
        let table = self.table(service);
        let candidates = table
            .iter()
            .filter(|b| b.is_healthy() && !excluded.contains(&b.name))
            .cloned()
            .collect::<Vec<_>>();

        self.strategy
            .pick(&candidates)
            .ok_or_else(|| GatewayError::NoHealthyBackend {
                service: service.to_string(),
            })
    }

    /// Selects a backend and runs `call` against it under that backend's breaker.
    /// Backends whose breaker is open are skipped in favour of the remaining healthy ones;
    /// the breaker error only surfaces once no alternative is left.
    pub async fn dispatch<T, E, F, Fut>(
        &self,
        service: &str,
        breakers: &CircuitBreakerRegistry,
        mut call: F,
    ) -> Result<Routed<T>, DispatchError<E>>
    where
        F: FnMut(Arc<Backend>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut skipped = HashSet::new();
        let mut last_open: Option<String> = None;

        loop {
            let selected = if skipped.is_empty() {
                self.select(service)
            } else {
                self.select_excluding(service, &skipped)
            };
            let backend = match selected {
                Ok(backend) => backend,
                Err(_) => {
                    return Err(match last_open {
                        Some(name) => DispatchError::BreakerOpen { name },
                        None => DispatchError::NoHealthyBackend {
                            service: service.to_string(),
                        },
                    });
                }
            };

            let started = Instant::now();
            match breakers.call(&backend.name, || call(backend.clone())).await {
                Ok(value) => {
                    backend.record_success(started.elapsed());
                    return Ok(Routed {
                        backend: backend.name.clone(),
                        value,
                    });
                }
                Err(BreakerError::Open { name }) => {
                    tracing::debug!(
                        service,
                        backend = %backend.name,
                        "breaker open; trying another backend"
                    );
                    skipped.insert(backend.name.clone());
                    last_open = Some(name);
                }
                Err(BreakerError::Inner(error)) => {
                    backend.record_failure();
                    return Err(DispatchError::Backend {
                        backend: backend.name.clone(),
                        error,
                    });
                }
            }
        }
    }

    pub fn get_backend_stats(&self) -> BTreeMap<String, BackendStatsSnapshot> {
        self.backends()
            .into_iter()
            .map(|b| (b.name.clone(), b.snapshot()))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::HashMap,
        sync::{
            Arc,
            atomic::{AtomicU32, Ordering},
        },
        time::Duration,
    };

    use super::{BackendSpec, DispatchError, RequestRouter};
    use crate::{
        circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState},
        error::GatewayError,
        router::{
            health::{HealthCheckConfig, tests::StaticProbe},
            strategy::StrategyKind,
        },
    };

    pub(crate) fn spec(name: &str, weight: u32) -> BackendSpec {
        BackendSpec {
            name: name.to_string(),
            url: format!("http://{name}.internal:8080"),
            weight,
            health_check_url: None,
        }
    }

    pub(crate) fn router() -> RequestRouter {
        RequestRouter::new(
            StrategyKind::WeightedRoundRobin.build(),
            Arc::new(StaticProbe::default()),
            HealthCheckConfig::default(),
        )
    }

    #[test]
    fn single_backend_is_always_selected() {
        let router = router();
        router.add_backend("search", spec("only", 1)).unwrap();

        for _ in 0..50 {
            assert_eq!(router.select("search").unwrap().name, "only");
        }
    }

    #[test]
    fn never_selects_unhealthy_when_healthy_exists() {
        let router = router();
        router.add_backend("search", spec("up", 1)).unwrap();
        let down = router.add_backend("search", spec("down", 10)).unwrap();
        down.set_healthy(false);

        for _ in 0..100 {
            assert_eq!(router.select("search").unwrap().name, "up");
        }
    }

    #[test]
    fn no_healthy_backend_is_an_error() {
        let router = router();
        let b = router.add_backend("search", spec("a", 1)).unwrap();
        b.set_healthy(false);

        assert!(matches!(
            router.select("search"),
            Err(GatewayError::NoHealthyBackend { ref service }) if service == "search"
        ));
        assert!(router.select("unknown").is_err());
    }

    #[test]
    fn removed_backend_is_gone_for_good() {
        let router = router();
        router.add_backend("search", spec("a", 1)).unwrap();
        router.add_backend("search", spec("b", 1)).unwrap();

        assert!(router.remove_backend("a"));
        assert!(!router.remove_backend("a"));

        for _ in 0..20 {
            assert_eq!(router.select("search").unwrap().name, "b");
        }
        assert!(!router.get_backend_stats().contains_key("a"));
    }

    #[test]
    fn rejects_invalid_backends() {
        let router = router();
        assert!(router.add_backend("search", spec("zero", 0)).is_err());
        assert!(router.add_backend("", spec("a", 1)).is_err());

        let mut bad_url = spec("bad", 1);
        bad_url.url = "not a url".to_string();
        assert!(router.add_backend("search", bad_url).is_err());

        router.add_backend("search", spec("shared", 1)).unwrap();
        assert!(router.add_backend("documents", spec("shared", 1)).is_err());
    }

    #[test]
    fn re_adding_replaces_in_place() {
        let router = router();
        router.add_backend("search", spec("a", 1)).unwrap();
        router.add_backend("search", spec("a", 5)).unwrap();

        let stats = router.get_backend_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats["a"].weight, 5);
    }

    fn breakers(threshold: u32) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        })
    }

    #[tokio::test]
    async fn dispatch_skips_open_breaker() {
        let router = router();
        router.add_backend("search", spec("a", 1)).unwrap();
        router.add_backend("search", spec("b", 1)).unwrap();
        let breakers = breakers(1);

        let _ = breakers.call("a", || async { Err::<(), _>("down") }).await;
        assert_eq!(breakers.get_state("a").await.state, CircuitState::Open);

        for _ in 0..10 {
            let routed = router
                .dispatch("search", &breakers, |backend| async move {
                    Ok::<_, String>(backend.name.clone())
                })
                .await
                .unwrap();
            assert_eq!(routed.backend, "b");
            assert_eq!(routed.value, "b");
        }
    }

    #[tokio::test]
    async fn dispatch_surfaces_breaker_open_without_alternative() {
        let router = router();
        router.add_backend("search", spec("a", 1)).unwrap();
        let breakers = breakers(1);
        let _ = breakers.call("a", || async { Err::<(), _>("down") }).await;

        let invoked = AtomicU32::new(0);
        let err = router
            .dispatch("search", &breakers, |_| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::BreakerOpen { ref name } if name == "a"));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dispatch_returns_backend_error_unchanged() {
        let router = router();
        router.add_backend("search", spec("a", 1)).unwrap();
        let breakers = breakers(3);

        let err = router
            .dispatch("search", &breakers, |_| async { Err::<(), _>(42u32) })
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Backend { ref backend, error: 42 } if backend == "a"));
        let stats = router.get_backend_stats();
        assert_eq!(stats["a"].requests, 1);
        assert_eq!(stats["a"].failures, 1);
        assert_eq!(breakers.get_state("a").await.failure_count, 1);
    }

    #[tokio::test]
    async fn concurrent_selects_see_complete_tables() {
        let router = Arc::new(router());
        router.add_backend("search", spec("seed", 1)).unwrap();

        let writer = {
            let router = router.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    let name = format!("dyn-{i}");
                    router.add_backend("search", spec(&name, 1)).unwrap();
                    router.remove_backend(&name);
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut seen = HashMap::new();
        for _ in 0..500 {
            let picked = router.select("search").unwrap();
            assert!(!picked.url.is_empty());
            *seen.entry(picked.name.clone()).or_insert(0) += 1;
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
        assert!(seen.contains_key("seed"));
    }
}
