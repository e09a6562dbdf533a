//! Out-of-band backend health probing.
//!
//! Probes never run on the request path: `select` only reads the flag they maintain.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use tokio::{sync::broadcast, task::JoinHandle, time};

use crate::router::{Backend, RequestRouter};

#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub max_concurrent_probes: usize,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
            max_concurrent_probes: 8,
        }
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, url: &str) -> Result<(), String>;
}

pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new() -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .user_agent("admission-gateway-health-check")
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, url: &str) -> Result<(), String> {
        let response = self.client.get(url).send().await.map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("status {}", response.status()))
        }
    }
}

async fn probe_backend(
    probe: &dyn HealthProbe,
    backend: &Backend,
    timeout: Duration,
) -> bool {
    let Some(url) = backend.health_check_url.as_deref() else {
        return true;
    };

    match time::timeout(timeout, probe.probe(url)).await {
        Ok(Ok(())) => true,
        Ok(Err(reason)) => {
            tracing::warn!(backend = %backend.name, url, error = %reason, "health check failed");
            false
        }
        Err(_) => {
            tracing::warn!(
                backend = %backend.name,
                url,
                timeout_ms = timeout.as_millis() as u64,
                "health check timed out"
            );
            false
        }
    }
}

impl RequestRouter {
    /// Probes every backend, at most `max_concurrent_probes` at a time, and records the result.
    pub async fn health_check_all(&self) -> BTreeMap<String, bool> {
        let timeout = self.health.probe_timeout;
        let probe = self.probe.clone();

        let results = stream::iter(self.backends())
            .map(|backend| {
                let probe = probe.clone();
                async move {
                    let healthy = probe_backend(probe.as_ref(), &backend, timeout).await;
                    (backend, healthy)
                }
            })
            .buffer_unordered(self.health.max_concurrent_probes.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut report = BTreeMap::new();
        for (backend, healthy) in results {
            let was_healthy = backend.set_healthy(healthy);
            if was_healthy != healthy {
                if healthy {
                    tracing::info!(backend = %backend.name, service = %backend.service, "backend recovered");
                } else {
                    tracing::warn!(backend = %backend.name, service = %backend.service, "backend marked unhealthy");
                }
            }
            report.insert(backend.name.clone(), healthy);
        }
        report
    }
}

/// Runs `health_check_all` every `interval` until shutdown is signalled.
pub fn spawn_health_monitor(
    router: Arc<RequestRouter>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = router.health.interval;
        tracing::info!(interval_ms = interval.as_millis() as u64, "health monitor starting");

        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = router.health_check_all().await;
                    let unhealthy = report.values().filter(|h| !**h).count();
                    tracing::debug!(probed = report.len(), unhealthy, "health sweep finished");
                }
                _ = shutdown.recv() => {
                    tracing::info!("health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::HashMap,
        sync::{
            Arc,
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::{Duration, Instant},
    };

    use async_trait::async_trait;
    use tokio::sync::broadcast;

    use super::{HealthCheckConfig, HealthProbe, spawn_health_monitor};
    use crate::router::{
        BackendSpec, RequestRouter,
        strategy::StrategyKind,
    };

    #[derive(Clone, Copy, Debug)]
    pub(crate) enum ProbeBehaviour {
        Up,
        Down,
        Hang,
    }

    /// Answers per URL; unknown URLs are up.
    #[derive(Default)]
    pub(crate) struct StaticProbe {
        pub behaviour: Mutex<HashMap<String, ProbeBehaviour>>,
        pub in_flight: AtomicUsize,
        pub peak_in_flight: AtomicUsize,
    }

    impl StaticProbe {
        pub(crate) fn set(&self, url: &str, behaviour: ProbeBehaviour) {
            self.behaviour
                .lock()
                .unwrap()
                .insert(url.to_string(), behaviour);
        }
    }

    #[async_trait]
    impl HealthProbe for StaticProbe {
        async fn probe(&self, url: &str) -> Result<(), String> {
            let behaviour = self
                .behaviour
                .lock()
                .unwrap()
                .get(url)
                .copied()
                .unwrap_or(ProbeBehaviour::Up);

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;

            let result = match behaviour {
                ProbeBehaviour::Up => Ok(()),
                ProbeBehaviour::Down => Err("status 503".to_string()),
                ProbeBehaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3_600)).await;
                    Ok(())
                }
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn router_with(probe: Arc<StaticProbe>, max_concurrent_probes: usize) -> RequestRouter {
        RequestRouter::new(
            StrategyKind::WeightedRandom.build(),
            probe,
            HealthCheckConfig {
                interval: Duration::from_millis(20),
                probe_timeout: Duration::from_millis(100),
                max_concurrent_probes,
            },
        )
    }

    fn with_health(name: &str) -> BackendSpec {
        BackendSpec {
            name: name.to_string(),
            url: format!("http://{name}.internal"),
            weight: 1,
            health_check_url: Some(format!("http://{name}.internal/health")),
        }
    }

    #[tokio::test]
    async fn marks_failed_and_hung_backends_unhealthy() {
        let probe = Arc::new(StaticProbe::default());
        probe.set("http://down.internal/health", ProbeBehaviour::Down);
        probe.set("http://hung.internal/health", ProbeBehaviour::Hang);
        let router = router_with(probe, 4);

        router.add_backend("search", with_health("up")).unwrap();
        router.add_backend("search", with_health("down")).unwrap();
        router.add_backend("search", with_health("hung")).unwrap();
        router
            .add_backend(
                "search",
                BackendSpec {
                    name: "unprobed".to_string(),
                    url: "http://unprobed.internal".to_string(),
                    weight: 1,
                    health_check_url: None,
                },
            )
            .unwrap();

        let started = Instant::now();
        let report = router.health_check_all().await;
        assert!(started.elapsed() < Duration::from_secs(2));

        assert_eq!(report["up"], true);
        assert_eq!(report["down"], false);
        assert_eq!(report["hung"], false);
        assert_eq!(report["unprobed"], true);

        let stats = router.get_backend_stats();
        assert!(!stats["down"].is_healthy);
        for _ in 0..50 {
            let picked = router.select("search").unwrap();
            assert!(picked.name == "up" || picked.name == "unprobed");
        }
    }

    #[tokio::test]
    async fn recovered_backend_becomes_selectable() {
        let probe = Arc::new(StaticProbe::default());
        probe.set("http://flaky.internal/health", ProbeBehaviour::Down);
        let router = router_with(probe.clone(), 2);
        router.add_backend("search", with_health("flaky")).unwrap();

        router.health_check_all().await;
        assert!(router.select("search").is_err());

        probe.set("http://flaky.internal/health", ProbeBehaviour::Up);
        router.health_check_all().await;
        assert_eq!(router.select("search").unwrap().name, "flaky");
    }

    #[tokio::test]
    async fn caps_concurrent_probes() {
        let probe = Arc::new(StaticProbe::default());
        let router = router_with(probe.clone(), 3);
        for i in 0..12 {
            router.add_backend("search", with_health(&format!("b{i}"))).unwrap();
        }

        let report = router.health_check_all().await;
        assert_eq!(report.len(), 12);
        assert!(probe.peak_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn monitor_updates_health_until_shutdown() {
        let probe = Arc::new(StaticProbe::default());
        probe.set("http://down.internal/health", ProbeBehaviour::Down);
        let router = Arc::new(router_with(probe, 2));
        router.add_backend("search", with_health("down")).unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = spawn_health_monitor(router.clone(), shutdown_rx);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!router.get_backend_stats()["down"].is_healthy);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor stops on shutdown")
            .unwrap();
    }
}
