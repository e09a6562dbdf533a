use anyhow::{Context, Result, anyhow};
use std::{
    collections::{HashMap, HashSet},
    env,
    net::SocketAddr,
    time::Duration,
};

use crate::{
    circuit_breaker::CircuitBreakerConfig,
    ratelimit::{StoreFailureMode, Tier, TierLimits, TierTable},
    router::{BackendSpec, health::HealthCheckConfig, strategy::StrategyKind},
};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub log_format: LogFormat,
    pub max_body_bytes: usize,
    pub upstream_timeout: Duration,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerSettings,
    pub routing: RoutingConfig,
    pub analytics_queue_capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub backend: CounterStoreConfig,
    pub tiers: TierTable,
    pub failure_mode: StoreFailureMode,
    pub eviction_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterStoreConfig {
    InMemory,
    Redis {
        url: String,
        key_prefix: String,
        timeout: Duration,
    },
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerSettings {
    pub defaults: CircuitBreakerConfig,
    pub overrides: HashMap<String, CircuitBreakerConfig>,
}

#[derive(Debug, Clone)]
pub struct RoutingConfig {
    pub strategy: StrategyKind,
    pub health: HealthCheckConfig,
    pub backends: Vec<BackendConfig>,
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub service: String,
    pub spec: BackendSpec,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    pub path_prefix: String,
    pub service: String,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        let log_format = match env::var("LOG_FORMAT")
            .unwrap_or_else(|_| "compact".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "compact" | "text" => LogFormat::Compact,
            "json" => LogFormat::Json,
            other => return Err(anyhow!("unsupported LOG_FORMAT: {other}")),
        };

        let backend = match env::var("RATE_LIMIT_BACKEND")
            .unwrap_or_else(|_| "memory".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" | "in_memory" => CounterStoreConfig::InMemory,
            "redis" => CounterStoreConfig::Redis {
                url: env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
                key_prefix: env::var("REDIS_KEY_PREFIX")
                    .unwrap_or_else(|_| "gateway:ratelimit".to_string()),
                timeout: Duration::from_millis(parse_env("RATE_LIMIT_STORE_TIMEOUT_MS", 50u64)),
            },
            other => return Err(anyhow!("unsupported RATE_LIMIT_BACKEND: {other}")),
        };

        let mut tiers = TierTable::default();
        for tier in Tier::ALL {
            let key = format!("RATE_LIMIT_TIER_{}", tier.as_str().to_ascii_uppercase());
            if let Ok(raw) = env::var(&key) {
                let limits = raw
                    .parse::<TierLimits>()
                    .map_err(|e| anyhow!("invalid {key}: {e}"))?;
                tiers = tiers.with_limits(tier, limits);
            }
        }
        tiers.validate().map_err(|e| anyhow!("invalid tier table: {e}"))?;

        let rate_limit = RateLimitConfig {
            backend,
            tiers,
            failure_mode: if parse_env("RATE_LIMIT_FAIL_OPEN", false) {
                StoreFailureMode::FailOpen
            } else {
                StoreFailureMode::FailClosed
            },
            eviction_interval: Duration::from_secs(
                parse_env("RATE_LIMIT_EVICTION_INTERVAL_SECONDS", 60u64).max(1),
            ),
        };

        let defaults = CircuitBreakerConfig {
            failure_threshold: parse_env("CB_FAILURE_THRESHOLD", 5u32).max(1),
            recovery_timeout: Duration::from_secs(parse_env("CB_RECOVERY_SECONDS", 30u64)),
            half_open_max_calls: parse_env("CB_HALF_OPEN_MAX", 1u32).max(1),
        };
        let overrides = parse_breaker_overrides(&env::var("CB_OVERRIDES").unwrap_or_default())?;

        let strategy = env::var("ROUTING_STRATEGY")
            .unwrap_or_else(|_| "weighted_random".to_string())
            .parse::<StrategyKind>()
            .map_err(|e| anyhow!(e))?;

        let health = HealthCheckConfig {
            interval: Duration::from_secs(parse_env("HEALTH_CHECK_INTERVAL_SECONDS", 10u64).max(1)),
            probe_timeout: Duration::from_millis(parse_env("HEALTH_CHECK_TIMEOUT_MS", 2_000u64)),
            max_concurrent_probes: parse_env("HEALTH_CHECK_CONCURRENCY", 8usize).max(1),
        };

        let backends = parse_backends(&env::var("BACKENDS").unwrap_or_else(|_| {
            "search/search-a=http://127.0.0.1:9001@1@/health,search/search-b=http://127.0.0.1:9002@1@/health"
                .into()
        }))?;
        let routes = parse_routes(&env::var("ROUTES").unwrap_or_else(|_| "/=search".into()))?;
        check_routes(&routes, &backends)?;

        Ok(Self {
            bind_addr,
            log_format,
            max_body_bytes: parse_env("MAX_BODY_BYTES", 1_048_576usize),
            upstream_timeout: Duration::from_millis(parse_env("UPSTREAM_TIMEOUT_MS", 3_000u64).max(100)),
            rate_limit,
            circuit_breaker: CircuitBreakerSettings {
                defaults,
                overrides,
            },
            routing: RoutingConfig {
                strategy,
                health,
                backends,
                routes,
            },
            analytics_queue_capacity: parse_env("ANALYTICS_QUEUE_CAPACITY", 4_096usize).max(1),
        })
    }
}

/// `service/name=url@weight@health_url`, comma separated. A health path starting with `/`
/// is joined onto the backend URL.
fn parse_backends(raw: &str) -> Result<Vec<BackendConfig>> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();

    for chunk in raw.split(',').filter(|c| !c.trim().is_empty()) {
        let (lhs, rhs) = chunk
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid backend entry: {chunk}"))?;
        let (service, name) = lhs
            .trim()
            .split_once('/')
            .map(|(s, n)| (s.trim(), n.trim()))
            .filter(|(s, n)| !s.is_empty() && !n.is_empty())
            .ok_or_else(|| anyhow!("backend entry needs `service/name`: {chunk}"))?;

        let spec: Vec<&str> = rhs.trim().split('@').collect();
        let url = spec
            .first()
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("invalid backend URL for {name}"))?;
        let weight = spec
            .get(1)
            .map(|s| s.trim().parse::<u32>().context("invalid backend weight"))
            .transpose()?
            .unwrap_or(1);
        if weight == 0 {
            return Err(anyhow!("backend {name} must have a positive weight"));
        }
        let health_check_url = spec
            .get(2)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| {
                if s.starts_with('/') {
                    format!("{url}{s}")
                } else {
                    s.to_string()
                }
            });

        if !seen.insert(name.to_string()) {
            return Err(anyhow!("duplicate backend name: {name}"));
        }

        out.push(BackendConfig {
            service: service.to_string(),
            spec: BackendSpec {
                name: name.to_string(),
                url,
                weight,
                health_check_url,
            },
        });
    }

    if out.is_empty() {
        return Err(anyhow!("no backends configured"));
    }
    Ok(out)
}

fn parse_routes(raw: &str) -> Result<Vec<RouteConfig>> {
    let mut out = Vec::new();
    for chunk in raw.split(',').filter(|c| !c.trim().is_empty()) {
        let mut parts = chunk.splitn(2, '=');
        let path_prefix = parts
            .next()
            .map(str::trim)
            .filter(|s| s.starts_with('/'))
            .ok_or_else(|| anyhow!("invalid route entry: {chunk}"))?
            .to_string();

        let service = parts
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("route has no service: {chunk}"))?
            .to_string();

        out.push(RouteConfig {
            path_prefix,
            service,
        });
    }

    if out.is_empty() {
        return Err(anyhow!("no routes configured"));
    }
    Ok(out)
}

fn check_routes(routes: &[RouteConfig], backends: &[BackendConfig]) -> Result<()> {
    let services = backends
        .iter()
        .map(|b| b.service.as_str())
        .collect::<HashSet<_>>();
    for route in routes {
        if !services.contains(route.service.as_str()) {
            return Err(anyhow!(
                "route {} targets unknown service {}",
                route.path_prefix,
                route.service
            ));
        }
    }
    Ok(())
}

/// `name=threshold:recovery_secs:half_open_max`, comma separated.
fn parse_breaker_overrides(raw: &str) -> Result<HashMap<String, CircuitBreakerConfig>> {
    let mut out = HashMap::new();
    for chunk in raw.split(',').filter(|c| !c.trim().is_empty()) {
        let (name, rhs) = chunk
            .split_once('=')
            .map(|(n, r)| (n.trim(), r.trim()))
            .filter(|(n, _)| !n.is_empty())
            .ok_or_else(|| anyhow!("invalid breaker override: {chunk}"))?;

        let fields = rhs
            .split(':')
            .map(|f| f.trim().parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("invalid breaker override for {name}"))?;
        let &[threshold, recovery_secs, half_open] = fields.as_slice() else {
            return Err(anyhow!(
                "breaker override for {name} needs threshold:recovery_secs:half_open_max"
            ));
        };

        out.insert(
            name.to_string(),
            CircuitBreakerConfig {
                failure_threshold: u32::try_from(threshold.max(1))
                    .context("breaker threshold out of range")?,
                recovery_timeout: Duration::from_secs(recovery_secs),
                half_open_max_calls: u32::try_from(half_open.max(1))
                    .context("breaker half-open limit out of range")?,
            },
        );
    }
    Ok(out)
}

fn parse_env<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}
