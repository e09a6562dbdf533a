use std::{
    future::Future,
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use chrono::Utc;
use serde::Serialize;

use crate::{
    analytics::{AnalyticsRecord, AnalyticsSink, LogSink, Outcome, QueuedSink},
    circuit_breaker::CircuitBreakerRegistry,
    config::{CounterStoreConfig, GatewayConfig},
    error::{GatewayError, GatewayResult, ceil_secs},
    metrics::GatewayMetrics,
    ratelimit::{
        CounterStore, RateLimitDecision, RateLimiter, Tier,
        in_memory::InMemoryCounterStore,
        redis_backend::RedisCounterStore,
    },
    router::{
        Backend, DispatchError, RequestRouter, Routed,
        health::HttpHealthProbe,
    },
};

/// What the gateway knows about the caller of one request. Identity and tier are
/// resolved upstream; the gateway only turns them into a rate-limit key.
#[derive(Debug, Clone)]
pub struct CallerDescriptor {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub client_ip: Option<IpAddr>,
    pub user_id: Option<String>,
    pub tier: Option<Tier>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub key: String,
    pub tier: Tier,
}

impl CallerDescriptor {
    pub fn new(request_id: impl Into<String>, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            method: method.into(),
            path: path.into(),
            client_ip: None,
            user_id: None,
            tier: None,
        }
    }

    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>, tier: Option<Tier>) -> Self {
        self.user_id = Some(user_id.into());
        self.tier = tier;
        self
    }

    /// Authenticated callers are keyed by user with their subscription tier (FREE when
    /// none is supplied); anonymous callers are keyed by address on the FREE tier.
    pub fn identity(&self) -> GatewayResult<Identity> {
        match (&self.user_id, self.client_ip) {
            (Some(user_id), _) => {
                let user_id = user_id.trim();
                if user_id.is_empty() {
                    return Err(GatewayError::InvalidKeyOrTier(
                        "user id must not be empty".to_string(),
                    ));
                }
                Ok(Identity {
                    key: format!("user:{user_id}"),
                    tier: self.tier.unwrap_or(Tier::Free),
                })
            }
            (None, Some(ip)) => Ok(Identity {
                key: format!("ip:{ip}"),
                tier: Tier::Free,
            }),
            (None, None) => Err(GatewayError::InvalidKeyOrTier(
                "caller has neither a user id nor a client address".to_string(),
            )),
        }
    }
}

/// Minute-window quota state for the HTTP layer's `X-RateLimit-*` and `Retry-After` headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    pub reset_epoch_secs: i64,
    pub retry_after_secs: Option<u64>,
}

impl RateLimitHeaders {
    pub fn from_decision(decision: &RateLimitDecision) -> Option<Self> {
        let minute = decision.minute()?;
        Some(Self {
            limit: minute.limit,
            remaining: minute.remaining,
            reset_epoch_secs: minute.reset_at.timestamp(),
            retry_after_secs: (!decision.allowed)
                .then(|| ceil_secs(decision.retry_after.unwrap_or_default())),
        })
    }

    pub fn apply(&self, headers: &mut HeaderMap) {
        let pairs = [
            (HeaderName::from_static("x-ratelimit-limit"), self.limit.to_string()),
            (HeaderName::from_static("x-ratelimit-remaining"), self.remaining.to_string()),
            (HeaderName::from_static("x-ratelimit-reset"), self.reset_epoch_secs.to_string()),
        ];
        for (name, value) in pairs {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(name, value);
            }
        }

        if let Some(retry_after) = self.retry_after_secs
            && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert(header::RETRY_AFTER, value);
        }
    }
}

#[derive(Debug)]
pub struct GatewayOutcome<T> {
    pub rate_limit: Option<RateLimitHeaders>,
    pub result: GatewayResult<Routed<T>>,
}

pub struct Gateway {
    limiter: RateLimiter,
    breakers: CircuitBreakerRegistry,
    router: Arc<RequestRouter>,
    analytics: Arc<dyn AnalyticsSink>,
    metrics: Arc<GatewayMetrics>,
}

impl Gateway {
    pub fn new(
        limiter: RateLimiter,
        breakers: CircuitBreakerRegistry,
        router: Arc<RequestRouter>,
        analytics: Arc<dyn AnalyticsSink>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            limiter,
            breakers,
            router,
            analytics,
            metrics,
        }
    }

    pub async fn from_config(config: &GatewayConfig) -> GatewayResult<Self> {
        let metrics = Arc::new(GatewayMetrics::new());

        let store: Arc<dyn CounterStore> = match &config.rate_limit.backend {
            CounterStoreConfig::InMemory => Arc::new(InMemoryCounterStore::new()),
            CounterStoreConfig::Redis {
                url,
                key_prefix,
                timeout,
            } => Arc::new(RedisCounterStore::new(url.clone(), key_prefix.clone(), *timeout).await?),
        };
        let limiter = RateLimiter::new(
            store,
            config.rate_limit.tiers.clone(),
            config.rate_limit.failure_mode,
        )?;

        let breakers = CircuitBreakerRegistry::new(config.circuit_breaker.defaults.clone())
            .with_overrides(config.circuit_breaker.overrides.clone());

        let probe = HttpHealthProbe::new().map_err(|e| GatewayError::Internal(e.to_string()))?;
        let router = Arc::new(RequestRouter::new(
            config.routing.strategy.build(),
            Arc::new(probe),
            config.routing.health.clone(),
        ));
        for backend in &config.routing.backends {
            router.add_backend(&backend.service, backend.spec.clone())?;
        }

        let (analytics, _drain) = QueuedSink::spawn(
            config.analytics_queue_capacity,
            Arc::new(LogSink),
            metrics.clone(),
        );

        Ok(Self::new(
            limiter,
            breakers,
            router,
            Arc::new(analytics),
            metrics,
        ))
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn router(&self) -> &Arc<RequestRouter> {
        &self.router
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    /// Admits, routes and dispatches one request. The limiter always runs first, so a
    /// denied request never reaches the router or spends breaker trial budget.
    pub async fn handle<T, F, Fut>(
        &self,
        caller: &CallerDescriptor,
        service: &str,
        call: F,
    ) -> GatewayOutcome<T>
    where
        F: FnMut(Arc<Backend>) -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let started = Instant::now();

        let identity = match caller.identity() {
            Ok(identity) => identity,
            Err(err) => {
                self.metrics.rejected_caller();
                self.emit(caller, None, service, None, Outcome::InvalidCaller, started);
                return GatewayOutcome {
                    rate_limit: None,
                    result: Err(err),
                };
            }
        };

        let decision = match self
            .limiter
            .check(&identity.key, identity.tier, &caller.path)
            .await
        {
            Ok(decision) => decision,
            Err(err) => {
                let outcome = match err {
                    GatewayError::InvalidKeyOrTier(_) => {
                        self.metrics.rejected_caller();
                        Outcome::InvalidCaller
                    }
                    _ => Outcome::LimiterUnavailable,
                };
                tracing::warn!(
                    request_id = %caller.request_id,
                    key = %identity.key,
                    error = %err,
                    "rate limit check failed"
                );
                self.emit(caller, Some(&identity), service, None, outcome, started);
                return GatewayOutcome {
                    rate_limit: None,
                    result: Err(err),
                };
            }
        };

        let rate_limit = RateLimitHeaders::from_decision(&decision);

        if !decision.allowed {
            let retry_after = decision.retry_after.unwrap_or(Duration::from_secs(1));
            self.metrics.rate_limited();
            tracing::info!(
                request_id = %caller.request_id,
                key = %identity.key,
                tier = %identity.tier,
                retry_after_ms = retry_after.as_millis() as u64,
                "request rate limited"
            );
            self.emit(caller, Some(&identity), service, None, Outcome::RateLimited, started);
            return GatewayOutcome {
                rate_limit,
                result: Err(GatewayError::RateLimitExceeded { retry_after }),
            };
        }

        self.metrics.admitted();
        let result = self.router.dispatch(service, &self.breakers, call).await;

        let (outcome, backend) = match &result {
            Ok(routed) => {
                self.metrics.completed();
                (Outcome::Success, Some(routed.backend.clone()))
            }
            Err(DispatchError::BreakerOpen { name }) => {
                self.metrics.breaker_open();
                (Outcome::BreakerOpen, Some(name.clone()))
            }
            Err(DispatchError::NoHealthyBackend { .. }) => {
                self.metrics.no_backend();
                (Outcome::NoHealthyBackend, None)
            }
            Err(DispatchError::Backend { backend, error }) => {
                self.metrics.backend_failure();
                tracing::warn!(
                    request_id = %caller.request_id,
                    service,
                    backend = %backend,
                    error = %error,
                    "backend call failed"
                );
                (Outcome::BackendFailure, Some(backend.clone()))
            }
        };
        self.emit(caller, Some(&identity), service, backend, outcome, started);

        GatewayOutcome {
            rate_limit,
            result: result.map_err(GatewayError::from),
        }
    }

    fn emit(
        &self,
        caller: &CallerDescriptor,
        identity: Option<&Identity>,
        service: &str,
        backend: Option<String>,
        outcome: Outcome,
        started: Instant,
    ) {
        self.analytics.record(AnalyticsRecord {
            request_id: caller.request_id.clone(),
            timestamp: Utc::now(),
            key: identity.map(|i| i.key.clone()),
            tier: identity.map(|i| i.tier),
            method: caller.method.clone(),
            path: caller.path.clone(),
            service: service.to_string(),
            backend,
            outcome,
            latency_ms: started.elapsed().as_millis() as u64,
        });
    }
}
