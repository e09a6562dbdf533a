//! Operator endpoints for inspecting and resetting limiter, breaker and backend state.

use std::{collections::BTreeMap, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::json;

use crate::{
    circuit_breaker::{BreakerSnapshot, CircuitState},
    error::{GatewayError, GatewayResult},
    gateway::Gateway,
    ratelimit::{Tier, TierLimits, UsageSnapshot},
    router::{BackendSpec, BackendStatsSnapshot},
};

pub fn routes(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/admin/tiers", get(list_tiers))
        .route("/admin/rate-limits", get(list_rate_limits))
        .route(
            "/admin/rate-limits/{key}",
            get(get_rate_limit).delete(reset_rate_limit),
        )
        .route("/admin/breakers", get(list_breakers))
        .route("/admin/breaker-states", get(breaker_states))
        .route("/admin/breakers/{name}", get(get_breaker))
        .route("/admin/breakers/{name}/reset", post(reset_breaker))
        .route("/admin/backends", get(list_backends))
        .route("/admin/backends/{name}", delete(remove_backend))
        .route("/admin/services/{service}/backends", post(add_backend))
        .route("/admin/health-checks", post(run_health_checks))
        .with_state(gateway)
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        gateway.metrics().render_prometheus(),
    )
}

async fn list_tiers(State(gateway): State<Arc<Gateway>>) -> Json<BTreeMap<Tier, TierLimits>> {
    let tiers = gateway.limiter().tiers();
    Json(Tier::ALL.into_iter().map(|tier| (tier, *tiers.limits(tier))).collect())
}

async fn list_rate_limits(State(gateway): State<Arc<Gateway>>) -> GatewayResult<Json<Vec<String>>> {
    Ok(Json(gateway.limiter().tracked_keys().await?))
}

#[derive(Debug, Deserialize)]
struct UsageQuery {
    tier: Option<String>,
}

/// Usage for one tier when `?tier=` is given, otherwise for every tier.
async fn get_rate_limit(
    State(gateway): State<Arc<Gateway>>,
    Path(key): Path<String>,
    Query(query): Query<UsageQuery>,
) -> GatewayResult<Json<BTreeMap<Tier, UsageSnapshot>>> {
    let tiers = match query.tier.as_deref() {
        Some(raw) => vec![raw.parse::<Tier>()?],
        None => Tier::ALL.to_vec(),
    };

    let mut usage = BTreeMap::new();
    for tier in tiers {
        usage.insert(tier, gateway.limiter().get_usage(&key, tier).await?);
    }
    Ok(Json(usage))
}

async fn reset_rate_limit(
    State(gateway): State<Arc<Gateway>>,
    Path(key): Path<String>,
) -> GatewayResult<StatusCode> {
    gateway.limiter().reset(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_breakers(State(gateway): State<Arc<Gateway>>) -> Json<Vec<BreakerSnapshot>> {
    Json(gateway.breakers().snapshots().await)
}

async fn breaker_states(
    State(gateway): State<Arc<Gateway>>,
) -> Json<BTreeMap<String, CircuitState>> {
    Json(gateway.breakers().get_all_states().await)
}

async fn get_breaker(
    State(gateway): State<Arc<Gateway>>,
    Path(name): Path<String>,
) -> Json<BreakerSnapshot> {
    Json(gateway.breakers().get_state(&name).await)
}

async fn reset_breaker(
    State(gateway): State<Arc<Gateway>>,
    Path(name): Path<String>,
) -> Json<BreakerSnapshot> {
    gateway.breakers().reset(&name).await;
    Json(gateway.breakers().get_state(&name).await)
}

async fn list_backends(
    State(gateway): State<Arc<Gateway>>,
) -> Json<BTreeMap<String, BackendStatsSnapshot>> {
    Json(gateway.router().get_backend_stats())
}

async fn add_backend(
    State(gateway): State<Arc<Gateway>>,
    Path(service): Path<String>,
    Json(spec): Json<BackendSpec>,
) -> GatewayResult<(StatusCode, Json<BackendStatsSnapshot>)> {
    let backend = gateway.router().add_backend(&service, spec)?;
    Ok((StatusCode::CREATED, Json(backend.snapshot())))
}

async fn remove_backend(
    State(gateway): State<Arc<Gateway>>,
    Path(name): Path<String>,
) -> GatewayResult<StatusCode> {
    if gateway.router().remove_backend(&name) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(GatewayError::NotFound(format!("backend `{name}`")))
    }
}

async fn run_health_checks(State(gateway): State<Arc<Gateway>>) -> Json<BTreeMap<String, bool>> {
    Json(gateway.router().health_check_all().await)
}
