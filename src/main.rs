mod admin;
mod analytics;
mod circuit_breaker;
mod clock;
mod config;
mod context;
mod error;
mod gateway;
mod metrics;
mod proxy;
mod ratelimit;
mod router;
mod upstream;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{Router, routing::any};
use tokio::{net::TcpListener, sync::broadcast};
use tracing_subscriber::EnvFilter;

use crate::{
    config::{GatewayConfig, LogFormat},
    gateway::Gateway,
    proxy::{ProxyState, proxy_handler},
    ratelimit::spawn_eviction_task,
    router::health::spawn_health_monitor,
    upstream::HttpForwarder,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = GatewayConfig::from_env().context("failed to build gateway config")?;
    init_tracing(cfg.log_format);

    let bind_addr = cfg.bind_addr;
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let gateway = Arc::new(
        Gateway::from_config(&cfg)
            .await
            .context("failed to initialise gateway")?,
    );

    let health_monitor = spawn_health_monitor(gateway.router().clone(), shutdown_tx.subscribe());
    let janitor = spawn_eviction_task(
        gateway.limiter().clone(),
        cfg.rate_limit.eviction_interval,
        shutdown_tx.subscribe(),
    );

    let forwarder = HttpForwarder::new(cfg.upstream_timeout)?;
    let proxy = Arc::new(ProxyState::new(
        gateway.clone(),
        forwarder,
        cfg.routing.routes.clone(),
        cfg.max_body_bytes,
    ));

    let app = admin::routes(gateway.clone())
        .merge(Router::new().fallback(any(proxy_handler)).with_state(proxy));

    let listener = TcpListener::bind(bind_addr)
        .await
        .context("failed to bind listener")?;

    tracing::info!(
        addr = %bind_addr,
        services = ?gateway.router().services(),
        "API gateway listening"
    );

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(shutdown_tx.clone()))
        .await
        .context("gateway server error")?;

    let _ = shutdown_tx.send(());
    let _ = tokio::join!(health_monitor, janitor);
    tracing::info!("gateway stopped");

    Ok(())
}

async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(());
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Compact => builder.compact().init(),
    }
}
