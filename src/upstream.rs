use axum::{body::Body, response::Response};
use http::header::HeaderName;
use std::time::Duration;

use crate::{
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    router::Backend,
};

/// Forwards a buffered request to the backend chosen by the router.
#[derive(Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpForwarder {
    pub fn new(timeout: Duration) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        Ok(Self { client, timeout })
    }

    /// A 5xx answer counts as a backend failure so it reaches the breaker; anything else,
    /// 4xx included, is relayed as the backend's response.
    pub async fn forward(
        &self,
        ctx: &RequestContext,
        backend: &Backend,
    ) -> GatewayResult<Response<Body>> {
        let path_and_query = ctx
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or(ctx.uri.path());
        let target_url = format!("{}{}", backend.url.trim_end_matches('/'), path_and_query);

        let mut request = self
            .client
            .request(ctx.method.clone(), &target_url)
            .body(ctx.body.clone());

        for (name, value) in &ctx.headers {
            if should_forward_header(name) {
                request = request.header(name, value);
            }
        }

        request = request.header("x-request-id", ctx.request_id.clone());
        if let Some(client_ip) = ctx.client_ip {
            request = request.header("x-forwarded-for", client_ip.to_string());
        }

        let upstream_response = request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;

        let status = upstream_response.status();
        if status.is_server_error() {
            return Err(GatewayError::Upstream(format!(
                "backend {} answered {status}",
                backend.name
            )));
        }

        let headers = upstream_response.headers().clone();
        let body = upstream_response.bytes().await?;

        let mut builder = Response::builder().status(status);
        for (name, value) in &headers {
            if should_forward_header(name) {
                builder = builder.header(name, value);
            }
        }

        builder
            .body(Body::from(body))
            .map_err(|e| GatewayError::Internal(e.to_string()))
    }
}

fn should_forward_header(name: &HeaderName) -> bool {
    !matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}
