use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use axum::{
    body::{Body, to_bytes},
    extract::{ConnectInfo, State},
    http::{HeaderName, HeaderValue, Request, Response},
    response::IntoResponse,
};
use uuid::Uuid;

use crate::{
    config::RouteConfig,
    context::RequestContext,
    error::GatewayError,
    gateway::Gateway,
    upstream::HttpForwarder,
};

/// HTTP face of the gateway: buffers the request, resolves its service from the path
/// and hands it to [`Gateway::handle`] with the forwarder as the downstream call.
pub struct ProxyState {
    gateway: Arc<Gateway>,
    forwarder: HttpForwarder,
    routes: Vec<RouteConfig>,
    max_body_bytes: usize,
}

pub async fn proxy_handler(
    State(state): State<Arc<ProxyState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response<Body> {
    state.handle_http(request, Some(addr.ip())).await
}

impl ProxyState {
    pub fn new(
        gateway: Arc<Gateway>,
        forwarder: HttpForwarder,
        routes: Vec<RouteConfig>,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            gateway,
            forwarder,
            routes,
            max_body_bytes,
        }
    }

    pub async fn handle_http(
        &self,
        request: Request<Body>,
        client_ip: Option<IpAddr>,
    ) -> Response<Body> {
        let (parts, body) = request.into_parts();
        let body = match to_bytes(body, self.max_body_bytes).await {
            Ok(body) => body,
            Err(_) => {
                let mut response = GatewayError::PayloadTooLarge.into_response();
                attach_hardening_headers("unknown", &mut response);
                return response;
            }
        };

        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let ctx = RequestContext::new(
            request_id,
            parts.method,
            parts.uri,
            parts.headers,
            body,
            client_ip,
        );

        tracing::info!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            path = %ctx.uri.path(),
            client_ip = ?ctx.client_ip,
            "incoming request"
        );

        let Some(route) = self.resolve_route(ctx.uri.path()) else {
            return self.finish(&ctx, GatewayError::RouteNotFound.into_response(), None);
        };

        let caller = match ctx.caller() {
            Ok(caller) => caller,
            Err(err) => return self.finish(&ctx, err.into_response(), None),
        };

        let forwarder = &self.forwarder;
        let request = &ctx;
        let outcome = self
            .gateway
            .handle(&caller, &route.service, move |backend| async move {
                forwarder.forward(request, &backend).await
            })
            .await;

        let (mut response, backend) = match outcome.result {
            Ok(routed) => (routed.value, Some(routed.backend)),
            Err(err) => (err.into_response(), None),
        };
        if let Some(rate_limit) = &outcome.rate_limit {
            rate_limit.apply(response.headers_mut());
        }

        self.finish(&ctx, response, backend)
    }

    fn finish(
        &self,
        ctx: &RequestContext,
        mut response: Response<Body>,
        backend: Option<String>,
    ) -> Response<Body> {
        tracing::info!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            path = %ctx.uri.path(),
            status = %response.status(),
            backend = ?backend,
            latency_ms = ctx.started_at.elapsed().as_millis() as u64,
            "request completed"
        );
        attach_hardening_headers(&ctx.request_id, &mut response);
        response
    }

    fn resolve_route(&self, path: &str) -> Option<&RouteConfig> {
        self.routes
            .iter()
            .filter(|route| path.starts_with(route.path_prefix.as_str()))
            .max_by_key(|route| route.path_prefix.len())
    }
}

fn attach_hardening_headers(request_id: &str, response: &mut Response<Body>) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-request-id"), value);
    }

    response.headers_mut().insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    response.headers_mut().insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    response.headers_mut().insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    );
}
