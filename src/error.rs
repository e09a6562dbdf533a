use std::time::Duration;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("rate limit exceeded")]
    RateLimitExceeded { retry_after: Duration },
    #[error("circuit breaker `{name}` is open")]
    CircuitBreakerOpen { name: String },
    #[error("no healthy backend for service `{service}`")]
    NoHealthyBackend { service: String },
    #[error("invalid rate limit key or tier: {0}")]
    InvalidKeyOrTier(String),
    #[error("invalid backend: {0}")]
    InvalidBackend(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("no route matched the request")]
    RouteNotFound,
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("counter store unavailable: {0}")]
    CounterStoreUnavailable(String),
    #[error("request body exceeds configured limit")]
    PayloadTooLarge,
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded { .. } => "rate_limited",
            Self::CircuitBreakerOpen { .. } => "circuit_open",
            Self::NoHealthyBackend { .. } => "no_healthy_backend",
            Self::InvalidKeyOrTier(_) => "invalid_caller",
            Self::InvalidBackend(_) => "invalid_backend",
            Self::NotFound(_) => "not_found",
            Self::RouteNotFound => "route_not_found",
            Self::Upstream(_) => "upstream_error",
            Self::CounterStoreUnavailable(_) => "rate_limiter_unavailable",
            Self::PayloadTooLarge => "payload_too_large",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CircuitBreakerOpen { .. }
            | Self::NoHealthyBackend { .. }
            | Self::CounterStoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidKeyOrTier(_) | Self::InvalidBackend(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) | Self::RouteNotFound => StatusCode::NOT_FOUND,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whole seconds a client should wait, rounded up and never zero.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimitExceeded { retry_after } => Some(ceil_secs(*retry_after)),
            _ => None,
        }
    }
}

pub fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    let secs = if duration.subsec_nanos() > 0 { secs + 1 } else { secs };
    secs.max(1)
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (
            status,
            Json(ErrorBody {
                error: self.code(),
                message: self.to_string(),
            }),
        )
            .into_response();

        if let Some(retry_after_secs) = self.retry_after_secs()
            && let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, v);
        }

        if !response.headers().contains_key(header::CONTENT_TYPE) {
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }

        response
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        Self::CounterStoreUnavailable(err.to_string())
    }
}
