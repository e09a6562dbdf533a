use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use std::{net::IpAddr, time::Instant};

use crate::{
    error::GatewayResult,
    gateway::CallerDescriptor,
    ratelimit::Tier,
};

/// Set by the authentication layer in front of the gateway.
pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_TIER_HEADER: &str = "x-user-tier";

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<IpAddr>,
    pub started_at: Instant,
}

impl RequestContext {
    pub fn new(
        request_id: String,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        client_ip: Option<IpAddr>,
    ) -> Self {
        Self {
            request_id,
            method,
            uri,
            headers,
            body,
            client_ip,
            started_at: Instant::now(),
        }
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// An unrecognised tier header is a caller error, not a silent downgrade.
    pub fn caller(&self) -> GatewayResult<CallerDescriptor> {
        let tier = self
            .header(USER_TIER_HEADER)
            .map(str::parse::<Tier>)
            .transpose()?;

        let mut caller =
            CallerDescriptor::new(self.request_id.as_str(), self.method.as_str(), self.uri.path());
        if let Some(ip) = self.client_ip {
            caller = caller.with_client_ip(ip);
        }
        if let Some(user_id) = self.header(USER_ID_HEADER) {
            caller = caller.with_user(user_id, tier);
        }
        Ok(caller)
    }
}
