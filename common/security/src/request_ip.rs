use axum::async_trait;
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use std::net::{IpAddr, SocketAddr};
use tracing::Span;

use common_http_errors::ApiError;

/// Caller IP recorded on every FileUsage/FieldUsage audit row.
///
/// Resolution order follows a standard header-trust chain: a CDN-set
/// header takes precedence over a generic proxy header, and the transport
/// peer address is the last resort when both are absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestIp(pub IpAddr);

impl RequestIp {
    pub fn into_inner(self) -> IpAddr {
        self.0
    }
}

impl std::fmt::Display for RequestIp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn from_cf_connecting_ip(parts: &Parts) -> Option<IpAddr> {
    parts
        .headers
        .get("CF-Connecting-IP")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

fn from_forwarded_for(parts: &Parts) -> Option<IpAddr> {
    parts
        .headers
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse().ok())
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestIp
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Some(ip) = from_cf_connecting_ip(parts) {
            return Ok(RequestIp(ip));
        }
        if let Some(ip) = from_forwarded_for(parts) {
            return Ok(RequestIp(ip));
        }
        if let Ok(ConnectInfo(addr)) = ConnectInfo::<SocketAddr>::from_request_parts(parts, state).await {
            return Ok(RequestIp(addr.ip()));
        }
        Span::current().record("request_ip", "unresolved");
        Err(ApiError::internal("client ip could not be resolved", None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts_with_headers(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri("/");
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        let (parts, _) = builder.body(axum::body::Body::empty()).unwrap().into_parts();
        parts
    }

    #[test]
    fn prefers_cf_connecting_ip_over_forwarded_for() {
        let parts = parts_with_headers(&[
            ("CF-Connecting-IP", "203.0.113.9"),
            ("X-Forwarded-For", "198.51.100.1, 10.0.0.1"),
        ]);
        assert_eq!(from_cf_connecting_ip(&parts), Some("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn falls_back_to_first_forwarded_for_hop() {
        let parts = parts_with_headers(&[("X-Forwarded-For", "198.51.100.1, 10.0.0.1")]);
        assert_eq!(from_cf_connecting_ip(&parts), None);
        assert_eq!(from_forwarded_for(&parts), Some("198.51.100.1".parse().unwrap()));
    }

    #[test]
    fn malformed_header_is_ignored() {
        let parts = parts_with_headers(&[("CF-Connecting-IP", "not-an-ip")]);
        assert_eq!(from_cf_connecting_ip(&parts), None);
    }
}
