//! Rate-limit key resolution.

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Request};
use std::net::SocketAddr;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";
const UNKNOWN_CLIENT: &str = "unknown";

/// Identity of an authenticated caller.
///
/// Inserted as a request extension by whatever authentication layer runs
/// in front of the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedSubject(pub String);

/// Derives the budget key for a request.
#[derive(Debug, Clone, Copy)]
pub struct KeyResolver {
    trust_forwarded_headers: bool,
}

impl KeyResolver {
    pub fn new(trust_forwarded_headers: bool) -> Self {
        Self {
            trust_forwarded_headers,
        }
    }

    /// `user:<subject>` for authenticated callers, `ip:<addr>` otherwise.
    pub fn resolve<B>(&self, request: &Request<B>) -> String {
        match request.extensions().get::<AuthenticatedSubject>() {
            Some(AuthenticatedSubject(subject)) if !subject.is_empty() => {
                format!("user:{}", subject)
            }
            _ => format!("ip:{}", self.client_ip(request)),
        }
    }

    /// Best-effort client address.
    pub fn client_ip<B>(&self, request: &Request<B>) -> String {
        if self.trust_forwarded_headers {
            if let Some(ip) = forwarded_ip(request.headers()) {
                return ip;
            }
        }

        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
    }
}

impl Default for KeyResolver {
    fn default() -> Self {
        Self::new(true)
    }
}

fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    let first_forwarded = headers
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    if let Some(ip) = first_forwarded {
        return Some(ip.to_string());
    }

    headers
        .get(X_REAL_IP)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::HeaderValue;

    fn request() -> Request<Body> {
        Request::new(Body::empty())
    }

    fn with_socket(mut req: Request<Body>, addr: &str) -> Request<Body> {
        req.extensions_mut()
            .insert(ConnectInfo(addr.parse::<SocketAddr>().unwrap()));
        req
    }

    #[test]
    fn test_authenticated_subject_wins() {
        let mut req = request();
        req.extensions_mut()
            .insert(AuthenticatedSubject("42".to_string()));
        req.headers_mut()
            .insert(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.7"));

        assert_eq!(KeyResolver::default().resolve(&req), "user:42");
    }

    #[test]
    fn test_empty_subject_falls_back_to_ip() {
        let mut req = with_socket(request(), "10.1.2.3:5555");
        req.extensions_mut()
            .insert(AuthenticatedSubject(String::new()));

        assert_eq!(KeyResolver::default().resolve(&req), "ip:10.1.2.3");
    }

    #[test]
    fn test_first_forwarded_entry() {
        let mut req = with_socket(request(), "10.0.0.1:4000");
        req.headers_mut().insert(
            X_FORWARDED_FOR,
            HeaderValue::from_static("192.168.1.1, 10.0.0.1"),
        );
        req.headers_mut()
            .insert(X_REAL_IP, HeaderValue::from_static("172.16.0.9"));

        assert_eq!(KeyResolver::default().resolve(&req), "ip:192.168.1.1");
    }

    #[test]
    fn test_real_ip_when_no_forwarded_for() {
        let mut req = with_socket(request(), "10.0.0.1:4000");
        req.headers_mut()
            .insert(X_REAL_IP, HeaderValue::from_static("172.16.0.9"));

        assert_eq!(KeyResolver::default().resolve(&req), "ip:172.16.0.9");
    }

    #[test]
    fn test_socket_address_fallback() {
        let req = with_socket(request(), "[::1]:8080");
        assert_eq!(KeyResolver::default().resolve(&req), "ip:::1");
    }

    #[test]
    fn test_unknown_client() {
        assert_eq!(KeyResolver::default().resolve(&request()), "ip:unknown");
    }

    #[test]
    fn test_untrusted_headers_ignored() {
        let mut req = with_socket(request(), "10.0.0.1:4000");
        req.headers_mut()
            .insert(X_FORWARDED_FOR, HeaderValue::from_static("1.2.3.4"));

        assert_eq!(KeyResolver::new(false).resolve(&req), "ip:10.0.0.1");
    }
}
