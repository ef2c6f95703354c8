//! Caller identification strategies.

use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use http::header::{HeaderMap, HeaderName};
use http::Request;

use crate::error::{RateLimitError, Result};

/// Identifier used when nothing about the caller is known.
pub const UNKNOWN_IDENTIFIER: &str = "unknown";

/// Forwarded-address headers consulted by default, in priority order.
pub const DEFAULT_CLIENT_IP_HEADERS: &[&str] = &["x-forwarded-for", "x-real-ip", "x-client-ip"];

/// The parts of an inbound request that identification looks at.
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo<'a> {
    pub headers: &'a HeaderMap,
    pub peer_addr: Option<SocketAddr>,
}

impl<'a> RequestInfo<'a> {
    pub fn new(headers: &'a HeaderMap, peer_addr: Option<SocketAddr>) -> Self {
        Self { headers, peer_addr }
    }

    /// Borrow from an `http::Request`. The peer address is taken from axum's
    /// `ConnectInfo` extension, or a bare `SocketAddr` extension.
    pub fn from_request<B>(request: &'a Request<B>) -> Self {
        let extensions = request.extensions();
        let peer_addr = extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr)
            .or_else(|| extensions.get::<SocketAddr>().copied());

        Self::new(request.headers(), peer_addr)
    }
}

/// Derives the identifier a request is counted against.
///
/// Closures `Fn(&RequestInfo) -> String` implement this, so deployments can
/// limit by API key or authenticated principal instead of address.
pub trait Identify: Send + Sync {
    fn identify(&self, request: &RequestInfo<'_>) -> String;
}

impl<F> Identify for F
where
    F: Fn(&RequestInfo<'_>) -> String + Send + Sync,
{
    fn identify(&self, request: &RequestInfo<'_>) -> String {
        self(request)
    }
}

/// Identify callers by client address.
///
/// Checks the configured forwarded-address headers in order, then the
/// transport peer address, then falls back to `"unknown"`.
#[derive(Debug, Clone)]
pub struct ClientIp {
    headers: Vec<HeaderName>,
}

impl Default for ClientIp {
    fn default() -> Self {
        Self {
            headers: DEFAULT_CLIENT_IP_HEADERS
                .iter()
                .copied()
                .map(HeaderName::from_static)
                .collect(),
        }
    }
}

impl ClientIp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consult `headers` (in order) instead of the defaults.
    pub fn with_headers<I, S>(headers: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let headers = headers
            .into_iter()
            .map(|h| {
                HeaderName::from_bytes(h.as_ref().to_ascii_lowercase().as_bytes()).map_err(|e| {
                    RateLimitError::Config(format!("invalid header name '{}': {}", h.as_ref(), e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { headers })
    }

    fn forwarded_address(&self, headers: &HeaderMap) -> Option<String> {
        self.headers.iter().find_map(|name| {
            let value = headers.get(name)?.to_str().ok()?;
            // A forwarded-for chain lists the original client first.
            let first = value.split(',').next()?.trim();
            (!first.is_empty()).then(|| first.to_string())
        })
    }
}

impl Identify for ClientIp {
    fn identify(&self, request: &RequestInfo<'_>) -> String {
        self.forwarded_address(request.headers)
            .or_else(|| request.peer_addr.map(|addr| addr.ip().to_string()))
            .unwrap_or_else(|| UNKNOWN_IDENTIFIER.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    fn peer() -> Option<SocketAddr> {
        Some("10.1.2.3:55000".parse().unwrap())
    }

    #[test]
    fn test_forwarded_for_takes_first_hop() {
        let map = headers(&[
            ("x-forwarded-for", " 203.0.113.7 , 10.0.0.1, 10.0.0.2"),
            ("x-real-ip", "198.51.100.1"),
        ]);
        let info = RequestInfo::new(&map, peer());

        assert_eq!(ClientIp::new().identify(&info), "203.0.113.7");
    }

    #[test]
    fn test_header_priority_order() {
        let map = headers(&[("x-client-ip", "192.0.2.9"), ("x-real-ip", "198.51.100.1")]);
        let info = RequestInfo::new(&map, peer());

        assert_eq!(ClientIp::new().identify(&info), "198.51.100.1");
    }

    #[test]
    fn test_empty_header_is_skipped() {
        let map = headers(&[("x-forwarded-for", ""), ("x-client-ip", "192.0.2.9")]);
        let info = RequestInfo::new(&map, peer());

        assert_eq!(ClientIp::new().identify(&info), "192.0.2.9");
    }

    #[test]
    fn test_falls_back_to_peer_then_unknown() {
        let map = HeaderMap::new();

        assert_eq!(ClientIp::new().identify(&RequestInfo::new(&map, peer())), "10.1.2.3");
        assert_eq!(
            ClientIp::new().identify(&RequestInfo::new(&map, None)),
            UNKNOWN_IDENTIFIER
        );
    }

    #[test]
    fn test_custom_header_list() {
        let map = headers(&[("x-forwarded-for", "203.0.113.7"), ("cf-connecting-ip", "192.0.2.1")]);
        let strategy = ClientIp::with_headers(["CF-Connecting-IP"]).unwrap();

        assert_eq!(strategy.identify(&RequestInfo::new(&map, None)), "192.0.2.1");
        assert!(ClientIp::with_headers(["bad header"]).is_err());
    }

    fn by_api_key(req: &RequestInfo<'_>) -> String {
        req.headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or(UNKNOWN_IDENTIFIER)
            .to_string()
    }

    #[test]
    fn test_function_strategy() {
        let map = headers(&[("x-api-key", "key-123")]);
        let strategy: &dyn Identify = &by_api_key;

        assert_eq!(strategy.identify(&RequestInfo::new(&map, None)), "key-123");
        assert_eq!(strategy.identify(&RequestInfo::new(&HeaderMap::new(), None)), "unknown");
    }

    #[test]
    fn test_from_request_reads_connect_info() {
        let mut request = Request::builder().body(()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("172.16.0.4:4000".parse().unwrap()));

        let info = RequestInfo::from_request(&request);
        assert_eq!(info.peer_addr.unwrap().ip().to_string(), "172.16.0.4");
    }
}
