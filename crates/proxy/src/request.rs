//! Transport-independent view of an inbound request

use crate::ip_filter::requester_ip;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use std::net::IpAddr;

/// Everything the dispatcher needs to know about one inbound request
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    /// Raw Host header, possibly with a port
    pub host: String,
    /// Request target as received (path and query)
    pub uri: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    /// Socket peer address
    pub remote_addr: Option<IpAddr>,
    pub is_tls: bool,
    /// Buffered body; only read for the CAPTCHA verification path
    pub body: Option<Bytes>,
}

impl RequestInfo {
    pub fn new(method: Method, host: &str, uri: &str) -> Self {
        let (path, query) = match uri.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (uri.to_string(), None),
        };
        let path = if path.is_empty() { "/".to_string() } else { path };

        Self {
            method,
            host: host.to_string(),
            uri: uri.to_string(),
            path,
            query,
            headers: HeaderMap::new(),
            remote_addr: None,
            is_tls: false,
            body: None,
        }
    }

    /// Append a header; invalid names or values are ignored
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn with_remote_addr(mut self, ip: IpAddr) -> Self {
        self.remote_addr = Some(ip);
        self
    }

    pub fn with_tls(mut self, is_tls: bool) -> Self {
        self.is_tls = is_tls;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Host without port, lowercased
    pub fn hostname(&self) -> String {
        strip_port(&self.host).to_lowercase()
    }

    pub fn scheme(&self) -> &'static str {
        if self.is_tls {
            "https"
        } else {
            "http"
        }
    }

    /// Absolute URL of the request as the client sees it
    pub fn original_url(&self) -> String {
        format!("{}://{}{}", self.scheme(), self.host, self.uri)
    }

    /// Requester IP honoring proxy headers
    pub fn client_ip(&self) -> Option<IpAddr> {
        requester_ip(&self.headers, self.remote_addr)
    }

    /// Socket peer address; proxy headers are only used when it is unknown
    pub fn peer_ip(&self) -> Option<IpAddr> {
        self.remote_addr.or_else(|| self.client_ip())
    }

    pub fn cookies(&self) -> Vec<(String, String)> {
        self.headers
            .get_all(http::header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect()
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        self.cookies()
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// `Upgrade: websocket`, compared case-insensitively
    pub fn is_websocket(&self) -> bool {
        self.header("upgrade")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"))
    }

    /// Value of a query parameter, percent-decoded
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }
}

/// Strip a trailing `:port`, keeping bracketed IPv6 literals intact
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &host[..end + 2],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:8080"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:443"), "[::1]");
        assert_eq!(strip_port("::1"), "::1");
    }

    #[test]
    fn test_hostname_lowercased() {
        let req = RequestInfo::new(Method::GET, "App.Example.COM:8443", "/");
        assert_eq!(req.hostname(), "app.example.com");
    }

    #[test]
    fn test_uri_split() {
        let req = RequestInfo::new(Method::GET, "example.com", "/search?q=rust&page=2");
        assert_eq!(req.path, "/search");
        assert_eq!(req.query.as_deref(), Some("q=rust&page=2"));
        assert_eq!(req.query_param("q").as_deref(), Some("rust"));
        assert_eq!(req.original_url(), "http://example.com/search?q=rust&page=2");
    }

    #[test]
    fn test_cookies() {
        let req = RequestInfo::new(Method::GET, "example.com", "/")
            .with_header("Cookie", "a=1; session=abc")
            .with_header("Cookie", "b=2");
        assert_eq!(req.cookie("session").as_deref(), Some("abc"));
        assert_eq!(req.cookie("b").as_deref(), Some("2"));
        assert_eq!(req.cookies().len(), 3);
    }

    #[test]
    fn test_peer_ip_ignores_proxy_headers() {
        let peer: IpAddr = "203.0.113.7".parse().unwrap();
        let req = RequestInfo::new(Method::GET, "a.example.com", "/")
            .with_header("X-Real-IP", "10.9.9.1")
            .with_remote_addr(peer);
        assert_eq!(req.peer_ip(), Some(peer));
        assert_eq!(req.client_ip(), Some("10.9.9.1".parse().unwrap()));

        let req = RequestInfo::new(Method::GET, "a.example.com", "/").with_header("X-Real-IP", "10.9.9.1");
        assert_eq!(req.peer_ip(), Some("10.9.9.1".parse().unwrap()));
    }

    #[test]
    fn test_websocket_detection() {
        let req = RequestInfo::new(Method::GET, "example.com", "/ws")
            .with_header("Upgrade", "WebSocket");
        assert!(req.is_websocket());

        let req = RequestInfo::new(Method::GET, "example.com", "/")
            .with_header("Upgrade", "h2c");
        assert!(!req.is_websocket());
    }
}
