//! Responses produced by the gateway itself

use bytes::Bytes;
use http::StatusCode;

/// A response written directly to the client without contacting an origin
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl GatewayResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(body.into())
    }

    pub fn html(status: StatusCode, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header("Content-Type", "text/html; charset=utf-8")
            .with_body(body.into())
    }

    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        Self::new(status)
            .with_header("Content-Type", "application/json")
            .with_body(value.to_string())
    }

    pub fn redirect(status: StatusCode, location: &str) -> Self {
        Self::new(status).with_header("Location", location)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First header with `name`, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn location(&self) -> Option<&str> {
        self.header("Location")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect() {
        let resp = GatewayResponse::redirect(StatusCode::TEMPORARY_REDIRECT, "/blog/");
        assert_eq!(resp.status, StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(resp.location(), Some("/blog/"));
        assert!(resp.body.is_empty());
    }

    #[test]
    fn test_json() {
        let resp = GatewayResponse::json(StatusCode::OK, &serde_json::json!({"success": true}));
        assert_eq!(resp.header("content-type"), Some("application/json"));
        assert_eq!(&resp.body[..], br#"{"success":true}"#);
    }
}
