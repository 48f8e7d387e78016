//! Error types for gatehouse-proxy

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid domain: {0:?}")]
    InvalidDomain(String),

    #[error("Endpoint key {0:?} is already registered in another table")]
    KeyConflict(String),

    #[error("Routing rule {0:?} already exists")]
    DuplicateRoutingRule(String),

    #[error("Routing rule {0:?} not found")]
    RoutingRuleNotFound(String),

    #[error("Endpoint {0:?} not found")]
    EndpointNotFound(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("DNS resolution failed for {0}")]
    Dns(String),

    #[error("Auth provider error: {0}")]
    Auth(String),

    #[error("CAPTCHA verification error: {0}")]
    Captcha(String),

    #[error("TLS error: {0}")]
    Tls(#[from] tls::TlsError),

    #[error("Invalid pattern: {0}")]
    Regex(#[from] regex::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
