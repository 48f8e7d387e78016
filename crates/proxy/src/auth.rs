//! Authentication gate
//!
//! Each endpoint is governed by exactly one [`AuthMethod`]. Basic auth is
//! checked locally; the remaining methods delegate to an external provider
//! (see [`crate::forward_auth`] and [`crate::oauth2`]).

use crate::error::Result;
use crate::forward_auth::ForwardAuthProviders;
use crate::forwarder::ForwardType;
use crate::headers::HeaderOps;
use crate::oauth2::OAuth2Gate;
use crate::request::RequestInfo;
use crate::response::GatewayResponse;
use base64::Engine;
use config::{AuthConfig, ProvidersConfig};
use http::StatusCode;
use sha2::{Digest, Sha512};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Header carrying the authenticated basic-auth user upstream
pub const REMOTE_USER_HEADER: &str = "X-Remote-User";

/// Authentication method of an endpoint
#[derive(Debug, Clone, Default)]
pub enum AuthMethod {
    #[default]
    None,
    Basic(BasicAuthSettings),
    Authelia,
    Authentik,
    OAuth2,
    Forward,
}

impl AuthMethod {
    /// Statistics label used when this method rejects a request
    pub fn forward_type(&self) -> ForwardType {
        match self {
            AuthMethod::Basic(_) => ForwardType::BasicAuth,
            AuthMethod::OAuth2 => ForwardType::OAuth2,
            _ => ForwardType::ForwardAuth,
        }
    }
}

/// Result of running an auth method against a request
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    /// Continue to the upstream with these header edits
    Allowed {
        upstream: HeaderOps,
        downstream: Vec<(String, String)>,
    },
    /// Stop and answer the client directly
    Respond(GatewayResponse),
}

impl AuthOutcome {
    pub fn allowed() -> Self {
        AuthOutcome::Allowed {
            upstream: HeaderOps::default(),
            downstream: Vec::new(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthOutcome::Allowed { .. })
    }
}

/// Hex-encoded SHA-512 of a password, the stored credential format
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha512::digest(password.as_bytes()))
}

#[derive(Debug, Clone, Default)]
pub struct BasicAuthSettings {
    /// (username, hex SHA-512 password hash)
    pub credentials: Vec<(String, String)>,
    /// Path prefixes that skip the check
    pub exceptions: Vec<String>,
}

impl BasicAuthSettings {
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            credentials: config
                .credentials
                .iter()
                .map(|c| (c.username.clone(), c.password_hash.to_lowercase()))
                .collect(),
            exceptions: config
                .exceptions
                .iter()
                .filter(|p| !p.is_empty())
                .cloned()
                .collect(),
        }
    }

    pub fn is_path_excepted(&self, path: &str) -> bool {
        self.exceptions.iter().any(|prefix| path.starts_with(prefix))
    }

    pub fn check(&self, req: &RequestInfo) -> AuthOutcome {
        if self.is_path_excepted(&req.path) {
            debug!(path = %req.path, "Path excepted from basic auth");
            return AuthOutcome::allowed();
        }

        let Some((username, password)) = req.header("authorization").and_then(decode_basic) else {
            return AuthOutcome::Respond(unauthorized());
        };

        let hash = hash_password(&password);
        let matched = self
            .credentials
            .iter()
            .any(|(user, expected)| *user == username && constant_time_compare(&hash, expected));

        if !matched {
            warn!(username = %username, "Basic auth failed");
            return AuthOutcome::Respond(unauthorized());
        }

        debug!(username = %username, "Basic auth successful");
        let mut upstream = HeaderOps::default();
        upstream.set(REMOTE_USER_HEADER, username);
        AuthOutcome::Allowed {
            upstream,
            downstream: Vec::new(),
        }
    }
}

/// `Basic <base64(user:pass)>` into its parts
fn decode_basic(header: &str) -> Option<(String, String)> {
    let header = header.trim();
    let scheme = header.get(..6)?;
    if !scheme.eq_ignore_ascii_case("basic ") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(header[6..].trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

fn unauthorized() -> GatewayResponse {
    GatewayResponse::text(StatusCode::UNAUTHORIZED, "401 - Unauthorized")
        .with_header("WWW-Authenticate", "Basic realm=\"Restricted\"")
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub(crate) fn internal_error() -> GatewayResponse {
    GatewayResponse::text(StatusCode::INTERNAL_SERVER_ERROR, "500 - Internal Server Error")
}

/// Runs the auth method selected by an endpoint
pub struct AuthGate {
    providers: ForwardAuthProviders,
    oauth2: Option<OAuth2Gate>,
}

impl AuthGate {
    pub fn new(providers: ForwardAuthProviders, oauth2: Option<OAuth2Gate>) -> Self {
        Self { providers, oauth2 }
    }

    pub fn from_config(config: &ProvidersConfig, timeout: Duration) -> Result<Self> {
        let oauth2 = config
            .oauth2
            .as_ref()
            .map(|c| OAuth2Gate::from_config(c, timeout))
            .transpose()?;
        Ok(Self::new(ForwardAuthProviders::new(config, timeout)?, oauth2))
    }

    pub async fn check(&self, method: &AuthMethod, req: &RequestInfo) -> AuthOutcome {
        match method {
            AuthMethod::None => AuthOutcome::allowed(),
            AuthMethod::Basic(settings) => settings.check(req),
            AuthMethod::Authelia => self.providers.authelia(req).await,
            AuthMethod::Authentik => self.providers.authentik(req).await,
            AuthMethod::Forward => self.providers.forward(req).await,
            AuthMethod::OAuth2 => match &self.oauth2 {
                Some(gate) => gate.check(req).await,
                None => {
                    error!("OAuth2 auth requested but no OAuth2 provider is configured");
                    AuthOutcome::Respond(internal_error())
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::BasicCredential;
    use http::Method;

    fn settings() -> BasicAuthSettings {
        BasicAuthSettings::from_config(&AuthConfig {
            method: config::AuthMethodKind::Basic,
            credentials: vec![BasicCredential {
                username: "admin".to_string(),
                password_hash: hash_password("hunter2"),
            }],
            exceptions: vec!["/public/".to_string()],
        })
    }

    fn basic(user: &str, pass: &str) -> String {
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"))
        )
    }

    #[test]
    fn test_hash_password() {
        assert_eq!(hash_password("hunter2").len(), 128);
        assert_ne!(hash_password("a"), hash_password("b"));
    }

    #[test]
    fn test_missing_credentials() {
        let req = RequestInfo::new(Method::GET, "a.example.com", "/");
        match settings().check(&req) {
            AuthOutcome::Respond(resp) => {
                assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
                assert_eq!(resp.header("WWW-Authenticate"), Some("Basic realm=\"Restricted\""));
                assert_eq!(&resp.body[..], b"401 - Unauthorized");
            }
            other => panic!("expected 401, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_credentials() {
        let req = RequestInfo::new(Method::GET, "a.example.com", "/")
            .with_header("Authorization", &basic("admin", "hunter2"));
        match settings().check(&req) {
            AuthOutcome::Allowed { upstream, .. } => {
                assert!(upstream
                    .set
                    .contains(&(REMOTE_USER_HEADER.to_string(), "admin".to_string())));
            }
            other => panic!("expected allowed, got {other:?}"),
        }
    }

    #[test]
    fn test_wrong_password_and_user() {
        let req = RequestInfo::new(Method::GET, "a.example.com", "/")
            .with_header("Authorization", &basic("admin", "wrong"));
        assert!(!settings().check(&req).is_allowed());

        let req = RequestInfo::new(Method::GET, "a.example.com", "/")
            .with_header("Authorization", &basic("root", "hunter2"));
        assert!(!settings().check(&req).is_allowed());

        let req = RequestInfo::new(Method::GET, "a.example.com", "/")
            .with_header("Authorization", "Bearer abc");
        assert!(!settings().check(&req).is_allowed());
    }

    #[test]
    fn test_exception_path() {
        let req = RequestInfo::new(Method::GET, "a.example.com", "/public/logo.png");
        assert!(settings().check(&req).is_allowed());
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("abc", "abc"));
        assert!(!constant_time_compare("abc", "abd"));
        assert!(!constant_time_compare("abc", "ab"));
    }

    #[tokio::test]
    async fn test_gate_oauth2_unconfigured() {
        let gate = AuthGate::from_config(&ProvidersConfig::default(), Duration::from_secs(1)).unwrap();
        let req = RequestInfo::new(Method::GET, "a.example.com", "/");

        assert!(gate.check(&AuthMethod::None, &req).await.is_allowed());
        match gate.check(&AuthMethod::OAuth2, &req).await {
            AuthOutcome::Respond(resp) => assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR),
            other => panic!("expected 500, got {other:?}"),
        }
    }
}
