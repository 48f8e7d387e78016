//! OAuth2 authorization-code gate with optional PKCE

use crate::auth::{internal_error, AuthOutcome};
use crate::error::{ProxyError, Result};
use crate::request::RequestInfo;
use crate::response::GatewayResponse;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use config::OAuth2Config;
use http::StatusCode;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

pub const CALLBACK_PREFIX: &str = "/internal/oauth2";
pub const TOKEN_COOKIE: &str = "z-token";
pub const VERIFIER_COOKIE: &str = "z-pkce-verifier";
const VERIFIER_MAX_AGE_SECS: u64 = 600;

/// Token endpoint and userinfo calls
#[async_trait]
pub trait OAuth2Client: Send + Sync {
    /// Exchange an authorization code for an access token
    async fn exchange_code(&self, code: &str, redirect_uri: &str, verifier: Option<&str>) -> Result<String>;

    /// Whether the provider still accepts `token`
    async fn validate_token(&self, token: &str) -> Result<bool>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// [`OAuth2Client`] over HTTP
pub struct HttpOAuth2Client {
    client: reqwest::Client,
    config: OAuth2Config,
}

impl HttpOAuth2Client {
    pub fn new(config: OAuth2Config, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl OAuth2Client for HttpOAuth2Client {
    async fn exchange_code(&self, code: &str, redirect_uri: &str, verifier: Option<&str>) -> Result<String> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.config.client_id.as_str()),
        ];
        if !self.config.client_secret.is_empty() {
            form.push(("client_secret", self.config.client_secret.as_str()));
        }
        if let Some(verifier) = verifier {
            form.push(("code_verifier", verifier));
        }

        let resp = self.client.post(&self.config.token_url).form(&form).send().await?;
        if !resp.status().is_success() {
            return Err(ProxyError::Auth(format!(
                "token endpoint returned {}",
                resp.status()
            )));
        }

        let token: TokenResponse = resp.json().await?;
        if token.access_token.is_empty() {
            return Err(ProxyError::Auth("empty access token".to_string()));
        }
        Ok(token.access_token)
    }

    async fn validate_token(&self, token: &str) -> Result<bool> {
        let resp = self
            .client
            .get(&self.config.userinfo_url)
            .bearer_auth(token)
            .send()
            .await?;
        Ok(resp.status() == StatusCode::OK)
    }
}

/// PKCE verifier: 32 random bytes, base64url without padding
pub fn generate_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// S256 code challenge for a verifier
pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

pub struct OAuth2Gate {
    config: OAuth2Config,
    client: Arc<dyn OAuth2Client>,
}

impl OAuth2Gate {
    pub fn new(config: OAuth2Config, client: Arc<dyn OAuth2Client>) -> Self {
        Self { config, client }
    }

    pub fn from_config(config: &OAuth2Config, timeout: Duration) -> Result<Self> {
        let client = HttpOAuth2Client::new(config.clone(), timeout)?;
        Ok(Self::new(config.clone(), Arc::new(client)))
    }

    fn redirect_uri(req: &RequestInfo) -> String {
        format!("{}://{}{CALLBACK_PREFIX}", req.scheme(), req.host)
    }

    pub async fn check(&self, req: &RequestInfo) -> AuthOutcome {
        if self.config.auth_url.is_empty()
            || self.config.token_url.is_empty()
            || self.config.userinfo_url.is_empty()
        {
            error!("Invalid OAuth2 configuration");
            return AuthOutcome::Respond(internal_error());
        }

        if req.method == http::Method::GET && req.path.starts_with(CALLBACK_PREFIX) {
            if let (Some(code), Some(state)) = (
                req.query_param("code").filter(|c| !c.is_empty()),
                req.query_param("state").filter(|s| !s.is_empty()),
            ) {
                return AuthOutcome::Respond(self.callback(req, &code, &state).await);
            }
        }

        if let Some(token) = req.cookie(TOKEN_COOKIE).filter(|t| !t.is_empty()) {
            match self.client.validate_token(&token).await {
                Ok(true) => return AuthOutcome::allowed(),
                Ok(false) => debug!("OAuth2 token rejected by userinfo endpoint"),
                Err(e) => warn!(error = %e, "Failed to get user info"),
            }
        }

        AuthOutcome::Respond(self.authorize_redirect(req))
    }

    async fn callback(&self, req: &RequestInfo, code: &str, state: &str) -> GatewayResponse {
        let verifier = if self.config.pkce {
            match req.cookie(VERIFIER_COOKIE).filter(|v| !v.is_empty()) {
                Some(v) => Some(v),
                None => {
                    warn!("OAuth2 callback without a PKCE verifier cookie");
                    return GatewayResponse::text(StatusCode::UNAUTHORIZED, "401 - Unauthorized");
                }
            }
        } else {
            None
        };

        let token = match self
            .client
            .exchange_code(code, &Self::redirect_uri(req), verifier.as_deref())
            .await
        {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Token exchange failed");
                return GatewayResponse::text(StatusCode::UNAUTHORIZED, "401 - Unauthorized");
            }
        };

        let mut cookie = format!("{TOKEN_COOKIE}={token}; Path=/");
        if req.is_tls {
            cookie.push_str("; Secure; SameSite=Lax");
        }

        let mut resp = GatewayResponse::redirect(StatusCode::TEMPORARY_REDIRECT, &safe_return_target(req, state))
            .with_header("Set-Cookie", cookie);
        if self.config.pkce {
            resp = resp.with_header("Set-Cookie", format!("{VERIFIER_COOKIE}=; Path=/; Max-Age=0; HttpOnly"));
        }
        resp
    }

    fn authorize_redirect(&self, req: &RequestInfo) -> GatewayResponse {
        let mut url = match url::Url::parse(&self.config.auth_url) {
            Ok(url) => url,
            Err(e) => {
                error!(error = %e, "Invalid OAuth2 authorize URL");
                return internal_error();
            }
        };

        let verifier = self.config.pkce.then(generate_verifier);
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.config.client_id)
                .append_pair("redirect_uri", &Self::redirect_uri(req))
                .append_pair("access_type", "offline")
                .append_pair("state", &req.original_url());
            if !self.config.scopes.is_empty() {
                query.append_pair("scope", &self.config.scopes.join(" "));
            }
            if let Some(verifier) = &verifier {
                query
                    .append_pair("code_challenge", &code_challenge(verifier))
                    .append_pair("code_challenge_method", "S256");
            }
        }

        let mut resp = GatewayResponse::redirect(StatusCode::FOUND, url.as_str());
        if let Some(verifier) = verifier {
            resp = resp.with_header(
                "Set-Cookie",
                format!("{VERIFIER_COOKIE}={verifier}; Path=/; Max-Age={VERIFIER_MAX_AGE_SECS}; HttpOnly"),
            );
        }
        resp
    }
}

/// Path on the current host. Browsers read `/\host` like `//host`.
fn is_local_path(target: &str) -> bool {
    let mut chars = target.chars();
    chars.next() == Some('/')
        && !matches!(chars.next(), Some('/') | Some('\\'))
        && !target.chars().any(|c| c.is_control())
}

/// Only return to URLs on the requesting host
fn safe_return_target(req: &RequestInfo, state: &str) -> String {
    match url::Url::parse(state) {
        Ok(url) if url.host_str().is_some_and(|h| h.eq_ignore_ascii_case(&req.hostname())) => state.to_string(),
        _ if is_local_path(state) => state.to_string(),
        _ => {
            warn!(state = %state, "Refusing OAuth2 return target on another host");
            "/".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use parking_lot::Mutex;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct FakeClient {
        valid_token: String,
        exchanged: Mutex<Vec<(String, Option<String>)>>,
    }

    #[async_trait]
    impl OAuth2Client for FakeClient {
        async fn exchange_code(&self, code: &str, _redirect_uri: &str, verifier: Option<&str>) -> Result<String> {
            self.exchanged
                .lock()
                .push((code.to_string(), verifier.map(str::to_string)));
            if code == "good" {
                Ok(self.valid_token.clone())
            } else {
                Err(ProxyError::Auth("bad code".to_string()))
            }
        }

        async fn validate_token(&self, token: &str) -> Result<bool> {
            Ok(token == self.valid_token)
        }
    }

    fn config(pkce: bool) -> OAuth2Config {
        OAuth2Config {
            client_id: "gatehouse".to_string(),
            client_secret: "secret".to_string(),
            auth_url: "https://idp.example.com/authorize".to_string(),
            token_url: "https://idp.example.com/token".to_string(),
            userinfo_url: "https://idp.example.com/userinfo".to_string(),
            scopes: vec!["openid".to_string(), "profile".to_string()],
            pkce,
        }
    }

    fn gate(pkce: bool) -> (OAuth2Gate, Arc<FakeClient>) {
        let client = Arc::new(FakeClient {
            valid_token: "tok".to_string(),
            ..Default::default()
        });
        (OAuth2Gate::new(config(pkce), client.clone()), client)
    }

    #[test]
    fn test_code_challenge() {
        // RFC 7636 appendix B
        assert_eq!(
            code_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
        let verifier = generate_verifier();
        assert_eq!(verifier.len(), 43);
        assert_ne!(verifier, generate_verifier());
    }

    #[tokio::test]
    async fn test_unauthenticated_redirects_with_pkce() {
        let (gate, _) = gate(true);
        let req = RequestInfo::new(Method::GET, "app.example.com", "/home");

        let AuthOutcome::Respond(resp) = gate.check(&req).await else {
            panic!("expected redirect");
        };
        assert_eq!(resp.status, StatusCode::FOUND);

        let location = url::Url::parse(resp.location().unwrap()).unwrap();
        let params: std::collections::HashMap<_, _> = location.query_pairs().into_owned().collect();
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["client_id"], "gatehouse");
        assert_eq!(params["redirect_uri"], "http://app.example.com/internal/oauth2");
        assert_eq!(params["state"], "http://app.example.com/home");
        assert_eq!(params["scope"], "openid profile");
        assert_eq!(params["code_challenge_method"], "S256");

        let cookie = resp.header("Set-Cookie").unwrap();
        assert!(cookie.starts_with("z-pkce-verifier="));
        assert!(cookie.contains("Max-Age=600"));
        assert!(cookie.contains("HttpOnly"));

        let verifier = cookie
            .trim_start_matches("z-pkce-verifier=")
            .split(';')
            .next()
            .unwrap();
        assert_eq!(params["code_challenge"], code_challenge(verifier));
    }

    #[tokio::test]
    async fn test_callback_sets_token_and_redirects() {
        let (gate, client) = gate(true);
        let req = RequestInfo::new(
            Method::GET,
            "app.example.com",
            "/internal/oauth2?code=good&state=https%3A%2F%2Fapp.example.com%2Fhome",
        )
        .with_tls(true)
        .with_header("Cookie", "z-pkce-verifier=abc");

        let AuthOutcome::Respond(resp) = gate.check(&req).await else {
            panic!("expected redirect");
        };
        assert_eq!(resp.status, StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(resp.location(), Some("https://app.example.com/home"));

        let cookies: Vec<_> = resp
            .headers
            .iter()
            .filter(|(k, _)| k == "Set-Cookie")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(cookies[0], "z-token=tok; Path=/; Secure; SameSite=Lax");
        assert!(cookies[1].starts_with("z-pkce-verifier=;"));
        assert_eq!(
            client.exchanged.lock()[0],
            ("good".to_string(), Some("abc".to_string()))
        );
    }

    #[tokio::test]
    async fn test_callback_failures() {
        let (gate, _) = gate(false);
        let req = RequestInfo::new(Method::GET, "app.example.com", "/internal/oauth2?code=bad&state=%2F");
        let AuthOutcome::Respond(resp) = gate.check(&req).await else {
            panic!("expected 401");
        };
        assert_eq!(resp.status, StatusCode::UNAUTHORIZED);

        let (gate, _) = self::gate(true);
        let req = RequestInfo::new(Method::GET, "app.example.com", "/internal/oauth2?code=good&state=%2F");
        let AuthOutcome::Respond(resp) = gate.check(&req).await else {
            panic!("expected 401");
        };
        assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_callback_rejects_foreign_state() {
        let (gate, _) = gate(false);
        let req = RequestInfo::new(
            Method::GET,
            "app.example.com",
            "/internal/oauth2?code=good&state=https%3A%2F%2Fevil.example.net%2F",
        );
        let AuthOutcome::Respond(resp) = gate.check(&req).await else {
            panic!("expected redirect");
        };
        assert_eq!(resp.location(), Some("/"));
    }

    #[test]
    fn test_return_target_rejects_network_paths() {
        let req = RequestInfo::new(Method::GET, "app.example.com", "/internal/oauth2");
        assert_eq!(safe_return_target(&req, "/dashboard?tab=1"), "/dashboard?tab=1");
        assert_eq!(safe_return_target(&req, "/"), "/");
        assert_eq!(
            safe_return_target(&req, "https://app.example.com/home"),
            "https://app.example.com/home"
        );
        assert_eq!(safe_return_target(&req, "//evil.example"), "/");
        assert_eq!(safe_return_target(&req, "/\\evil.example"), "/");
        assert_eq!(safe_return_target(&req, "/\tevil.example"), "/");
        assert_eq!(safe_return_target(&req, "https://evil.example/"), "/");
    }

    #[tokio::test]
    async fn test_valid_token_allows() {
        let (gate, _) = gate(false);
        let req = RequestInfo::new(Method::GET, "app.example.com", "/")
            .with_header("Cookie", "z-token=tok");
        assert!(gate.check(&req).await.is_allowed());

        let req = RequestInfo::new(Method::GET, "app.example.com", "/")
            .with_header("Cookie", "z-token=expired");
        assert!(!gate.check(&req).await.is_allowed());
    }

    #[tokio::test]
    async fn test_incomplete_config() {
        let mut config = config(false);
        config.userinfo_url.clear();
        let gate = OAuth2Gate::new(config, Arc::new(FakeClient::default()));
        let req = RequestInfo::new(Method::GET, "app.example.com", "/");
        let AuthOutcome::Respond(resp) = gate.check(&req).await else {
            panic!("expected 500");
        };
        assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_http_client() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code_verifier=v1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "abc",
                "token_type": "Bearer"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .and(header("Authorization", "Bearer abc"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut config = config(true);
        config.token_url = format!("{}/token", server.uri());
        config.userinfo_url = format!("{}/userinfo", server.uri());
        let client = HttpOAuth2Client::new(config, Duration::from_secs(2)).unwrap();

        let token = client
            .exchange_code("c1", "http://app/internal/oauth2", Some("v1"))
            .await
            .unwrap();
        assert_eq!(token, "abc");
        assert!(client.validate_token("abc").await.unwrap());
        assert!(!client.validate_token("other").await.unwrap());
    }
}
