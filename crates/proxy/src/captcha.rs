//! CAPTCHA gate
//!
//! Endpoints with CAPTCHA enabled serve a challenge page until the client
//! posts a provider token to [`VERIFY_PATH`]. A successful verification
//! mints a session and sets a signed cookie; later requests carrying a live
//! session pass straight through.

use crate::error::{ProxyError, Result};
use crate::ip_filter::CidrRange;
use crate::request::RequestInfo;
use crate::response::GatewayResponse;
use config::{CaptchaConfig, CaptchaExceptionKind};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use http::{Method, StatusCode};
use rand::RngCore;
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use config::CaptchaProvider;

pub const COOKIE_NAME: &str = "gatehouse_captcha_session";
pub const VERIFY_PATH: &str = "/__captcha_verify";

const TURNSTILE_VERIFY_URL: &str = "https://challenges.cloudflare.com/turnstile/v0/siteverify";
const RECAPTCHA_VERIFY_URL: &str = "https://www.google.com/recaptcha/api/siteverify";

/// Used when the configured session duration is zero
const DEFAULT_SESSION_SECS: u64 = 3600;
/// Used when the configured v3 minimum score is not positive
const DEFAULT_MIN_SCORE: f64 = 0.5;

type HmacSha256 = Hmac<Sha256>;

/// Request that skips the challenge
#[derive(Debug, Clone)]
pub enum CaptchaException {
    PathPrefix(String),
    Network(CidrRange),
}

/// Per-endpoint CAPTCHA settings
#[derive(Debug, Clone)]
pub struct CaptchaSettings {
    pub provider: CaptchaProvider,
    pub site_key: String,
    pub secret_key: String,
    pub recaptcha_version: String,
    pub min_score: f64,
    pub session_duration: Duration,
    pub exceptions: Vec<CaptchaException>,
    pub verify_url: Option<String>,
}

impl CaptchaSettings {
    pub fn from_config(config: &CaptchaConfig) -> Self {
        let exceptions = config
            .exceptions
            .iter()
            .filter_map(|e| match e.kind {
                CaptchaExceptionKind::Path => {
                    (!e.value.is_empty()).then(|| CaptchaException::PathPrefix(e.value.clone()))
                }
                CaptchaExceptionKind::Cidr => match CidrRange::parse(&e.value) {
                    Some(range) => Some(CaptchaException::Network(range)),
                    None => {
                        warn!(value = %e.value, "Ignoring invalid CAPTCHA CIDR exception");
                        None
                    }
                },
            })
            .collect();

        let version = if config.recaptcha_version.is_empty() {
            "v2".to_string()
        } else {
            config.recaptcha_version.clone()
        };

        Self {
            provider: config.provider,
            site_key: config.site_key.clone(),
            secret_key: config.secret_key.clone(),
            recaptcha_version: version,
            min_score: if config.min_score > 0.0 {
                config.min_score
            } else {
                DEFAULT_MIN_SCORE
            },
            session_duration: Duration::from_secs(match config.session_duration_secs {
                0 => DEFAULT_SESSION_SECS,
                secs => secs,
            }),
            exceptions,
            verify_url: config.verify_url.clone(),
        }
    }

    fn is_excepted(&self, req: &RequestInfo) -> bool {
        let ip = req.client_ip();
        self.exceptions.iter().any(|e| match e {
            CaptchaException::PathPrefix(prefix) => req.path.starts_with(prefix.as_str()),
            CaptchaException::Network(range) => ip.is_some_and(|ip| range.contains(&ip)),
        })
    }

    fn verify_url(&self) -> &str {
        match (&self.verify_url, self.provider) {
            (Some(url), _) => url,
            (None, CaptchaProvider::Turnstile) => TURNSTILE_VERIFY_URL,
            (None, CaptchaProvider::Recaptcha) => RECAPTCHA_VERIFY_URL,
        }
    }

    fn is_recaptcha_v3(&self) -> bool {
        self.provider == CaptchaProvider::Recaptcha && self.recaptcha_version == "v3"
    }
}

#[derive(Debug, Deserialize)]
struct SiteVerifyResponse {
    success: bool,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

pub struct CaptchaGate {
    /// Session id -> expiry
    sessions: Arc<DashMap<String, Instant>>,
    /// Keyed with per-process random bytes
    signer: HmacSha256,
    client: reqwest::Client,
}

impl CaptchaGate {
    pub fn new(timeout: Duration) -> Result<Self> {
        let mut signing_key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut signing_key);
        let signer = <HmacSha256 as Mac>::new_from_slice(&signing_key)
            .map_err(|e| ProxyError::Captcha(e.to_string()))?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            sessions: Arc::new(DashMap::new()),
            signer,
            client,
        })
    }

    /// Run the gate. `None` lets the request continue.
    pub async fn check(&self, settings: &CaptchaSettings, req: &RequestInfo) -> Option<GatewayResponse> {
        if req.path == VERIFY_PATH {
            return Some(self.verify(settings, req).await);
        }

        if settings.is_excepted(req) {
            return None;
        }

        if req
            .cookie(COOKIE_NAME)
            .is_some_and(|value| self.has_valid_session(&value))
        {
            return None;
        }

        debug!(host = %req.host, path = %req.path, "Serving CAPTCHA challenge");
        Some(GatewayResponse::html(StatusCode::FORBIDDEN, challenge_page(settings)))
    }

    async fn verify(&self, settings: &CaptchaSettings, req: &RequestInfo) -> GatewayResponse {
        if req.method != Method::POST {
            return GatewayResponse::text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
        }

        let Some(token) = submitted_token(req) else {
            return GatewayResponse::text(StatusCode::BAD_REQUEST, "CAPTCHA token missing");
        };

        let remote_ip = req.client_ip().map(|ip| ip.to_string());
        match self.verify_token(settings, &token, remote_ip.as_deref()).await {
            Ok(true) => {}
            Ok(false) => return verification_failed(),
            Err(e) => {
                warn!(error = %e, "CAPTCHA verification failed");
                return verification_failed();
            }
        }

        let cookie_value = self.create_session(settings.session_duration);
        let mut cookie = format!(
            "{COOKIE_NAME}={cookie_value}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
            settings.session_duration.as_secs()
        );
        if req.is_tls {
            cookie.push_str("; Secure");
        }

        GatewayResponse::json(StatusCode::OK, &serde_json::json!({ "success": true }))
            .with_header("Set-Cookie", cookie)
    }

    async fn verify_token(&self, settings: &CaptchaSettings, token: &str, remote_ip: Option<&str>) -> Result<bool> {
        if settings.secret_key.is_empty() {
            return Err(ProxyError::Captcha("secret key is not configured".to_string()));
        }

        let mut form = vec![("secret", settings.secret_key.as_str()), ("response", token)];
        if let Some(ip) = remote_ip {
            form.push(("remoteip", ip));
        }

        let result: SiteVerifyResponse = self
            .client
            .post(settings.verify_url())
            .form(&form)
            .send()
            .await?
            .json()
            .await?;

        if !result.success {
            debug!(errors = ?result.error_codes, "Provider rejected CAPTCHA token");
            return Ok(false);
        }

        if settings.is_recaptcha_v3() {
            let score = result.score.unwrap_or(0.0);
            if score < settings.min_score {
                debug!(score, min_score = settings.min_score, "reCAPTCHA score too low");
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Mint a session and return its signed cookie value
    pub fn create_session(&self, duration: Duration) -> String {
        let mut id = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut id);
        let id = hex::encode(id);
        self.sessions.insert(id.clone(), Instant::now() + duration);
        format!("{id}.{}", self.sign(&id))
    }

    fn sign(&self, id: &str) -> String {
        hex::encode(self.mac(id).finalize().into_bytes())
    }

    fn mac(&self, id: &str) -> HmacSha256 {
        let mut mac = self.signer.clone();
        mac.update(id.as_bytes());
        mac
    }

    /// Whether a cookie value names a live session with a valid signature
    pub fn has_valid_session(&self, cookie_value: &str) -> bool {
        let Some((id, sig)) = cookie_value.split_once('.') else {
            return false;
        };
        let Ok(sig) = hex::decode(sig) else {
            return false;
        };
        if self.mac(id).verify_slice(&sig).is_err() {
            return false;
        }

        match self.sessions.get(id) {
            Some(expiry) if *expiry > Instant::now() => true,
            Some(_) => {
                self.sessions.remove(id);
                false
            }
            None => false,
        }
    }

    pub fn remove_session(&self, cookie_value: &str) {
        if let Some((id, _)) = cookie_value.split_once('.') {
            self.sessions.remove(id);
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drop expired sessions, returning how many were removed
    pub fn gc(&self) -> usize {
        gc_sessions(&self.sessions)
    }

    /// Run [`CaptchaGate::gc`] every `interval` until `shutdown` flips to true
    pub fn spawn_gc_task(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = gc_sessions(&sessions);
                        if removed > 0 {
                            debug!(removed, remaining = sessions.len(), "Expired CAPTCHA sessions removed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("CAPTCHA session GC stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}

fn gc_sessions(sessions: &DashMap<String, Instant>) -> usize {
    let now = Instant::now();
    let before = sessions.len();
    sessions.retain(|_, expiry| *expiry > now);
    before.saturating_sub(sessions.len())
}

fn verification_failed() -> GatewayResponse {
    GatewayResponse::json(
        StatusCode::UNAUTHORIZED,
        &serde_json::json!({ "success": false, "error": "CAPTCHA verification failed" }),
    )
}

/// Provider token from a urlencoded or multipart form body
fn submitted_token(req: &RequestInfo) -> Option<String> {
    let body = req.body.as_ref()?;
    let content_type = req.header("content-type").unwrap_or_default();

    let fields: Vec<(String, String)> = if content_type.starts_with("multipart/form-data") {
        let boundary = content_type
            .split(';')
            .filter_map(|p| p.trim().strip_prefix("boundary="))
            .next()?
            .trim_matches('"');
        multipart_fields(body, boundary)
    } else {
        url::form_urlencoded::parse(body)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    };

    ["cf-turnstile-response", "g-recaptcha-response"]
        .iter()
        .find_map(|name| {
            fields
                .iter()
                .find(|(k, v)| k == name && !v.is_empty())
                .map(|(_, v)| v.clone())
        })
}

/// Text fields of a multipart/form-data body
fn multipart_fields(body: &[u8], boundary: &str) -> Vec<(String, String)> {
    let body = String::from_utf8_lossy(body);
    let delimiter = format!("--{boundary}");

    body.split(delimiter.as_str())
        .filter_map(|part| {
            let part = part.strip_prefix("\r\n")?;
            let (headers, value) = part.split_once("\r\n\r\n")?;
            let name = headers
                .lines()
                .find(|l| l.to_ascii_lowercase().starts_with("content-disposition"))?
                .split(';')
                .filter_map(|p| p.trim().strip_prefix("name="))
                .next()?
                .trim_matches('"')
                .to_string();
            let value = value.strip_suffix("\r\n").unwrap_or(value);
            Some((name, value.to_string()))
        })
        .collect()
}

const CHALLENGE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Security Check Required</title>
{{SCRIPT}}
<style>
body { font-family: -apple-system, "Segoe UI", Roboto, Arial, sans-serif; display: flex; justify-content: center; align-items: center; min-height: 100vh; margin: 0; background: #f4f5f7; }
.container { background: #fff; padding: 40px; border-radius: 10px; box-shadow: 0 10px 40px rgba(0,0,0,0.1); text-align: center; max-width: 400px; }
#status { margin-top: 20px; display: none; }
</style>
</head>
<body>
<div class="container">
<h1>Security Check Required</h1>
<p>Please complete the security check below to access this page.</p>
{{WIDGET}}
<div id="status"></div>
</div>
<script>
function submitToken(field, token) {
  const data = new FormData();
  data.append(field, token);
  fetch('{{VERIFY_PATH}}', { method: 'POST', body: data })
    .then(r => r.json())
    .then(d => {
      const status = document.getElementById('status');
      status.style.display = 'block';
      if (d.success) {
        status.textContent = 'Verification successful! Redirecting...';
        setTimeout(() => window.location.reload(), 1000);
      } else {
        status.textContent = 'Verification failed. Please try again.';
      }
    })
    .catch(() => {
      const status = document.getElementById('status');
      status.style.display = 'block';
      status.textContent = 'An error occurred. Please try again.';
    });
}
{{INIT}}
</script>
</body>
</html>"#;

fn challenge_page(settings: &CaptchaSettings) -> String {
    let site_key = html_escape(&settings.site_key);
    let (script, widget, init) = match settings.provider {
        CaptchaProvider::Turnstile => (
            r#"<script src="https://challenges.cloudflare.com/turnstile/v0/api.js" async defer></script>"#.to_string(),
            format!(r#"<div class="cf-turnstile" data-sitekey="{site_key}" data-callback="onCaptchaSuccess"></div>"#),
            "function onCaptchaSuccess(token) { submitToken('cf-turnstile-response', token); }".to_string(),
        ),
        CaptchaProvider::Recaptcha if settings.is_recaptcha_v3() => (
            format!(r#"<script src="https://www.google.com/recaptcha/api.js?render={site_key}"></script>"#),
            String::new(),
            format!(
                "grecaptcha.ready(() => grecaptcha.execute('{site_key}', {{action: 'submit'}}).then(t => submitToken('g-recaptcha-response', t)));"
            ),
        ),
        CaptchaProvider::Recaptcha => (
            r#"<script src="https://www.google.com/recaptcha/api.js" async defer></script>"#.to_string(),
            format!(r#"<div class="g-recaptcha" data-sitekey="{site_key}" data-callback="onCaptchaSuccess"></div>"#),
            "function onCaptchaSuccess(token) { submitToken('g-recaptcha-response', token); }".to_string(),
        ),
    };

    CHALLENGE_TEMPLATE
        .replace("{{SCRIPT}}", &script)
        .replace("{{WIDGET}}", &widget)
        .replace("{{INIT}}", &init)
        .replace("{{VERIFY_PATH}}", VERIFY_PATH)
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}
