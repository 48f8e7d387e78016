//! Forward-auth providers
//!
//! Authelia, Authentik and a generic forward-auth server. Each one makes a
//! single verification call per request; 2xx allows the request through,
//! anything else answers the client directly.

use crate::auth::{internal_error, AuthOutcome};
use crate::error::Result;
use crate::headers::HeaderOps;
use crate::request::RequestInfo;
use crate::response::GatewayResponse;
use config::{ForwardAuthConfig, ProvidersConfig, SsoProviderConfig};
use http::{HeaderMap, StatusCode};
use std::time::Duration;
use tracing::{debug, error, warn};

const AUTHENTIK_OUTPOST_PREFIX: &str = "outpost.goauthentik.io";

/// Headers never copied between the client, the provider and the upstream
const DO_NOT_COPY_HEADERS: [&str; 6] = [
    "Upgrade",
    "Connection",
    "Transfer-Encoding",
    "TE",
    "Trailers",
    "Keep-Alive",
];

fn is_do_not_copy(name: &str) -> bool {
    DO_NOT_COPY_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

fn contains_fold(list: &[String], name: &str) -> bool {
    list.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Clients for the configured forward-auth providers
pub struct ForwardAuthProviders {
    client: reqwest::Client,
    authelia: Option<SsoProviderConfig>,
    authentik: Option<SsoProviderConfig>,
    forward: Option<ForwardAuthConfig>,
}

impl ForwardAuthProviders {
    pub fn new(config: &ProvidersConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            authelia: config.authelia.clone(),
            authentik: config.authentik.clone(),
            forward: config.forward.clone(),
        })
    }

    /// Verify against Authelia's `/api/verify`
    pub async fn authelia(&self, req: &RequestInfo) -> AuthOutcome {
        let Some(base) = self.authelia.as_ref().and_then(sso_base_url) else {
            error!("Authelia URL not set");
            return AuthOutcome::Respond(internal_error());
        };

        let original = req.original_url();
        let mut request = self
            .client
            .post(format!("{base}/api/verify"))
            .header("X-Original-URL", &original);
        if let Some(cookie) = cookie_header(req) {
            request = request.header(http::header::COOKIE, cookie);
        }

        match request.send().await {
            Ok(resp) if resp.status() == StatusCode::OK => AuthOutcome::allowed(),
            Ok(resp) => {
                debug!(status = %resp.status(), "Authelia rejected request");
                let location = format!(
                    "{base}/?rd={}&rm={}",
                    urlencoding::encode(&original),
                    req.method
                );
                AuthOutcome::Respond(GatewayResponse::redirect(StatusCode::SEE_OTHER, &location))
            }
            Err(e) => {
                warn!(error = %e, "Unable to verify with Authelia");
                AuthOutcome::Respond(GatewayResponse::text(StatusCode::UNAUTHORIZED, "401 - Unauthorized"))
            }
        }
    }

    /// Verify against the Authentik nginx outpost endpoint. Requests for the
    /// outpost's own paths are relayed to Authentik untouched.
    pub async fn authentik(&self, req: &RequestInfo) -> AuthOutcome {
        let Some(base) = self.authentik.as_ref().and_then(sso_base_url) else {
            error!("Authentik URL not set");
            return AuthOutcome::Respond(internal_error());
        };

        let original = req.original_url();
        if req.path.trim_start_matches('/').starts_with(AUTHENTIK_OUTPOST_PREFIX) {
            return AuthOutcome::Respond(self.relay_to_outpost(&base, &original, req).await);
        }

        let mut request = self
            .client
            .get(format!("{base}/{AUTHENTIK_OUTPOST_PREFIX}/auth/nginx"))
            .header("X-Original-URL", &original);
        if let Some(cookie) = cookie_header(req) {
            request = request.header(http::header::COOKIE, cookie);
        }

        match request.send().await {
            Ok(resp) if resp.status() == StatusCode::OK => AuthOutcome::allowed(),
            Ok(resp) => {
                debug!(status = %resp.status(), "Authentik rejected request");
                let location = format!(
                    "{base}/{AUTHENTIK_OUTPOST_PREFIX}/start?rd={}",
                    urlencoding::encode(&original)
                );
                AuthOutcome::Respond(GatewayResponse::redirect(StatusCode::SEE_OTHER, &location))
            }
            Err(e) => {
                warn!(error = %e, "Unable to verify with Authentik");
                AuthOutcome::Respond(GatewayResponse::text(StatusCode::UNAUTHORIZED, "401 - Unauthorized"))
            }
        }
    }

    async fn relay_to_outpost(&self, base: &str, original: &str, req: &RequestInfo) -> GatewayResponse {
        let mut request = self
            .client
            .request(req.method.clone(), format!("{base}{}", req.uri))
            .header("X-Original-URL", original);
        if let Some(cookie) = cookie_header(req) {
            request = request.header(http::header::COOKIE, cookie);
        }
        if let Some(body) = &req.body {
            request = request.body(body.clone());
        }

        match request.send().await {
            Ok(resp) => relay_response(resp, resp_status_passthrough).await,
            Err(e) => {
                error!(error = %e, "Unable to pass request to Authentik outpost");
                internal_error()
            }
        }
    }

    /// Verify against a generic forward-auth server
    pub async fn forward(&self, req: &RequestInfo) -> AuthOutcome {
        let Some(options) = self.forward.as_ref().filter(|o| !o.address.is_empty()) else {
            error!("Forward auth address not set");
            return AuthOutcome::Respond(internal_error());
        };

        let headers = auth_request_headers(options, req);
        let resp = match self.client.get(&options.address).headers(headers).send().await {
            Ok(resp) => resp,
            Err(e) => {
                error!(error = %e, "Unable to perform forwarded auth due to a request error");
                return AuthOutcome::Respond(internal_error());
            }
        };

        let status = resp.status();
        if status.is_success() {
            return AuthOutcome::Allowed {
                upstream: upstream_edits(options, req, resp.headers()),
                downstream: copy_included(resp.headers(), &options.response_client_headers),
            };
        }

        debug!(status = %status, "Forward auth rejected request");

        if let Some(login) = options.login_url.as_deref().filter(|l| !l.is_empty()) {
            let separator = if login.contains('?') { '&' } else { '?' };
            let location = format!(
                "{login}{separator}rd={}&rm={}",
                urlencoding::encode(&req.original_url()),
                req.method
            );
            return AuthOutcome::Respond(GatewayResponse::redirect(StatusCode::FOUND, &location));
        }

        let has_location = resp.headers().contains_key(http::header::LOCATION);
        let use_x_original = options.use_x_original_headers;
        AuthOutcome::Respond(
            relay_response(resp, |status| {
                if has_location && status.is_redirection() {
                    status
                } else if has_location && use_x_original && status == StatusCode::UNAUTHORIZED {
                    StatusCode::FOUND
                } else {
                    StatusCode::UNAUTHORIZED
                }
            })
            .await,
        )
    }
}

fn sso_base_url(config: &SsoProviderConfig) -> Option<String> {
    let url = config.url.trim().trim_end_matches('/');
    if url.is_empty() {
        return None;
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        return Some(url.to_string());
    }
    let scheme = if config.use_https { "https" } else { "http" };
    Some(format!("{scheme}://{url}"))
}

/// All request cookies joined into one header value
fn cookie_header(req: &RequestInfo) -> Option<String> {
    let cookies = req.cookies();
    if cookies.is_empty() {
        return None;
    }
    Some(
        cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; "),
    )
}

/// Cookies filtered by name; `keep` selects inclusion or exclusion
fn filter_cookies(req: &RequestInfo, names: &[String], keep: bool) -> String {
    req.cookies()
        .into_iter()
        .filter(|(name, _)| names.contains(name) == keep)
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Headers sent to the forward-auth server
fn auth_request_headers(options: &ForwardAuthConfig, req: &RequestInfo) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &req.headers {
        if is_do_not_copy(name.as_str()) || *name == http::header::HOST {
            continue;
        }
        if !options.request_headers.is_empty() && !contains_fold(&options.request_headers, name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if !options.request_included_cookies.is_empty() {
        let cookies = filter_cookies(req, &options.request_included_cookies, true);
        headers.remove(http::header::COOKIE);
        if let Ok(value) = cookies.parse() {
            headers.insert(http::header::COOKIE, value);
        }
    }

    let mut set = |name: &'static str, value: String| {
        if let Ok(value) = value.parse() {
            headers.insert(name, value);
        }
    };

    let client_ip = req.remote_addr.map(|ip| ip.to_string());
    if options.use_x_original_headers {
        if let Some(ip) = client_ip {
            set("X-Original-IP", ip.clone());
            set("X-Forwarded-For", ip);
        }
        set("X-Original-Method", req.method.to_string());
        set(
            "X-Original-URL",
            format!("{}://{}{}", req.scheme(), req.host, req.path),
        );
    } else {
        if let Some(ip) = client_ip {
            set("X-Forwarded-For", ip);
        }
        set("X-Forwarded-Method", req.method.to_string());
        set("X-Forwarded-Proto", req.scheme().to_string());
        set("X-Forwarded-Host", req.host.clone());
        set("X-Forwarded-URI", req.path.clone());
    }

    headers
}

/// Upstream edits after a successful forward-auth check
fn upstream_edits(options: &ForwardAuthConfig, req: &RequestInfo, provider: &HeaderMap) -> HeaderOps {
    let mut ops = HeaderOps::default();

    if !options.request_excluded_cookies.is_empty() && !req.cookies().is_empty() {
        ops.set(
            "Cookie",
            filter_cookies(req, &options.request_excluded_cookies, false),
        );
    }

    for (name, value) in copy_included(provider, &options.response_headers) {
        ops.set(name, value);
    }
    ops
}

/// Provider headers named in `included`, skipping hop-by-hop headers
fn copy_included(provider: &HeaderMap, included: &[String]) -> Vec<(String, String)> {
    if included.is_empty() {
        return Vec::new();
    }
    provider
        .iter()
        .filter(|(name, _)| !is_do_not_copy(name.as_str()) && contains_fold(included, name.as_str()))
        .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
        .collect()
}

fn resp_status_passthrough(status: StatusCode) -> StatusCode {
    status
}

/// Turn a provider response into a client response, minus hop-by-hop headers
async fn relay_response(resp: reqwest::Response, status: impl Fn(StatusCode) -> StatusCode) -> GatewayResponse {
    let mut out = GatewayResponse::new(status(resp.status()));
    for (name, value) in resp.headers() {
        if is_do_not_copy(name.as_str()) || *name == http::header::CONTENT_LENGTH {
            continue;
        }
        if let Ok(value) = value.to_str() {
            out = out.with_header(name.as_str(), value);
        }
    }
    match resp.bytes().await {
        Ok(body) => out.with_body(body),
        Err(e) => {
            error!(error = %e, "Unable to read provider response body");
            internal_error()
        }
    }
}
