//! Configuration structures and parsing for gatehouse

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// TLS listener settings
    #[serde(default)]
    pub tls: TlsConfig,

    /// Blacklist / whitelist rules
    #[serde(default)]
    pub access: AccessConfig,

    /// Authentication provider settings shared by all endpoints
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Root (fallback) endpoint
    #[serde(default)]
    pub root: Option<RootConfig>,

    /// Host and virtual directory endpoints
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    /// Redirect table
    #[serde(default)]
    pub redirects: Vec<RedirectConfig>,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.global.listen.is_empty() && (!self.tls.enabled || self.tls.listen.is_empty()) {
            return Err(ConfigError::Validation(
                "No listen addresses configured".to_string(),
            ));
        }

        if self.global.rate_limit_window_secs == 0 {
            return Err(ConfigError::Validation(
                "rate_limit_window_secs must be greater than zero".to_string(),
            ));
        }

        if let Some(path) = &self.global.metrics_path {
            if !path.starts_with('/') {
                return Err(ConfigError::Validation(format!(
                    "metrics_path {path:?} must start with '/'"
                )));
            }
        }

        if let Some(root) = &self.root {
            check_vdirs("root", &root.virtual_directories)?;
        }

        let mut seen: HashSet<(EndpointKind, String)> = HashSet::new();
        for endpoint in &self.endpoints {
            let key = endpoint.matching.trim().to_lowercase();
            if key.is_empty() {
                return Err(ConfigError::Validation(
                    "Endpoint has an empty matching domain".to_string(),
                ));
            }

            if !seen.insert((endpoint.kind, key.clone())) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate endpoint '{}'",
                    endpoint.matching
                )));
            }

            if endpoint.origins.is_empty() && endpoint.inactive_origins.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Endpoint '{}' has no origins",
                    endpoint.matching
                )));
            }

            if let Some(captcha) = &endpoint.captcha {
                if captcha.site_key.is_empty() || captcha.secret_key.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "Endpoint '{}' enables CAPTCHA without site_key/secret_key",
                        endpoint.matching
                    )));
                }
            }

            check_vdirs(&endpoint.matching, &endpoint.virtual_directories)?;
        }

        // A key may not be both a host endpoint and a virtual directory
        for endpoint in self.endpoints.iter().filter(|e| e.kind == EndpointKind::Subdomain) {
            let key = endpoint.matching.trim().to_lowercase();
            if seen.contains(&(EndpointKind::VirtualDirectory, key)) {
                return Err(ConfigError::Validation(format!(
                    "'{}' is registered as both a host and a virtual directory",
                    endpoint.matching
                )));
            }
        }

        for redirect in &self.redirects {
            if !(300..400).contains(&redirect.status_code) {
                return Err(ConfigError::Validation(format!(
                    "Redirect '{}' has non-redirect status {}",
                    redirect.redirect_url, redirect.status_code
                )));
            }
        }

        Ok(())
    }
}

fn check_vdirs(parent: &str, vdirs: &[VirtualDirectoryConfig]) -> Result<(), ConfigError> {
    let mut prefixes = HashSet::new();
    for vdir in vdirs {
        if !prefixes.insert(vdir.matching_path.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Duplicate virtual directory '{}' under '{}'",
                vdir.matching_path, parent
            )));
        }
    }
    Ok(())
}

/// Global configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Plain HTTP listen addresses
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Identifier used in X-Forwarded-Server
    #[serde(default = "default_host_id")]
    pub host_id: String,

    /// Directory holding error page templates
    #[serde(default = "default_template_dir")]
    pub template_dir: PathBuf,

    /// Rate limit counter reset window in seconds
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_secs: u64,

    /// CAPTCHA session garbage collection interval in seconds
    #[serde(default = "default_captcha_gc_interval")]
    pub captcha_gc_interval_secs: u64,

    /// Timeout for calls to auth and CAPTCHA providers in seconds
    #[serde(default = "default_provider_timeout")]
    pub provider_timeout_secs: u64,

    /// Optional public suffix list; the built-in list is used when unset
    #[serde(default)]
    pub tld_file: Option<PathBuf>,

    /// Root routing options file
    #[serde(default = "default_root_options_file")]
    pub root_options_file: PathBuf,

    /// Treat redirect table keys as regular expressions
    #[serde(default)]
    pub redirect_regex: bool,

    /// Grace period for graceful shutdown in seconds (default: 30)
    #[serde(default = "default_grace_period")]
    pub grace_period: u64,

    /// Path serving the Prometheus export; disabled when unset
    #[serde(default)]
    pub metrics_path: Option<String>,
}

fn default_listen() -> Vec<String> {
    vec![":80".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host_id() -> String {
    "gatehouse".to_string()
}

fn default_template_dir() -> PathBuf {
    PathBuf::from("./web")
}

fn default_rate_limit_window() -> u64 {
    1
}

fn default_captcha_gc_interval() -> u64 {
    300
}

fn default_provider_timeout() -> u64 {
    5
}

fn default_root_options_file() -> PathBuf {
    PathBuf::from("./conf/root_config.json")
}

fn default_grace_period() -> u64 {
    30
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            log_level: default_log_level(),
            host_id: default_host_id(),
            template_dir: default_template_dir(),
            rate_limit_window_secs: default_rate_limit_window(),
            captcha_gc_interval_secs: default_captcha_gc_interval(),
            provider_timeout_secs: default_provider_timeout(),
            tld_file: None,
            root_options_file: default_root_options_file(),
            redirect_regex: false,
            grace_period: default_grace_period(),
            metrics_path: None,
        }
    }
}

/// TLS listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// HTTPS listen addresses
    #[serde(default = "default_tls_listen")]
    pub listen: Vec<String>,

    /// Directory of `<name>.pem` / `<name>.key` pairs
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,

    /// Certificate name served when nothing else matches
    #[serde(default = "default_cert_name")]
    pub default_cert: String,

    #[serde(default = "default_true")]
    pub enable_h2: bool,
}

fn default_tls_listen() -> Vec<String> {
    vec![":443".to_string()]
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from("./conf/certs")
}

fn default_cert_name() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_tls_listen(),
            cert_dir: default_cert_dir(),
            default_cert: default_cert_name(),
            enable_h2: true,
        }
    }
}

/// Blacklist and whitelist rules. Entries are IPs, CIDR ranges or
/// two-letter country codes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessConfig {
    #[serde(default)]
    pub blacklist: Vec<String>,

    #[serde(default)]
    pub whitelist: Vec<String>,

    #[serde(default)]
    pub whitelist_enabled: bool,

    /// Static CIDR -> country code table used for geo lookups
    #[serde(default)]
    pub geo: HashMap<String, String>,
}

/// Authentication providers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub authelia: Option<SsoProviderConfig>,

    #[serde(default)]
    pub authentik: Option<SsoProviderConfig>,

    #[serde(default)]
    pub forward: Option<ForwardAuthConfig>,

    #[serde(default)]
    pub oauth2: Option<OAuth2Config>,
}

/// Authelia / Authentik server location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SsoProviderConfig {
    /// Host (and optional port) of the provider, without scheme
    pub url: String,

    #[serde(default)]
    pub use_https: bool,
}

/// Generic forward-auth provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForwardAuthConfig {
    /// Verification endpoint
    pub address: String,

    /// Where to send unauthenticated users; a 401 is returned when unset
    #[serde(default)]
    pub login_url: Option<String>,

    /// Provider response headers copied to the upstream request
    #[serde(default)]
    pub response_headers: Vec<String>,

    /// Provider response headers copied to the client response
    #[serde(default)]
    pub response_client_headers: Vec<String>,

    /// Request headers sent to the provider (all when empty)
    #[serde(default)]
    pub request_headers: Vec<String>,

    /// Cookies stripped from the upstream request after authorization
    #[serde(default)]
    pub request_excluded_cookies: Vec<String>,

    /// Cookies sent to the provider (all when empty)
    #[serde(default)]
    pub request_included_cookies: Vec<String>,

    /// Send X-Original-* instead of X-Forwarded-*
    #[serde(default)]
    pub use_x_original_headers: bool,
}

/// OAuth2 authorization code flow settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuth2Config {
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    pub auth_url: String,

    pub token_url: String,

    /// Endpoint used to validate a presented token
    pub userinfo_url: String,

    #[serde(default = "default_oauth2_scopes")]
    pub scopes: Vec<String>,

    /// Use PKCE with an S256 challenge
    #[serde(default)]
    pub pkce: bool,
}

fn default_oauth2_scopes() -> Vec<String> {
    vec!["openid".to_string(), "profile".to_string()]
}

/// Root endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootConfig {
    #[serde(default)]
    pub origins: Vec<String>,

    #[serde(default)]
    pub require_tls: bool,

    #[serde(default)]
    pub skip_cert_validation: bool,

    #[serde(default)]
    pub default_site: DefaultSite,

    /// Redirect target for `default_site = "redirect"`
    #[serde(default)]
    pub default_site_value: String,

    #[serde(default)]
    pub virtual_directories: Vec<VirtualDirectoryConfig>,

    #[serde(default)]
    pub headers: HeaderRulesConfig,
}

/// Behavior of the root endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultSite {
    #[default]
    StaticWebServer,
    ReverseProxy,
    Redirect,
    NotFound,
    NoResponse,
}

/// Endpoint table selector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    #[default]
    Subdomain,
    VirtualDirectory,
}

/// Host or virtual directory endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default)]
    pub kind: EndpointKind,

    /// Hostname (may contain `*` / `?`) or path prefix
    pub matching: String,

    #[serde(default)]
    pub aliases: Vec<String>,

    /// Upstreams in `host[:port]` form
    #[serde(default)]
    pub origins: Vec<String>,

    /// Upstreams currently taken out of rotation
    #[serde(default)]
    pub inactive_origins: Vec<String>,

    #[serde(default)]
    pub require_tls: bool,

    #[serde(default)]
    pub skip_cert_validation: bool,

    #[serde(default)]
    pub bypass_global_tls: bool,

    #[serde(default)]
    pub disabled: bool,

    #[serde(default)]
    pub virtual_directories: Vec<VirtualDirectoryConfig>,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub captcha: Option<CaptchaConfig>,

    /// Requests per window per client IP (0 = disabled)
    #[serde(default)]
    pub rate_limit: u64,

    #[serde(default)]
    pub headers: HeaderRulesConfig,

    #[serde(default)]
    pub tls_options: Option<TlsOptionsConfig>,
}

/// Nested virtual directory under a host or the root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualDirectoryConfig {
    pub matching_path: String,

    pub origin: String,

    #[serde(default)]
    pub require_tls: bool,

    #[serde(default)]
    pub skip_cert_validation: bool,

    #[serde(default)]
    pub disabled: bool,
}

/// Authentication method selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethodKind {
    #[default]
    None,
    Basic,
    Authelia,
    Authentik,
    Oauth2,
    Forward,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub method: AuthMethodKind,

    /// Basic auth users
    #[serde(default)]
    pub credentials: Vec<BasicCredential>,

    /// Path prefixes that skip basic auth
    #[serde(default)]
    pub exceptions: Vec<String>,
}

/// A basic auth user; `password_hash` is hex-encoded SHA-512
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicCredential {
    pub username: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptchaProvider {
    #[default]
    Turnstile,
    Recaptcha,
}

/// CAPTCHA gate settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaConfig {
    #[serde(default)]
    pub provider: CaptchaProvider,

    pub site_key: String,

    pub secret_key: String,

    /// "v2" or "v3"
    #[serde(default = "default_recaptcha_version")]
    pub recaptcha_version: String,

    /// Minimum reCAPTCHA v3 score
    #[serde(default = "default_min_score")]
    pub min_score: f64,

    #[serde(default = "default_session_duration")]
    pub session_duration_secs: u64,

    #[serde(default)]
    pub exceptions: Vec<CaptchaExceptionConfig>,

    /// Override for the provider's site-verify URL
    #[serde(default)]
    pub verify_url: Option<String>,
}

fn default_recaptcha_version() -> String {
    "v2".to_string()
}

fn default_min_score() -> f64 {
    0.5
}

fn default_session_duration() -> u64 {
    3600
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptchaExceptionKind {
    Path,
    Cidr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaExceptionConfig {
    #[serde(rename = "type")]
    pub kind: CaptchaExceptionKind,
    pub value: String,
}

/// Header rewrite settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderRulesConfig {
    #[serde(default)]
    pub user_defined: Vec<HeaderRuleConfig>,

    #[serde(default)]
    pub request_host_overwrite: Option<String>,

    /// 0 disables HSTS
    #[serde(default)]
    pub hsts_max_age: u64,

    #[serde(default)]
    pub enable_permission_policy: bool,

    /// Directive -> allow list. Missing directives default to `*`.
    #[serde(default)]
    pub permission_policy: HashMap<String, Vec<String>>,

    #[serde(default)]
    pub disable_hop_by_hop_header_removal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderDirection {
    Upstream,
    Downstream,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderRuleConfig {
    pub direction: HeaderDirection,
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub remove: bool,
}

/// Per-endpoint TLS options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsOptionsConfig {
    #[serde(default)]
    pub preferred_certificate: HashMap<String, String>,
    #[serde(default)]
    pub disable_sni: bool,
    #[serde(default)]
    pub disable_legacy_certificate_matching: bool,
    #[serde(default)]
    pub enable_auto_https: bool,
}

/// Redirect table entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectConfig {
    /// `host/path` prefix (or pattern when regex matching is enabled)
    pub redirect_url: String,

    pub target_url: String,

    #[serde(default)]
    pub forward_child_path: bool,

    #[serde(default = "default_redirect_status")]
    pub status_code: u16,
}

fn default_redirect_status() -> u16 {
    307
}
