//! Proxy endpoint data model
//!
//! A [`ProxyEndpoint`] is plain configuration. Before it can be stored in the
//! registry it must go through [`PreparedEndpoint::prepare`], which parses and
//! validates every origin address. Only prepared endpoints can be dispatched
//! to.

use crate::auth::{AuthMethod, BasicAuthSettings};
use crate::captcha::CaptchaSettings;
use crate::error::{ProxyError, Result};
use crate::forwarder::{OriginPicker, RoundRobin};
use crate::headers::HeaderRewriteRules;
use config::{AuthMethodKind, DefaultSite, EndpointConfig, EndpointKind, RootConfig, VirtualDirectoryConfig};
use parking_lot::RwLock;
use std::ops::Deref;
use tls::HostTlsBehavior;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyType {
    Root,
    Subdomain,
    VirtualDirectory,
}

/// Fallback behavior of the root endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DefaultSiteOption {
    #[default]
    InternalStaticWebServer,
    ReverseProxy,
    Redirect,
    NotFoundPage,
    NoResponse,
}

impl From<DefaultSite> for DefaultSiteOption {
    fn from(site: DefaultSite) -> Self {
        match site {
            DefaultSite::StaticWebServer => Self::InternalStaticWebServer,
            DefaultSite::ReverseProxy => Self::ReverseProxy,
            DefaultSite::Redirect => Self::Redirect,
            DefaultSite::NotFound => Self::NotFoundPage,
            DefaultSite::NoResponse => Self::NoResponse,
        }
    }
}

/// Unparsed upstream address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    /// `host[:port]`, optionally prefixed with a scheme
    pub domain: String,
    pub require_tls: bool,
    pub skip_cert_validation: bool,
}

impl Origin {
    pub fn new(domain: impl Into<String>, require_tls: bool) -> Self {
        Self {
            domain: domain.into(),
            require_tls,
            skip_cert_validation: false,
        }
    }
}

/// A parsed, dialable upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub verify_cert: bool,
    /// Host part of the configured domain, used as SNI and Host
    pub sni: String,
}

impl Upstream {
    pub fn parse(origin: &Origin) -> Result<Self> {
        let raw = origin.domain.trim().trim_end_matches('/');
        if raw.is_empty() {
            return Err(ProxyError::InvalidDomain(origin.domain.clone()));
        }

        let (tls, rest) = if let Some(rest) = raw.strip_prefix("https://") {
            (true, rest)
        } else if let Some(rest) = raw.strip_prefix("http://") {
            (origin.require_tls, rest)
        } else {
            (origin.require_tls, raw)
        };

        let scheme = if tls { "https" } else { "http" };
        let url = url::Url::parse(&format!("{scheme}://{rest}"))
            .map_err(|_| ProxyError::InvalidDomain(origin.domain.clone()))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::InvalidDomain(origin.domain.clone()))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ProxyError::InvalidDomain(origin.domain.clone()))?;

        Ok(Self {
            sni: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            host,
            port,
            tls,
            verify_cert: !origin.skip_cert_validation,
        })
    }

    /// `host:port` as handed to the resolver
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Domain as configured, with the scheme's default port omitted
    pub fn domain(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            self.authority()
        }
    }
}

/// Path-prefix endpoint nested under a host or the root
#[derive(Debug, Clone)]
pub struct VirtualDirectory {
    pub matching_path: String,
    pub origin: Origin,
    pub disabled: bool,
}

impl From<&VirtualDirectoryConfig> for VirtualDirectory {
    fn from(config: &VirtualDirectoryConfig) -> Self {
        Self {
            matching_path: config.matching_path.clone(),
            origin: Origin {
                domain: config.origin.clone(),
                require_tls: config.require_tls,
                skip_cert_validation: config.skip_cert_validation,
            },
            disabled: config.disabled,
        }
    }
}

/// The central routing unit
#[derive(Debug)]
pub struct ProxyEndpoint {
    pub proxy_type: ProxyType,
    /// Hostname (subdomain table), path prefix (vdir table) or "/" for root
    pub root_or_matching_domain: String,
    pub matching_domain_alias: Vec<String>,
    pub active_origins: Vec<Origin>,
    pub inactive_origins: Vec<Origin>,
    pub require_tls: bool,
    pub skip_cert_validations: bool,
    pub bypass_global_tls: bool,
    pub virtual_directories: Vec<VirtualDirectory>,
    pub auth: AuthMethod,
    pub captcha: Option<CaptchaSettings>,
    /// Requests per window per IP, 0 disables
    pub rate_limit: u64,
    pub header_rewrite: HeaderRewriteRules,
    /// Guarded separately from the registry tables
    pub tls_options: RwLock<Option<HostTlsBehavior>>,
    pub default_site: DefaultSiteOption,
    pub default_site_value: String,
    pub disabled: bool,
}

impl ProxyEndpoint {
    pub fn new(proxy_type: ProxyType, key: &str, origins: Vec<Origin>) -> Self {
        Self {
            proxy_type,
            root_or_matching_domain: key.to_string(),
            matching_domain_alias: Vec::new(),
            active_origins: origins,
            inactive_origins: Vec::new(),
            require_tls: false,
            skip_cert_validations: false,
            bypass_global_tls: false,
            virtual_directories: Vec::new(),
            auth: AuthMethod::None,
            captcha: None,
            rate_limit: 0,
            header_rewrite: HeaderRewriteRules::default(),
            tls_options: RwLock::new(None),
            default_site: DefaultSiteOption::default(),
            default_site_value: String::new(),
            disabled: false,
        }
    }

    pub fn from_config(config: &EndpointConfig) -> Self {
        let proxy_type = match config.kind {
            EndpointKind::Subdomain => ProxyType::Subdomain,
            EndpointKind::VirtualDirectory => ProxyType::VirtualDirectory,
        };
        let key = match proxy_type {
            ProxyType::Subdomain => config.matching.trim().to_lowercase(),
            _ => config.matching.trim().to_string(),
        };
        let origin = |domain: &String| Origin {
            domain: domain.clone(),
            require_tls: config.require_tls,
            skip_cert_validation: config.skip_cert_validation,
        };

        let auth = match config.auth.method {
            AuthMethodKind::None => AuthMethod::None,
            AuthMethodKind::Basic => AuthMethod::Basic(BasicAuthSettings::from_config(&config.auth)),
            AuthMethodKind::Authelia => AuthMethod::Authelia,
            AuthMethodKind::Authentik => AuthMethod::Authentik,
            AuthMethodKind::Oauth2 => AuthMethod::OAuth2,
            AuthMethodKind::Forward => AuthMethod::Forward,
        };

        let tls_options = config.tls_options.as_ref().map(|o| HostTlsBehavior {
            preferred_certificate: o.preferred_certificate.clone(),
            disable_sni: o.disable_sni,
            disable_legacy_certificate_matching: o.disable_legacy_certificate_matching,
            enable_auto_https: o.enable_auto_https,
        });

        Self {
            proxy_type,
            root_or_matching_domain: key,
            matching_domain_alias: config.aliases.iter().map(|a| a.trim().to_lowercase()).collect(),
            active_origins: config.origins.iter().map(origin).collect(),
            inactive_origins: config.inactive_origins.iter().map(origin).collect(),
            require_tls: config.require_tls,
            skip_cert_validations: config.skip_cert_validation,
            bypass_global_tls: config.bypass_global_tls,
            virtual_directories: config.virtual_directories.iter().map(Into::into).collect(),
            auth,
            captcha: config.captcha.as_ref().map(CaptchaSettings::from_config),
            rate_limit: config.rate_limit,
            header_rewrite: HeaderRewriteRules::from_config(&config.headers),
            tls_options: RwLock::new(tls_options),
            default_site: DefaultSiteOption::default(),
            default_site_value: String::new(),
            disabled: config.disabled,
        }
    }

    pub fn from_root_config(config: &RootConfig) -> Self {
        let origins = config
            .origins
            .iter()
            .map(|domain| Origin {
                domain: domain.clone(),
                require_tls: config.require_tls,
                skip_cert_validation: config.skip_cert_validation,
            })
            .collect();

        let mut endpoint = Self::new(ProxyType::Root, "/", origins);
        endpoint.require_tls = config.require_tls;
        endpoint.skip_cert_validations = config.skip_cert_validation;
        endpoint.virtual_directories = config.virtual_directories.iter().map(Into::into).collect();
        endpoint.header_rewrite = HeaderRewriteRules::from_config(&config.headers);
        endpoint.default_site = config.default_site.into();
        endpoint.default_site_value = config.default_site_value.clone();
        endpoint
    }
}

/// A nested virtual directory with its parsed upstream
#[derive(Debug)]
pub struct PreparedVdir {
    pub matching_path: String,
    pub upstream: Upstream,
    pub disabled: bool,
}

/// An endpoint whose forwarding targets have been resolved and validated.
///
/// The only constructor is [`PreparedEndpoint::prepare`], so the registry
/// can never hold an endpoint that was not prepared.
pub struct PreparedEndpoint {
    endpoint: ProxyEndpoint,
    upstreams: Vec<Upstream>,
    vdirs: Vec<PreparedVdir>,
    picker: Box<dyn OriginPicker>,
}

impl std::fmt::Debug for PreparedEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedEndpoint")
            .field("key", &self.endpoint.root_or_matching_domain)
            .field("upstreams", &self.upstreams)
            .finish()
    }
}

impl PreparedEndpoint {
    pub fn prepare(endpoint: ProxyEndpoint) -> Result<Self> {
        Self::prepare_with_picker(endpoint, Box::new(RoundRobin::default()))
    }

    pub fn prepare_with_picker(endpoint: ProxyEndpoint, picker: Box<dyn OriginPicker>) -> Result<Self> {
        if endpoint.root_or_matching_domain.trim().is_empty() {
            return Err(ProxyError::InvalidDomain(endpoint.root_or_matching_domain.clone()));
        }

        let upstreams = endpoint
            .active_origins
            .iter()
            .map(Upstream::parse)
            .collect::<Result<Vec<_>>>()?;
        // Inactive origins are validated so they can be re-activated safely
        for origin in &endpoint.inactive_origins {
            Upstream::parse(origin)?;
        }

        let vdirs = endpoint
            .virtual_directories
            .iter()
            .map(|vdir| {
                Ok(PreparedVdir {
                    matching_path: vdir.matching_path.clone(),
                    upstream: Upstream::parse(&vdir.origin)?,
                    disabled: vdir.disabled,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            endpoint,
            upstreams,
            vdirs,
            picker,
        })
    }

    pub fn upstreams(&self) -> &[Upstream] {
        &self.upstreams
    }

    pub fn vdirs(&self) -> &[PreparedVdir] {
        &self.vdirs
    }

    pub fn picker(&self) -> &dyn OriginPicker {
        self.picker.as_ref()
    }

    /// Longest enabled nested virtual directory that prefixes `path`
    pub fn match_vdir(&self, path: &str) -> Option<&PreparedVdir> {
        self.vdirs
            .iter()
            .filter(|v| !v.disabled && path.starts_with(&v.matching_path))
            .max_by_key(|v| v.matching_path.len())
    }

    /// Current TLS options, copied out under the endpoint's TLS lock
    pub fn tls_options(&self) -> Option<HostTlsBehavior> {
        self.endpoint.tls_options.read().clone()
    }

    /// Pin a certificate for `domain`, creating the options on first use
    pub fn set_preferred_certificate(&self, domain: &str, cert_name: &str) -> Result<()> {
        let mut options = self.endpoint.tls_options.write();
        let behavior = options.get_or_insert_with(HostTlsBehavior::default);
        behavior.set_preferred_certificate(domain, cert_name)?;
        Ok(())
    }
}

impl Deref for PreparedEndpoint {
    type Target = ProxyEndpoint;

    fn deref(&self) -> &Self::Target {
        &self.endpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_parse() {
        let up = Upstream::parse(&Origin::new("127.0.0.1:8080", false)).unwrap();
        assert_eq!(up.host, "127.0.0.1");
        assert_eq!(up.port, 8080);
        assert!(!up.tls);

        let up = Upstream::parse(&Origin::new("https://backend.internal/", false)).unwrap();
        assert_eq!(up.host, "backend.internal");
        assert_eq!(up.port, 443);
        assert!(up.tls);
        assert_eq!(up.domain(), "backend.internal");

        let up = Upstream::parse(&Origin::new("backend.internal", true)).unwrap();
        assert_eq!(up.port, 443);
        assert!(up.verify_cert);
    }

    #[test]
    fn test_prepare_rejects_bad_domain() {
        let endpoint = ProxyEndpoint::new(ProxyType::Subdomain, "a.example.com", vec![Origin::new("", false)]);
        assert!(matches!(
            PreparedEndpoint::prepare(endpoint),
            Err(ProxyError::InvalidDomain(_))
        ));

        let endpoint = ProxyEndpoint::new(
            ProxyType::Subdomain,
            "a.example.com",
            vec![Origin::new("http://exa mple:99999", false)],
        );
        assert!(PreparedEndpoint::prepare(endpoint).is_err());
    }

    #[test]
    fn test_prepare_rejects_empty_key() {
        let endpoint = ProxyEndpoint::new(ProxyType::Subdomain, " ", vec![Origin::new("127.0.0.1:80", false)]);
        assert!(PreparedEndpoint::prepare(endpoint).is_err());
    }

    #[test]
    fn test_nested_vdir_longest_prefix() {
        let mut endpoint = ProxyEndpoint::new(
            ProxyType::Subdomain,
            "a.example.com",
            vec![Origin::new("127.0.0.1:80", false)],
        );
        endpoint.virtual_directories = vec![
            VirtualDirectory {
                matching_path: "/api".to_string(),
                origin: Origin::new("127.0.0.1:81", false),
                disabled: false,
            },
            VirtualDirectory {
                matching_path: "/api/v2".to_string(),
                origin: Origin::new("127.0.0.1:82", false),
                disabled: false,
            },
        ];
        let prepared = PreparedEndpoint::prepare(endpoint).unwrap();

        assert_eq!(prepared.match_vdir("/api/v2/users").unwrap().upstream.port, 82);
        assert_eq!(prepared.match_vdir("/api/v1").unwrap().upstream.port, 81);
        assert!(prepared.match_vdir("/web").is_none());
    }

    #[test]
    fn test_set_preferred_certificate() {
        let prepared = PreparedEndpoint::prepare(ProxyEndpoint::new(
            ProxyType::Subdomain,
            "a.example.com",
            vec![Origin::new("127.0.0.1:80", false)],
        ))
        .unwrap();
        assert!(prepared.tls_options().is_none());

        prepared.set_preferred_certificate("a.example.com", "cert-a").unwrap();
        let options = prepared.tls_options().unwrap();
        assert_eq!(options.preferred_certificate.get("a.example.com").map(String::as_str), Some("cert-a"));

        assert!(prepared.set_preferred_certificate("a.example.com", "").is_err());
    }
}
