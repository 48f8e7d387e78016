//! Per-host TLS behavior lookups backed by the endpoint registry

use crate::endpoint::ProxyType;
use crate::error::{ProxyError, Result};
use crate::registry::EndpointRegistry;
use std::sync::Arc;
use tls::{HostTlsBehavior, TlsBehaviorSource, TlsError};

/// Resolves the TLS behavior for a hostname during handshakes
#[derive(Debug, Clone)]
pub struct TlsBehaviorResolver {
    registry: Arc<EndpointRegistry>,
}

impl TlsBehaviorResolver {
    pub fn new(registry: Arc<EndpointRegistry>) -> Self {
        Self { registry }
    }

    /// Behavior for `hostname`: a copy of the endpoint's own options when it
    /// has any, the default behavior otherwise
    pub fn resolve(&self, hostname: &str) -> Result<HostTlsBehavior> {
        let hostname = hostname.trim().trim_end_matches('.').to_lowercase();
        if hostname.is_empty() {
            return Err(ProxyError::Tls(TlsError::InvalidHostname));
        }

        Ok(self
            .registry
            .find_host(&hostname)
            .and_then(|endpoint| endpoint.tls_options())
            .unwrap_or_default())
    }

    /// Pin `cert_name` for `domain` on the host endpoint keyed `endpoint_key`
    pub fn set_preferred_certificate(&self, endpoint_key: &str, domain: &str, cert_name: &str) -> Result<()> {
        let endpoint = self
            .registry
            .load(ProxyType::Subdomain, endpoint_key)
            .ok_or_else(|| ProxyError::EndpointNotFound(endpoint_key.to_string()))?;
        endpoint.set_preferred_certificate(domain, cert_name)
    }
}

impl TlsBehaviorSource for TlsBehaviorResolver {
    fn tls_behavior(&self, hostname: &str) -> tls::Result<HostTlsBehavior> {
        self.resolve(hostname).map_err(|e| match e {
            ProxyError::Tls(e) => e,
            _ => TlsError::InvalidHostname,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Origin, PreparedEndpoint, ProxyEndpoint};

    fn resolver() -> TlsBehaviorResolver {
        let registry = Arc::new(EndpointRegistry::default());
        registry
            .store(
                PreparedEndpoint::prepare(ProxyEndpoint::new(
                    ProxyType::Subdomain,
                    "app.example.com",
                    vec![Origin::new("127.0.0.1:8080", false)],
                ))
                .unwrap(),
            )
            .unwrap();
        TlsBehaviorResolver::new(registry)
    }

    #[test]
    fn test_default_for_unknown_host() {
        let resolver = resolver();
        assert_eq!(resolver.resolve("other.example.com").unwrap(), HostTlsBehavior::default());
        assert_eq!(resolver.resolve("app.example.com").unwrap(), HostTlsBehavior::default());
    }

    #[test]
    fn test_empty_hostname_is_error() {
        assert!(resolver().resolve("").is_err());
        assert!(resolver().tls_behavior("  ").is_err());
    }

    #[test]
    fn test_set_preferred_certificate_and_copy() {
        let resolver = resolver();
        resolver
            .set_preferred_certificate("app.example.com", "app.example.com", "app-cert")
            .unwrap();

        let mut behavior = resolver.resolve("App.Example.com").unwrap();
        assert_eq!(
            behavior.preferred_certificate.get("app.example.com").map(String::as_str),
            Some("app-cert")
        );

        // Mutating the returned copy leaves the endpoint untouched
        behavior.preferred_certificate.clear();
        assert_eq!(resolver.resolve("app.example.com").unwrap().preferred_certificate.len(), 1);

        assert!(matches!(
            resolver.set_preferred_certificate("missing.example.com", "x", "y"),
            Err(ProxyError::EndpointNotFound(_))
        ));
        assert!(resolver
            .set_preferred_certificate("app.example.com", "app.example.com", "")
            .is_err());
    }
}
