//! Host TLS behavior

use crate::error::{Result, TlsError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// TLS policy attached to a host endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostTlsBehavior {
    /// SNI name -> certificate name
    #[serde(default)]
    pub preferred_certificate: HashMap<String, String>,

    /// Always serve the default certificate
    #[serde(default, rename = "DisableSNI")]
    pub disable_sni: bool,

    /// Skip certificate lookup by file name
    #[serde(default)]
    pub disable_legacy_certificate_matching: bool,

    #[serde(default, rename = "EnableAutoHTTPS")]
    pub enable_auto_https: bool,
}

impl HostTlsBehavior {
    /// Pin `cert_name` for `domain`
    pub fn set_preferred_certificate(&mut self, domain: &str, cert_name: &str) -> Result<()> {
        if cert_name.is_empty() {
            return Err(TlsError::MissingCertificateName);
        }
        self.preferred_certificate
            .insert(domain.to_lowercase(), cert_name.to_string());
        Ok(())
    }

    /// Preferred certificate for `sni`, trying the exact name and then its wildcard form
    pub fn preferred_for(&self, sni: &str) -> Option<&str> {
        let sni = sni.to_lowercase();
        if let Some(name) = self.preferred_certificate.get(&sni) {
            return Some(name.as_str());
        }
        let (_, parent) = sni.split_once('.')?;
        self.preferred_certificate
            .get(&format!("*.{parent}"))
            .map(String::as_str)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Lookup of the TLS behavior for a handshake hostname
pub trait TlsBehaviorSource: Send + Sync {
    fn tls_behavior(&self, hostname: &str) -> Result<HostTlsBehavior>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_shape() {
        let mut behavior = HostTlsBehavior::default();
        behavior
            .set_preferred_certificate("app.example.com", "example")
            .unwrap();
        behavior.disable_sni = true;

        let json = behavior.to_json().unwrap();
        assert!(json.contains("\"PreferredCertificate\":{\"app.example.com\":\"example\"}"));
        assert!(json.contains("\"DisableSNI\":true"));
        assert!(json.contains("\"EnableAutoHTTPS\":false"));

        let parsed: HostTlsBehavior = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, behavior);
    }

    #[test]
    fn test_empty_cert_name_rejected() {
        let mut behavior = HostTlsBehavior::default();
        assert!(matches!(
            behavior.set_preferred_certificate("app.example.com", ""),
            Err(TlsError::MissingCertificateName)
        ));
        assert!(behavior.preferred_certificate.is_empty());
    }

    #[test]
    fn test_preferred_wildcard() {
        let mut behavior = HostTlsBehavior::default();
        behavior
            .set_preferred_certificate("*.example.com", "wildcard")
            .unwrap();
        behavior
            .set_preferred_certificate("api.example.com", "api")
            .unwrap();

        assert_eq!(behavior.preferred_for("api.example.com"), Some("api"));
        assert_eq!(behavior.preferred_for("WWW.example.com"), Some("wildcard"));
        assert_eq!(behavior.preferred_for("example.org"), None);
    }
}
