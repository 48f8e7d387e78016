//! SNI certificate selection for Pingora's OpenSSL listeners
//!
//! Certificates are loaded by name from a directory of `<name>.pem` /
//! `<name>.key` pairs. During the handshake the host's [`HostTlsBehavior`]
//! decides whether a pinned certificate is used, whether file-name matching
//! applies, or whether SNI is ignored entirely.

use crate::behavior::{HostTlsBehavior, TlsBehaviorSource};
use crate::error::{Result, TlsError};
use async_trait::async_trait;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use parking_lot::RwLock;
use pingora_core::listeners::TlsAccept;
use pingora_core::protocols::tls::TlsRef;
use pingora_core::tls::ext::{ssl_use_certificate, ssl_use_private_key};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Certificate, key and chain loaded from one PEM pair
pub struct CertKeyPair {
    pub cert: X509,
    pub key: PKey<Private>,
    pub chain: Vec<X509>,
}

impl CertKeyPair {
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let mut stack = X509::stack_from_pem(cert_pem)?.into_iter();
        let cert = stack
            .next()
            .ok_or_else(|| TlsError::CertificateNotFound("empty PEM".to_string()))?;
        let key = PKey::private_key_from_pem(key_pem)?;
        Ok(Self {
            cert,
            key,
            chain: stack.collect(),
        })
    }

    pub fn from_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = std::fs::read(cert_path)?;
        let key_pem = std::fs::read(key_path)?;
        Self::from_pem(&cert_pem, &key_pem)
    }
}

/// SNI-based certificate resolver
pub struct SniResolver {
    /// Certificate name -> pair
    certs: RwLock<HashMap<String, Arc<CertKeyPair>>>,
    default_name: String,
    behaviors: Option<Arc<dyn TlsBehaviorSource>>,
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver")
            .field("certs", &self.certs.read().keys().collect::<Vec<_>>())
            .field("default", &self.default_name)
            .finish()
    }
}

impl SniResolver {
    pub fn new(default_name: impl Into<String>) -> Self {
        Self {
            certs: RwLock::new(HashMap::new()),
            default_name: default_name.into().to_lowercase(),
            behaviors: None,
        }
    }

    /// Consult `source` for per-host TLS behavior during handshakes
    pub fn with_behavior_source(mut self, source: Arc<dyn TlsBehaviorSource>) -> Self {
        self.behaviors = Some(source);
        self
    }

    pub fn add_cert(&self, name: &str, pair: CertKeyPair) {
        self.certs.write().insert(name.to_lowercase(), Arc::new(pair));
        debug!(name = %name, "Added certificate");
    }

    pub fn cert_count(&self) -> usize {
        self.certs.read().len()
    }

    /// Load every `<name>.pem` with a matching `<name>.key` from `dir`
    pub fn load_dir(&self, dir: &Path) -> Result<usize> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pem") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let key_path = path.with_file_name(format!("{name}.key"));
            if !key_path.exists() {
                warn!(cert = ?path, "Certificate has no matching key file, skipping");
                continue;
            }
            match CertKeyPair::from_files(&path, &key_path) {
                Ok(pair) => {
                    self.add_cert(name, pair);
                    loaded += 1;
                }
                Err(e) => warn!(cert = ?path, error = %e, "Failed to load certificate"),
            }
        }

        if loaded == 0 {
            warn!(dir = ?dir, "No certificates loaded");
        } else {
            info!(dir = ?dir, count = loaded, "Loaded certificates");
        }
        Ok(loaded)
    }

    fn behavior_for(&self, sni: &str) -> HostTlsBehavior {
        let Some(source) = &self.behaviors else {
            return HostTlsBehavior::default();
        };
        match source.tls_behavior(sni) {
            Ok(behavior) => behavior,
            Err(e) => {
                warn!(sni = %sni, error = %e, "TLS behavior lookup failed, using default");
                HostTlsBehavior::default()
            }
        }
    }

    /// Pick the certificate name for a handshake
    pub fn select(&self, sni: Option<&str>) -> Option<String> {
        let certs = self.certs.read();
        let default = || {
            certs
                .contains_key(&self.default_name)
                .then(|| self.default_name.clone())
        };

        let Some(sni) = sni.map(str::to_lowercase) else {
            return default();
        };

        let behavior = self.behavior_for(&sni);
        if behavior.disable_sni {
            debug!(sni = %sni, "SNI disabled for host, using default certificate");
            return default();
        }

        if let Some(name) = behavior.preferred_for(&sni) {
            let name = name.to_lowercase();
            if certs.contains_key(&name) {
                return Some(name);
            }
            warn!(sni = %sni, cert = %name, "Preferred certificate is not loaded");
        }

        if !behavior.disable_legacy_certificate_matching {
            if certs.contains_key(&sni) {
                return Some(sni);
            }
            if let Some((_, parent)) = sni.split_once('.') {
                for wildcard in [format!("*.{parent}"), format!("_.{parent}")] {
                    if certs.contains_key(&wildcard) {
                        return Some(wildcard);
                    }
                }
            }
        }

        default()
    }

    fn get(&self, name: &str) -> Option<Arc<CertKeyPair>> {
        self.certs.read().get(name).cloned()
    }
}

#[async_trait]
impl TlsAccept for SniResolver {
    async fn certificate_callback(&self, ssl: &mut TlsRef) {
        let sni = ssl
            .servername(openssl::ssl::NameType::HOST_NAME)
            .map(str::to_string);

        let Some(pair) = self.select(sni.as_deref()).and_then(|name| self.get(&name)) else {
            warn!(sni = ?sni, "No certificate available for TLS handshake");
            return;
        };

        if let Err(e) = ssl_use_certificate(ssl, &pair.cert) {
            warn!(error = %e, "Failed to set certificate");
            return;
        }
        if let Err(e) = ssl_use_private_key(ssl, &pair.key) {
            warn!(error = %e, "Failed to set private key");
            return;
        }
        for chain_cert in &pair.chain {
            if let Err(e) = ssl.add_chain_cert(chain_cert.clone()) {
                warn!(error = %e, "Failed to add chain certificate");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::asn1::Asn1Time;
    use openssl::ec::{EcGroup, EcKey};
    use openssl::hash::MessageDigest;
    use openssl::nid::Nid;
    use openssl::x509::{X509Builder, X509NameBuilder};
    use tempfile::TempDir;

    fn self_signed(cn: &str) -> (Vec<u8>, Vec<u8>) {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
        let name = name.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(30).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();

        (
            builder.build().to_pem().unwrap(),
            key.private_key_to_pem_pkcs8().unwrap(),
        )
    }

    fn pair(cn: &str) -> CertKeyPair {
        let (cert, key) = self_signed(cn);
        CertKeyPair::from_pem(&cert, &key).unwrap()
    }

    struct FixedBehavior(HostTlsBehavior);

    impl TlsBehaviorSource for FixedBehavior {
        fn tls_behavior(&self, _hostname: &str) -> Result<HostTlsBehavior> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_load_dir() {
        let temp_dir = TempDir::new().unwrap();
        let (cert, key) = self_signed("example.com");
        std::fs::write(temp_dir.path().join("example.com.pem"), &cert).unwrap();
        std::fs::write(temp_dir.path().join("example.com.key"), &key).unwrap();
        std::fs::write(temp_dir.path().join("orphan.pem"), &cert).unwrap();

        let resolver = SniResolver::new("default");
        assert_eq!(resolver.load_dir(temp_dir.path()).unwrap(), 1);
        assert_eq!(resolver.cert_count(), 1);
    }

    #[test]
    fn test_select_legacy_matching() {
        let resolver = SniResolver::new("default");
        resolver.add_cert("default", pair("default"));
        resolver.add_cert("app.example.com", pair("app.example.com"));
        resolver.add_cert("_.example.com", pair("*.example.com"));

        assert_eq!(resolver.select(Some("app.example.com")).as_deref(), Some("app.example.com"));
        assert_eq!(resolver.select(Some("api.example.com")).as_deref(), Some("_.example.com"));
        assert_eq!(resolver.select(Some("other.org")).as_deref(), Some("default"));
        assert_eq!(resolver.select(None).as_deref(), Some("default"));
    }

    #[test]
    fn test_select_preferred_certificate() {
        let mut behavior = HostTlsBehavior::default();
        behavior
            .set_preferred_certificate("app.example.com", "pinned")
            .unwrap();

        let resolver = SniResolver::new("default")
            .with_behavior_source(Arc::new(FixedBehavior(behavior)));
        resolver.add_cert("default", pair("default"));
        resolver.add_cert("pinned", pair("pinned"));
        resolver.add_cert("app.example.com", pair("app.example.com"));

        assert_eq!(resolver.select(Some("app.example.com")).as_deref(), Some("pinned"));
    }

    #[test]
    fn test_select_disable_sni() {
        let behavior = HostTlsBehavior {
            disable_sni: true,
            ..Default::default()
        };
        let resolver = SniResolver::new("default")
            .with_behavior_source(Arc::new(FixedBehavior(behavior)));
        resolver.add_cert("default", pair("default"));
        resolver.add_cert("app.example.com", pair("app.example.com"));

        assert_eq!(resolver.select(Some("app.example.com")).as_deref(), Some("default"));
    }

    #[test]
    fn test_select_without_legacy_matching() {
        let behavior = HostTlsBehavior {
            disable_legacy_certificate_matching: true,
            ..Default::default()
        };
        let resolver = SniResolver::new("default")
            .with_behavior_source(Arc::new(FixedBehavior(behavior)));
        resolver.add_cert("app.example.com", pair("app.example.com"));

        assert_eq!(resolver.select(Some("app.example.com")), None);
    }
}
