//! Endpoint registry
//!
//! Host endpoints and virtual directories live in two concurrent maps; the
//! root endpoint sits in its own slot. Entries are `Arc`s of prepared
//! endpoints, so an update swaps the whole value and readers see either the
//! old or the new endpoint.

use crate::endpoint::{PreparedEndpoint, ProxyEndpoint, ProxyType};
use crate::error::{ProxyError, Result};
use crate::tld::TldMap;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of a virtual directory lookup
#[derive(Debug, Clone)]
pub enum VdirMatch {
    Endpoint(Arc<PreparedEndpoint>),
    /// No match for the path, but one exists with a trailing slash
    TrailingSlashRedirect,
}

#[derive(Debug, Default)]
pub struct EndpointRegistry {
    hosts: DashMap<String, Arc<PreparedEndpoint>>,
    vdirs: DashMap<String, Arc<PreparedEndpoint>>,
    root: RwLock<Option<Arc<PreparedEndpoint>>>,
    tld: TldMap,
}

impl EndpointRegistry {
    pub fn new(tld: TldMap) -> Self {
        Self {
            hosts: DashMap::new(),
            vdirs: DashMap::new(),
            root: RwLock::new(None),
            tld,
        }
    }

    pub fn tld(&self) -> &TldMap {
        &self.tld
    }

    /// Validate an endpoint so it can be stored
    pub fn prepare(&self, endpoint: ProxyEndpoint) -> Result<PreparedEndpoint> {
        PreparedEndpoint::prepare(endpoint)
    }

    fn table(&self, proxy_type: ProxyType) -> Option<&DashMap<String, Arc<PreparedEndpoint>>> {
        match proxy_type {
            ProxyType::Subdomain => Some(&self.hosts),
            ProxyType::VirtualDirectory => Some(&self.vdirs),
            ProxyType::Root => None,
        }
    }

    pub fn load(&self, proxy_type: ProxyType, key: &str) -> Option<Arc<PreparedEndpoint>> {
        match self.table(proxy_type) {
            Some(table) => table.get(&normalize_key(proxy_type, key)).map(|e| e.value().clone()),
            None => self.root(),
        }
    }

    /// Insert or replace an endpoint under its own type and key
    pub fn store(&self, endpoint: PreparedEndpoint) -> Result<Arc<PreparedEndpoint>> {
        let proxy_type = endpoint.proxy_type;
        let key = normalize_key(proxy_type, &endpoint.root_or_matching_domain);
        let endpoint = Arc::new(endpoint);

        let Some(table) = self.table(proxy_type) else {
            *self.root.write() = Some(endpoint.clone());
            info!("Root endpoint updated");
            return Ok(endpoint);
        };

        let other = match proxy_type {
            ProxyType::Subdomain => &self.vdirs,
            _ => &self.hosts,
        };
        if other.contains_key(&key) {
            return Err(ProxyError::KeyConflict(key));
        }

        table.insert(key.clone(), endpoint.clone());
        debug!(key = %key, proxy_type = ?proxy_type, "Endpoint stored");
        Ok(endpoint)
    }

    /// Remove an endpoint; missing keys are ignored
    pub fn delete(&self, proxy_type: ProxyType, key: &str) {
        match self.table(proxy_type) {
            Some(table) => {
                if table.remove(&normalize_key(proxy_type, key)).is_some() {
                    debug!(key = %key, proxy_type = ?proxy_type, "Endpoint removed");
                }
            }
            None => *self.root.write() = None,
        }
    }

    /// Snapshot of one table, sorted by key
    pub fn range(&self, proxy_type: ProxyType) -> Vec<(String, Arc<PreparedEndpoint>)> {
        let mut entries: Vec<_> = match self.table(proxy_type) {
            Some(table) => table
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            None => self
                .root()
                .map(|r| vec![("/".to_string(), r)])
                .unwrap_or_default(),
        };
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn root(&self) -> Option<Arc<PreparedEndpoint>> {
        self.root.read().clone()
    }

    /// Host endpoint for a port-stripped, lowercased hostname.
    ///
    /// Exact keys win. Otherwise every enabled endpoint whose key or alias
    /// glob-matches is a candidate and the smallest key is chosen.
    pub fn find_host(&self, hostname: &str) -> Option<Arc<PreparedEndpoint>> {
        if let Some(endpoint) = self.hosts.get(hostname) {
            if !endpoint.disabled {
                return Some(endpoint.value().clone());
            }
        }

        self.hosts
            .iter()
            .filter(|e| !e.disabled)
            .filter(|e| {
                glob_match(e.key(), hostname)
                    || e.matching_domain_alias.iter().any(|a| glob_match(a, hostname))
            })
            .min_by(|a, b| a.key().cmp(b.key()))
            .map(|e| e.value().clone())
    }

    /// Virtual directory with the longest prefix of `path`
    pub fn find_vdir(&self, path: &str) -> Option<VdirMatch> {
        if let Some(endpoint) = self.longest_vdir(path) {
            return Some(VdirMatch::Endpoint(endpoint));
        }
        if !path.ends_with('/') && self.longest_vdir(&format!("{path}/")).is_some() {
            return Some(VdirMatch::TrailingSlashRedirect);
        }
        None
    }

    fn longest_vdir(&self, path: &str) -> Option<Arc<PreparedEndpoint>> {
        self.vdirs
            .iter()
            .filter(|e| !e.disabled && path.starts_with(e.key().as_str()))
            .max_by_key(|e| e.key().len())
            .map(|e| e.value().clone())
    }
}

fn normalize_key(proxy_type: ProxyType, key: &str) -> String {
    match proxy_type {
        ProxyType::Subdomain => key.trim().to_lowercase(),
        _ => key.trim().to_string(),
    }
}

/// Shell-style match supporting `*` and `?`
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Origin;
    use std::thread;

    fn endpoint(proxy_type: ProxyType, key: &str, port: u16) -> PreparedEndpoint {
        PreparedEndpoint::prepare(ProxyEndpoint::new(
            proxy_type,
            key,
            vec![Origin::new(format!("127.0.0.1:{port}"), false)],
        ))
        .unwrap()
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*.example.com", "a.example.com"));
        assert!(glob_match("*.example.com", "a.b.example.com"));
        assert!(!glob_match("*.example.com", "example.com"));
        assert!(glob_match("app?.example.com", "app1.example.com"));
        assert!(!glob_match("app?.example.com", "app12.example.com"));
        assert!(glob_match("exact.com", "exact.com"));
        assert!(glob_match("*", "anything"));
    }

    #[test]
    fn test_store_load_delete() {
        let registry = EndpointRegistry::default();
        registry.store(endpoint(ProxyType::Subdomain, "A.Example.com", 8001)).unwrap();

        let loaded = registry.load(ProxyType::Subdomain, "a.example.com").unwrap();
        assert_eq!(loaded.upstreams()[0].port, 8001);

        registry.delete(ProxyType::Subdomain, "a.example.com");
        assert!(registry.load(ProxyType::Subdomain, "a.example.com").is_none());

        // Deleting again is a no-op
        registry.delete(ProxyType::Subdomain, "a.example.com");
    }

    #[test]
    fn test_key_in_one_table_only() {
        let registry = EndpointRegistry::default();
        registry.store(endpoint(ProxyType::VirtualDirectory, "shared", 8001)).unwrap();
        assert!(matches!(
            registry.store(endpoint(ProxyType::Subdomain, "shared", 8002)),
            Err(ProxyError::KeyConflict(_))
        ));
    }

    #[test]
    fn test_root_slot() {
        let registry = EndpointRegistry::default();
        assert!(registry.root().is_none());
        registry.store(endpoint(ProxyType::Root, "/", 8080)).unwrap();
        assert_eq!(registry.load(ProxyType::Root, "/").unwrap().upstreams()[0].port, 8080);
        assert_eq!(registry.range(ProxyType::Root).len(), 1);
    }

    #[test]
    fn test_find_host_wildcard_and_alias() {
        let registry = EndpointRegistry::default();
        registry.store(endpoint(ProxyType::Subdomain, "*.example.com", 8001)).unwrap();
        registry.store(endpoint(ProxyType::Subdomain, "api.example.com", 8002)).unwrap();

        let mut aliased = ProxyEndpoint::new(
            ProxyType::Subdomain,
            "main.test",
            vec![Origin::new("127.0.0.1:8003", false)],
        );
        aliased.matching_domain_alias = vec!["www.test".to_string()];
        registry.store(PreparedEndpoint::prepare(aliased).unwrap()).unwrap();

        assert_eq!(registry.find_host("api.example.com").unwrap().upstreams()[0].port, 8002);
        assert_eq!(registry.find_host("web.example.com").unwrap().upstreams()[0].port, 8001);
        assert_eq!(registry.find_host("www.test").unwrap().upstreams()[0].port, 8003);
        assert!(registry.find_host("example.org").is_none());
    }

    #[test]
    fn test_find_host_skips_disabled() {
        let registry = EndpointRegistry::default();
        let mut disabled = ProxyEndpoint::new(
            ProxyType::Subdomain,
            "off.example.com",
            vec![Origin::new("127.0.0.1:8001", false)],
        );
        disabled.disabled = true;
        registry.store(PreparedEndpoint::prepare(disabled).unwrap()).unwrap();

        assert!(registry.find_host("off.example.com").is_none());
    }

    #[test]
    fn test_vdir_longest_prefix() {
        let registry = EndpointRegistry::default();
        registry.store(endpoint(ProxyType::VirtualDirectory, "/api", 8001)).unwrap();
        registry.store(endpoint(ProxyType::VirtualDirectory, "/api/v2", 8002)).unwrap();

        match registry.find_vdir("/api/v2/users") {
            Some(VdirMatch::Endpoint(e)) => assert_eq!(e.root_or_matching_domain, "/api/v2"),
            other => panic!("unexpected match: {other:?}"),
        }
        match registry.find_vdir("/api/v1") {
            Some(VdirMatch::Endpoint(e)) => assert_eq!(e.root_or_matching_domain, "/api"),
            other => panic!("unexpected match: {other:?}"),
        }
    }

    #[test]
    fn test_vdir_trailing_slash() {
        let registry = EndpointRegistry::default();
        registry.store(endpoint(ProxyType::VirtualDirectory, "/blog/", 8001)).unwrap();

        assert!(matches!(
            registry.find_vdir("/blog"),
            Some(VdirMatch::TrailingSlashRedirect)
        ));
        assert!(matches!(
            registry.find_vdir("/blog/post"),
            Some(VdirMatch::Endpoint(_))
        ));
        assert!(registry.find_vdir("/other").is_none());
    }

    #[test]
    fn test_concurrent_reads_during_updates() {
        let registry = Arc::new(EndpointRegistry::default());
        registry.store(endpoint(ProxyType::Subdomain, "a.example.com", 8000)).unwrap();

        let writer = {
            let registry = registry.clone();
            thread::spawn(move || {
                for port in 8001..8201 {
                    registry.store(endpoint(ProxyType::Subdomain, "a.example.com", port)).unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        let e = registry.find_host("a.example.com").unwrap();
                        assert_eq!(e.upstreams().len(), 1);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(registry.find_host("a.example.com").unwrap().upstreams()[0].port, 8200);
    }
}
