//! Blacklist / whitelist access gate

use crate::error::{ProxyError, Result};
use crate::ip_filter::{CidrRange, IpSet};
use config::AccessConfig;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Maps an IP to an ISO country code
pub trait GeoLookup: Send + Sync {
    fn resolve_country_code(&self, ip: &IpAddr) -> Result<String>;
}

/// Source of blacklist and whitelist decisions
pub trait AccessRules: Send + Sync {
    fn is_blacklisted(&self, ip: &IpAddr) -> bool;
    fn is_whitelisted(&self, ip: &IpAddr) -> bool;
    fn is_country_blacklisted(&self, _country: &str) -> bool {
        false
    }
    fn is_country_whitelisted(&self, _country: &str) -> bool {
        false
    }
    fn whitelist_enabled(&self) -> bool;
}

/// Why a request was blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Blacklist,
    Whitelist,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::Blacklist => "blacklist",
            BlockReason::Whitelist => "whitelist",
        }
    }
}

#[derive(Debug, Default, Clone)]
struct RuleList {
    ips: IpSet,
    countries: HashSet<String>,
}

impl RuleList {
    /// Entries that parse as an IP or CIDR go to the IP set; two-letter
    /// alphabetic entries are country codes; anything else is ignored
    fn from_entries(entries: &[String]) -> Self {
        let mut countries = HashSet::new();
        let mut ips = Vec::new();
        for entry in entries {
            let entry = entry.trim();
            if CidrRange::parse(entry).is_some() {
                ips.push(entry.to_string());
            } else if entry.len() == 2 && entry.chars().all(|c| c.is_ascii_alphabetic()) {
                countries.insert(entry.to_ascii_uppercase());
            } else {
                warn!(entry = %entry, "Ignoring unrecognized access rule entry");
            }
        }
        Self {
            ips: IpSet::from_entries(&ips),
            countries,
        }
    }
}

/// Access rules read from the `[access]` section
#[derive(Debug, Default, Clone)]
pub struct StaticAccessRules {
    blacklist: RuleList,
    whitelist: RuleList,
    whitelist_enabled: bool,
}

impl StaticAccessRules {
    pub fn from_config(config: &AccessConfig) -> Self {
        Self {
            blacklist: RuleList::from_entries(&config.blacklist),
            whitelist: RuleList::from_entries(&config.whitelist),
            whitelist_enabled: config.whitelist_enabled,
        }
    }
}

impl AccessRules for StaticAccessRules {
    fn is_blacklisted(&self, ip: &IpAddr) -> bool {
        self.blacklist.ips.contains(ip)
    }

    fn is_whitelisted(&self, ip: &IpAddr) -> bool {
        self.whitelist.ips.contains(ip)
    }

    fn is_country_blacklisted(&self, country: &str) -> bool {
        self.blacklist.countries.contains(&country.to_ascii_uppercase())
    }

    fn is_country_whitelisted(&self, country: &str) -> bool {
        self.whitelist.countries.contains(&country.to_ascii_uppercase())
    }

    fn whitelist_enabled(&self) -> bool {
        self.whitelist_enabled
    }
}

/// Geo lookup from a static CIDR -> country table
#[derive(Debug, Default, Clone)]
pub struct StaticGeoLookup {
    ranges: Vec<(CidrRange, String)>,
}

impl StaticGeoLookup {
    pub fn from_config(config: &AccessConfig) -> Self {
        let ranges = config
            .geo
            .iter()
            .filter_map(|(cidr, cc)| Some((CidrRange::parse(cidr)?, cc.to_ascii_uppercase())))
            .collect();
        Self { ranges }
    }
}

impl GeoLookup for StaticGeoLookup {
    fn resolve_country_code(&self, ip: &IpAddr) -> Result<String> {
        self.ranges
            .iter()
            .find(|(range, _)| range.contains(ip))
            .map(|(_, cc)| cc.clone())
            .ok_or_else(|| ProxyError::Config(format!("no country for {ip}")))
    }
}

pub struct AccessGate {
    rules: Arc<dyn AccessRules>,
    geo: Arc<dyn GeoLookup>,
}

impl AccessGate {
    pub fn new(rules: Arc<dyn AccessRules>, geo: Arc<dyn GeoLookup>) -> Self {
        Self { rules, geo }
    }

    pub fn from_config(config: &AccessConfig) -> Self {
        Self::new(
            Arc::new(StaticAccessRules::from_config(config)),
            Arc::new(StaticGeoLookup::from_config(config)),
        )
    }

    /// Decide whether `ip` is blocked. The blacklist is checked first, so an
    /// address on both lists is always blocked. With the whitelist enabled an
    /// unknown requester IP is blocked.
    pub fn blocked(&self, ip: Option<IpAddr>) -> (bool, Option<BlockReason>) {
        let Some(ip) = ip else {
            if self.rules.whitelist_enabled() {
                return (true, Some(BlockReason::Whitelist));
            }
            return (false, None);
        };

        let country = match self.geo.resolve_country_code(&ip) {
            Ok(cc) => Some(cc),
            Err(e) => {
                debug!(ip = %ip, error = %e, "Country lookup failed");
                None
            }
        };

        let country_blacklisted = country
            .as_deref()
            .is_some_and(|cc| self.rules.is_country_blacklisted(cc));
        if self.rules.is_blacklisted(&ip) || country_blacklisted {
            debug!(ip = %ip, country = ?country, "Request blocked by blacklist");
            return (true, Some(BlockReason::Blacklist));
        }

        if self.rules.whitelist_enabled() {
            let country_whitelisted = country
                .as_deref()
                .is_some_and(|cc| self.rules.is_country_whitelisted(cc));
            if !self.rules.is_whitelisted(&ip) && !country_whitelisted {
                debug!(ip = %ip, country = ?country, "Request blocked by whitelist");
                return (true, Some(BlockReason::Whitelist));
            }
        }

        (false, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn gate(blacklist: &[&str], whitelist: &[&str], whitelist_enabled: bool) -> AccessGate {
        let mut geo = HashMap::new();
        geo.insert("203.0.113.0/24".to_string(), "jp".to_string());
        AccessGate::from_config(&AccessConfig {
            blacklist: blacklist.iter().map(|s| s.to_string()).collect(),
            whitelist: whitelist.iter().map(|s| s.to_string()).collect(),
            whitelist_enabled,
            geo,
        })
    }

    #[test]
    fn test_blacklist_precedence() {
        let gate = gate(&["10.0.0.1"], &["10.0.0.0/8"], true);
        assert_eq!(
            gate.blocked(Some("10.0.0.1".parse().unwrap())),
            (true, Some(BlockReason::Blacklist))
        );
        assert_eq!(gate.blocked(Some("10.0.0.2".parse().unwrap())), (false, None));
    }

    #[test]
    fn test_whitelist() {
        let gate = gate(&[], &["192.168.0.0/16"], true);
        assert_eq!(
            gate.blocked(Some("8.8.8.8".parse().unwrap())),
            (true, Some(BlockReason::Whitelist))
        );
        assert!(!gate.blocked(Some("192.168.1.10".parse().unwrap())).0);
        assert!(gate.blocked(None).0);

        let open = self::gate(&[], &["192.168.0.0/16"], false);
        assert!(!open.blocked(Some("8.8.8.8".parse().unwrap())).0);
        assert!(!open.blocked(None).0);
    }

    #[test]
    fn test_country_rules() {
        let gate = gate(&["JP"], &[], false);
        assert_eq!(
            gate.blocked(Some("203.0.113.9".parse().unwrap())),
            (true, Some(BlockReason::Blacklist))
        );
        assert!(!gate.blocked(Some("198.51.100.1".parse().unwrap())).0);

        let gate = self::gate(&[], &["jp"], true);
        assert!(!gate.blocked(Some("203.0.113.9".parse().unwrap())).0);
        assert!(gate.blocked(Some("198.51.100.1".parse().unwrap())).0);
    }

    #[test]
    fn test_unrecognized_entries_ignored() {
        let rules = StaticAccessRules::from_config(&AccessConfig {
            blacklist: vec!["not-an-ip".to_string(), "1.2.3.4".to_string()],
            ..Default::default()
        });
        assert!(rules.is_blacklisted(&"1.2.3.4".parse().unwrap()));
        assert!(!rules.is_country_blacklisted("NO"));
    }
}
