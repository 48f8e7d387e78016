//! Header rewrite rules

use config::{HeaderDirection, HeaderRulesConfig};
use std::collections::BTreeMap;

/// Hop-by-hop headers that must not be relayed
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "Connection",
    "Keep-Alive",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "TE",
    "Trailers",
    "Transfer-Encoding",
    "Upgrade",
];

/// Header edits to apply to one message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderOps {
    pub set: Vec<(String, String)>,
    pub remove: Vec<String>,
}

impl HeaderOps {
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.set.push((name.into(), value.into()));
    }

    pub fn remove(&mut self, name: impl Into<String>) {
        self.remove.push(name.into());
    }

    pub fn extend(&mut self, other: HeaderOps) {
        self.set.extend(other.set);
        self.remove.extend(other.remove);
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct HeaderRule {
    pub direction: HeaderDirection,
    pub key: String,
    pub value: String,
    pub remove: bool,
}

/// Per-endpoint header rewriting
#[derive(Debug, Clone, Default)]
pub struct HeaderRewriteRules {
    pub user_defined: Vec<HeaderRule>,
    pub request_host_overwrite: Option<String>,
    pub hsts_max_age: u64,
    pub permission_policy: Option<PermissionPolicy>,
    pub disable_hop_by_hop_removal: bool,
}

impl HeaderRewriteRules {
    pub fn from_config(config: &HeaderRulesConfig) -> Self {
        let permission_policy = config.enable_permission_policy.then(|| {
            let mut policy = PermissionPolicy::default();
            for (directive, allow) in &config.permission_policy {
                policy.directives.insert(directive.clone(), allow.clone());
            }
            policy
        });

        Self {
            user_defined: config
                .user_defined
                .iter()
                .map(|r| HeaderRule {
                    direction: r.direction,
                    key: r.key.clone(),
                    value: r.value.clone(),
                    remove: r.remove,
                })
                .collect(),
            request_host_overwrite: config
                .request_host_overwrite
                .clone()
                .filter(|h| !h.is_empty()),
            hsts_max_age: config.hsts_max_age,
            permission_policy,
            disable_hop_by_hop_removal: config.disable_hop_by_hop_header_removal,
        }
    }

    /// Split the rules into upstream request edits and downstream response edits
    pub fn split(&self, endpoint_key: &str, is_tls: bool) -> (HeaderOps, HeaderOps) {
        let mut upstream = HeaderOps::default();
        let mut downstream = HeaderOps::default();

        for rule in &self.user_defined {
            let ops = match rule.direction {
                HeaderDirection::Upstream => &mut upstream,
                HeaderDirection::Downstream => &mut downstream,
            };
            if rule.remove {
                ops.remove(rule.key.clone());
            } else {
                ops.set(rule.key.clone(), rule.value.clone());
            }
        }

        if self.hsts_max_age > 0 && is_tls {
            let mut value = format!("max-age={}", self.hsts_max_age);
            if endpoint_key.contains('*') {
                value.push_str("; includeSubdomains");
            }
            downstream.set("Strict-Transport-Security", value);
        }

        if let Some(policy) = &self.permission_policy {
            downstream.set("Permissions-Policy", policy.to_header_value());
        }

        (upstream, downstream)
    }
}

/// Directives emitted when the policy header is enabled
const DEFAULT_POLICY_DIRECTIVES: [&str; 24] = [
    "accelerometer",
    "ambient-light-sensor",
    "autoplay",
    "battery",
    "camera",
    "display-capture",
    "document-domain",
    "encrypted-media",
    "fullscreen",
    "gamepad",
    "geolocation",
    "gyroscope",
    "hid",
    "idle-detection",
    "magnetometer",
    "microphone",
    "midi",
    "payment",
    "picture-in-picture",
    "publickey-credentials-get",
    "screen-wake-lock",
    "serial",
    "usb",
    "xr-spatial-tracking",
];

/// Permissions-Policy header; every directive defaults to `*`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionPolicy {
    pub directives: BTreeMap<String, Vec<String>>,
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self {
            directives: DEFAULT_POLICY_DIRECTIVES
                .iter()
                .map(|d| (d.to_string(), vec!["*".to_string()]))
                .collect(),
        }
    }
}

impl PermissionPolicy {
    pub fn to_header_value(&self) -> String {
        self.directives
            .iter()
            .map(|(name, allow)| {
                if allow.iter().any(|a| a == "*") {
                    format!("{name}=*")
                } else {
                    let list: Vec<String> = allow
                        .iter()
                        .map(|a| {
                            if a == "self" || a == "src" {
                                a.clone()
                            } else {
                                format!("\"{a}\"")
                            }
                        })
                        .collect();
                    format!("{name}=({})", list.join(" "))
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::HeaderRuleConfig;

    fn rules(hsts: u64) -> HeaderRewriteRules {
        HeaderRewriteRules::from_config(&HeaderRulesConfig {
            user_defined: vec![
                HeaderRuleConfig {
                    direction: HeaderDirection::Upstream,
                    key: "X-Env".to_string(),
                    value: "prod".to_string(),
                    remove: false,
                },
                HeaderRuleConfig {
                    direction: HeaderDirection::Downstream,
                    key: "X-Powered-By".to_string(),
                    value: String::new(),
                    remove: true,
                },
            ],
            hsts_max_age: hsts,
            ..Default::default()
        })
    }

    #[test]
    fn test_split_directions() {
        let (up, down) = rules(0).split("app.example.com", true);
        assert_eq!(up.set, vec![("X-Env".to_string(), "prod".to_string())]);
        assert_eq!(down.remove, vec!["X-Powered-By".to_string()]);
        assert!(down.set.is_empty());
    }

    #[test]
    fn test_hsts() {
        let (_, down) = rules(31536000).split("app.example.com", true);
        assert!(down
            .set
            .contains(&("Strict-Transport-Security".to_string(), "max-age=31536000".to_string())));

        let (_, down) = rules(600).split("*.example.com", true);
        assert!(down.set.contains(&(
            "Strict-Transport-Security".to_string(),
            "max-age=600; includeSubdomains".to_string()
        )));

        let (_, down) = rules(600).split("app.example.com", false);
        assert!(down.set.is_empty());
    }

    #[test]
    fn test_permission_policy_format() {
        let mut policy = PermissionPolicy {
            directives: BTreeMap::new(),
        };
        policy.directives.insert("camera".to_string(), vec![]);
        policy
            .directives
            .insert("geolocation".to_string(), vec!["self".to_string(), "https://maps.example.com".to_string()]);
        policy.directives.insert("usb".to_string(), vec!["*".to_string()]);

        assert_eq!(
            policy.to_header_value(),
            "camera=(), geolocation=(self \"https://maps.example.com\"), usb=*"
        );
    }

    #[test]
    fn test_permission_policy_defaults() {
        let value = PermissionPolicy::default().to_header_value();
        assert!(value.starts_with("accelerometer=*, "));
        assert!(value.contains("microphone=*"));
    }
}
