//! Redirect table
//!
//! Rules are keyed by a `host/path` prefix (or a regular expression when the
//! table is built with regex matching) and answer the request with a
//! redirect before any endpoint lookup happens.

use crate::error::{ProxyError, Result};
use crate::request::RequestInfo;
use crate::response::GatewayResponse;
use config::RedirectConfig;
use http::StatusCode;
use parking_lot::RwLock;
use regex::Regex;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct RedirectRule {
    pub redirect_url: String,
    pub target_url: String,
    pub forward_child_path: bool,
    pub status_code: StatusCode,
    pattern: Option<Regex>,
}

impl RedirectRule {
    /// Redirect target for a request matched by this rule
    pub fn target_for(&self, req: &RequestInfo) -> String {
        let mut target = self.target_url.clone();

        if self.forward_child_path {
            if target.ends_with('/') {
                target.push_str(req.path.trim_start_matches('/'));
            } else {
                target.push_str(&req.path);
            }
            if let Some(query) = req.query.as_deref().filter(|q| !q.is_empty()) {
                target.push('?');
                target.push_str(query);
            }
        }

        if !target.starts_with("http://") && !target.starts_with("https://") {
            target.insert_str(0, "http://");
        }
        target
    }
}

#[derive(Debug, Default)]
pub struct RedirectTable {
    rules: RwLock<Vec<RedirectRule>>,
    allow_regex: bool,
}

impl RedirectTable {
    pub fn new(allow_regex: bool) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            allow_regex,
        }
    }

    pub fn from_config(rules: &[RedirectConfig], allow_regex: bool) -> Result<Self> {
        let table = Self::new(allow_regex);
        for rule in rules {
            table.add(
                &rule.redirect_url,
                &rule.target_url,
                rule.forward_child_path,
                rule.status_code,
            )?;
        }
        info!(rules = rules.len(), regex = allow_regex, "Redirect table loaded");
        Ok(table)
    }

    /// Add or replace the rule keyed by `redirect_url`
    pub fn add(&self, redirect_url: &str, target_url: &str, forward_child_path: bool, status_code: u16) -> Result<()> {
        let status_code = StatusCode::from_u16(status_code)
            .ok()
            .filter(StatusCode::is_redirection)
            .ok_or_else(|| ProxyError::Config(format!("invalid redirect status {status_code}")))?;
        let pattern = if self.allow_regex {
            Some(Regex::new(redirect_url)?)
        } else {
            None
        };

        let rule = RedirectRule {
            redirect_url: redirect_url.to_string(),
            target_url: target_url.to_string(),
            forward_child_path,
            status_code,
            pattern,
        };

        let mut rules = self.rules.write();
        rules.retain(|r| r.redirect_url != redirect_url);
        rules.push(rule);
        Ok(())
    }

    /// Swap in a new rule set. Nothing changes if any rule is invalid.
    pub fn replace_all(&self, rules: &[RedirectConfig]) -> Result<()> {
        let fresh = Self::from_config(rules, self.allow_regex)?;
        *self.rules.write() = fresh.rules.into_inner();
        Ok(())
    }

    /// Remove a rule; missing keys are ignored
    pub fn remove(&self, redirect_url: &str) {
        self.rules.write().retain(|r| r.redirect_url != redirect_url);
    }

    pub fn list(&self) -> Vec<RedirectRule> {
        self.rules.read().clone()
    }

    /// Rule with the longest key matching `host + path`
    pub fn find(&self, host_and_path: &str) -> Option<RedirectRule> {
        self.rules
            .read()
            .iter()
            .filter(|r| match &r.pattern {
                Some(re) => re.is_match(host_and_path),
                None => host_and_path.starts_with(&r.redirect_url),
            })
            .max_by_key(|r| r.redirect_url.len())
            .cloned()
    }

    pub fn check(&self, req: &RequestInfo) -> Option<GatewayResponse> {
        let requested = format!("{}{}", req.hostname(), req.path);
        let rule = self.find(&requested)?;
        let target = rule.target_for(req);
        debug!(from = %requested, to = %target, status = %rule.status_code, "Redirect rule matched");
        Some(GatewayResponse::redirect(rule.status_code, &target))
    }
}
