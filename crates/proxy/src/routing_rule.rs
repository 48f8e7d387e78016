//! Custom routing rules that take over requests before any other dispatch

use crate::error::{ProxyError, Result};
use crate::request::RequestInfo;
use crate::response::GatewayResponse;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;

/// Produces the full response for a request owned by a routing rule
#[async_trait]
pub trait RuleHandler: Send + Sync {
    async fn handle(&self, req: &RequestInfo) -> GatewayResponse;
}

pub type MatchPredicate = Arc<dyn Fn(&RequestInfo) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RoutingRule {
    pub id: String,
    pub matcher: MatchPredicate,
    pub handler: Arc<dyn RuleHandler>,
    pub enabled: bool,
    /// Run the access gate before handing the request to the handler
    pub use_system_access_control: bool,
}

impl RoutingRule {
    pub fn new<F>(id: impl Into<String>, matcher: F, handler: Arc<dyn RuleHandler>) -> Self
    where
        F: Fn(&RequestInfo) -> bool + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            matcher: Arc::new(matcher),
            handler,
            enabled: true,
            use_system_access_control: false,
        }
    }

    pub fn with_access_control(mut self, enabled: bool) -> Self {
        self.use_system_access_control = enabled;
        self
    }

    pub fn matches(&self, req: &RequestInfo) -> bool {
        self.enabled && (self.matcher)(req)
    }
}

impl std::fmt::Debug for RoutingRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingRule")
            .field("id", &self.id)
            .field("enabled", &self.enabled)
            .field("use_system_access_control", &self.use_system_access_control)
            .finish()
    }
}

/// Rules in registration order
#[derive(Debug, Default)]
pub struct RoutingRules {
    rules: RwLock<Vec<RoutingRule>>,
}

impl RoutingRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, rule: RoutingRule) -> Result<()> {
        let mut rules = self.rules.write();
        if rules.iter().any(|r| r.id == rule.id) {
            return Err(ProxyError::DuplicateRoutingRule(rule.id));
        }
        rules.push(rule);
        Ok(())
    }

    /// Remove a rule; missing IDs are ignored
    pub fn remove(&self, id: &str) {
        self.rules.write().retain(|r| r.id != id);
    }

    pub fn get(&self, id: &str) -> Result<RoutingRule> {
        self.rules
            .read()
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| ProxyError::RoutingRuleNotFound(id.to_string()))
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut rules = self.rules.write();
        let rule = rules
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| ProxyError::RoutingRuleNotFound(id.to_string()))?;
        rule.enabled = enabled;
        Ok(())
    }

    pub fn all(&self) -> Vec<RoutingRule> {
        self.rules.read().clone()
    }

    /// First enabled rule whose predicate matches. The rule is cloned out so
    /// no lock is held while its handler runs.
    pub fn matching(&self, req: &RequestInfo) -> Option<RoutingRule> {
        self.rules.read().iter().find(|r| r.matches(req)).cloned()
    }
}
