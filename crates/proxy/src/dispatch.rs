//! Request dispatch pipeline
//!
//! Every request walks the same ordered steps and stops at the first one that
//! produces a decision:
//!
//! 1. routing rules (optionally behind the access gate)
//! 2. access gate
//! 3. redirect table
//! 4. host endpoints, with their rate limit, CAPTCHA and auth gates and
//!    nested virtual directories
//! 5. global virtual directories
//! 6. the root router

use crate::access::{AccessGate, BlockReason};
use crate::auth::{AuthGate, AuthOutcome};
use crate::captcha::CaptchaGate;
use crate::endpoint::{PreparedEndpoint, ProxyEndpoint, ProxyType};
use crate::error::Result;
use crate::forwarder::{ForwardPlan, ForwardType, Forwarder};
use crate::headers::HeaderOps;
use crate::pages::{Page, Pages};
use crate::rate_limit::{RateLimitResult, RateLimiter};
use crate::redirect::RedirectTable;
use crate::registry::{EndpointRegistry, VdirMatch};
use crate::request::RequestInfo;
use crate::response::GatewayResponse;
use crate::root::RootRouter;
use crate::routing_rule::RoutingRules;
use crate::tld::TldMap;
use config::Config;
use http::StatusCode;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of dispatching one request
#[derive(Debug)]
pub enum Decision {
    /// Answer the client directly
    Respond {
        response: GatewayResponse,
        forward_type: ForwardType,
    },
    /// Relay to an upstream
    Forward(ForwardPlan),
    /// Close the connection without a response
    Drop,
}

impl Decision {
    pub fn respond(response: GatewayResponse, forward_type: ForwardType) -> Self {
        Decision::Respond { response, forward_type }
    }

    pub fn forward_type(&self) -> ForwardType {
        match self {
            Decision::Respond { forward_type, .. } => *forward_type,
            Decision::Forward(plan) => plan.forward_type,
            Decision::Drop => ForwardType::NotFound,
        }
    }
}

/// Header edits granted by the endpoint gates
type Granted = std::result::Result<(HeaderOps, Vec<(String, String)>), Decision>;

pub struct Dispatcher {
    registry: Arc<EndpointRegistry>,
    rules: Arc<RoutingRules>,
    access: RwLock<Arc<AccessGate>>,
    redirects: RedirectTable,
    rate_limiter: RateLimiter,
    captcha: Arc<CaptchaGate>,
    auth: AuthGate,
    forwarder: Forwarder,
    root: RootRouter,
    pages: Pages,
}

impl Dispatcher {
    pub fn new(registry: Arc<EndpointRegistry>, forwarder: Forwarder, auth: AuthGate, captcha: CaptchaGate) -> Self {
        Self {
            registry,
            rules: Arc::new(RoutingRules::new()),
            access: RwLock::new(Arc::new(AccessGate::from_config(&Default::default()))),
            redirects: RedirectTable::default(),
            rate_limiter: RateLimiter::new(Duration::from_secs(1)),
            captcha: Arc::new(captcha),
            auth,
            forwarder,
            root: RootRouter::default(),
            pages: Pages::default(),
        }
    }

    pub fn with_access(self, access: AccessGate) -> Self {
        *self.access.write() = Arc::new(access);
        self
    }

    pub fn with_redirects(mut self, redirects: RedirectTable) -> Self {
        self.redirects = redirects;
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub fn with_root_router(mut self, root: RootRouter) -> Self {
        self.root = root;
        self
    }

    pub fn with_pages(mut self, pages: Pages) -> Self {
        self.pages = pages;
        self
    }

    /// Build the complete pipeline from a validated configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let tld = match &config.global.tld_file {
            Some(path) => TldMap::from_file(path)?,
            None => TldMap::builtin(),
        };
        info!(suffixes = tld.len(), "TLD map loaded");

        let registry = Arc::new(EndpointRegistry::new(tld));
        load_endpoints(&registry, config)?;

        let timeout = Duration::from_secs(config.global.provider_timeout_secs);
        let dispatcher = Self::new(
            registry,
            Forwarder::new(&config.global.host_id),
            AuthGate::from_config(&config.providers, timeout)?,
            CaptchaGate::new(timeout)?,
        )
        .with_access(AccessGate::from_config(&config.access))
        .with_redirects(RedirectTable::from_config(&config.redirects, config.global.redirect_regex)?)
        .with_rate_limiter(RateLimiter::new(Duration::from_secs(config.global.rate_limit_window_secs)))
        .with_root_router(RootRouter::load(&config.global.root_options_file)?)
        .with_pages(Pages::new(Some(&config.global.template_dir)));

        Ok(dispatcher)
    }

    /// Apply a changed configuration: endpoints, redirects and access lists.
    /// Provider settings only take effect on restart.
    pub fn reload(&self, config: &Config) -> Result<()> {
        load_endpoints(&self.registry, config)?;
        self.redirects.replace_all(&config.redirects)?;
        *self.access.write() = Arc::new(AccessGate::from_config(&config.access));
        info!(
            endpoints = config.endpoints.len(),
            redirects = config.redirects.len(),
            "Configuration reloaded"
        );
        Ok(())
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn rules(&self) -> &Arc<RoutingRules> {
        &self.rules
    }

    pub fn redirects(&self) -> &RedirectTable {
        &self.redirects
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn captcha(&self) -> &Arc<CaptchaGate> {
        &self.captcha
    }

    pub fn root_router(&self) -> &RootRouter {
        &self.root
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    pub fn pages(&self) -> &Pages {
        &self.pages
    }

    pub async fn dispatch(&self, req: &RequestInfo) -> Decision {
        if let Some(rule) = self.rules.matching(req) {
            if rule.use_system_access_control {
                if let Some(blocked) = self.check_access(req) {
                    return blocked;
                }
            }
            debug!(rule = %rule.id, path = %req.path, "Routing rule matched");
            let response = rule.handler.handle(req).await;
            return Decision::respond(response, ForwardType::RoutingRule);
        }

        if let Some(blocked) = self.check_access(req) {
            return blocked;
        }

        if let Some(response) = self.redirects.check(req) {
            return Decision::respond(response, ForwardType::Redirect);
        }

        let hostname = req.hostname();
        if let Some(endpoint) = self.registry.find_host(&hostname) {
            return self.dispatch_host(&endpoint, req).await;
        }

        match self.registry.find_vdir(&req.path) {
            Some(VdirMatch::Endpoint(endpoint)) => return self.dispatch_vdir(&endpoint, req).await,
            Some(VdirMatch::TrailingSlashRedirect) => return trailing_slash_redirect(req),
            None => {}
        }

        let root = self.registry.root();
        self.root
            .route(req, root.as_deref(), self.registry.tld(), &self.forwarder, &self.pages)
    }

    fn check_access(&self, req: &RequestInfo) -> Option<Decision> {
        let ip = req.client_ip();
        let access = self.access.read().clone();
        let (blocked, reason) = access.blocked(ip);
        if !blocked {
            return None;
        }

        let reason = reason.unwrap_or(BlockReason::Blacklist);
        warn!(
            ip = ?ip,
            host = %req.host,
            reason = %reason.as_str(),
            "Request blocked by access rules"
        );
        let (page, forward_type) = match reason {
            BlockReason::Blacklist => (Page::Blacklist, ForwardType::Blacklist),
            BlockReason::Whitelist => (Page::Whitelist, ForwardType::Whitelist),
        };
        Some(Decision::respond(
            self.pages.render(page, StatusCode::FORBIDDEN),
            forward_type,
        ))
    }

    /// Rate limit, then CAPTCHA, then the endpoint's auth method
    async fn run_gates(&self, endpoint: &PreparedEndpoint, req: &RequestInfo) -> Granted {
        if endpoint.rate_limit > 0 {
            if let Some(ip) = req.peer_ip() {
                if let RateLimitResult::Denied { retry_after_secs } =
                    self.rate_limiter.check(ip, endpoint.rate_limit)
                {
                    warn!(ip = %ip, host = %req.host, limit = endpoint.rate_limit, "Rate limit exceeded");
                    return Err(Decision::respond(
                        GatewayResponse::text(StatusCode::TOO_MANY_REQUESTS, "429 - Too Many Requests")
                            .with_header("Retry-After", retry_after_secs.to_string()),
                        ForwardType::RateLimit,
                    ));
                }
            }
        }

        if let Some(settings) = &endpoint.captcha {
            if let Some(response) = self.captcha.check(settings, req).await {
                return Err(Decision::respond(response, ForwardType::Captcha));
            }
        }

        match self.auth.check(&endpoint.auth, req).await {
            AuthOutcome::Allowed { upstream, downstream } => Ok((upstream, downstream)),
            AuthOutcome::Respond(response) => {
                debug!(host = %req.host, status = %response.status, "Request stopped by auth gate");
                Err(Decision::respond(response, endpoint.auth.forward_type()))
            }
        }
    }

    async fn dispatch_host(&self, endpoint: &PreparedEndpoint, req: &RequestInfo) -> Decision {
        let (upstream_ops, client_headers) = match self.run_gates(endpoint, req).await {
            Ok(granted) => granted,
            Err(decision) => return decision,
        };

        let plan = if let Some(vdir) = endpoint.match_vdir(&req.path) {
            Some(self.forwarder.plan(
                endpoint,
                vdir.upstream.clone(),
                Some(&vdir.matching_path),
                req,
                ForwardType::VdirHttp,
                upstream_ops,
            ))
        } else if !req.path.ends_with('/') && endpoint.match_vdir(&format!("{}/", req.path)).is_some() {
            return trailing_slash_redirect(req);
        } else {
            self.forwarder
                .plan_endpoint(endpoint, req, ForwardType::HostHttp, upstream_ops)
        };

        finish(plan, client_headers, req)
    }

    async fn dispatch_vdir(&self, endpoint: &PreparedEndpoint, req: &RequestInfo) -> Decision {
        let (upstream_ops, client_headers) = match self.run_gates(endpoint, req).await {
            Ok(granted) => granted,
            Err(decision) => return decision,
        };

        let upstream = endpoint
            .picker()
            .pick(endpoint.upstreams(), req)
            .and_then(|idx| endpoint.upstreams().get(idx).cloned());
        let plan = upstream.map(|upstream| {
            self.forwarder.plan(
                endpoint,
                upstream,
                Some(&endpoint.root_or_matching_domain),
                req,
                ForwardType::VdirHttp,
                upstream_ops,
            )
        });

        finish(plan, client_headers, req)
    }
}

fn finish(plan: Option<ForwardPlan>, client_headers: Vec<(String, String)>, req: &RequestInfo) -> Decision {
    match plan {
        Some(mut plan) => {
            for (name, value) in client_headers {
                plan.downstream_headers.set(name, value);
            }
            Decision::Forward(plan)
        }
        None => {
            warn!(host = %req.host, path = %req.path, "Endpoint has no active origin");
            Decision::respond(
                GatewayResponse::text(StatusCode::BAD_GATEWAY, "502 - Bad Gateway"),
                ForwardType::Error,
            )
        }
    }
}

fn trailing_slash_redirect(req: &RequestInfo) -> Decision {
    let mut location = format!("{}/", req.path);
    if let Some(query) = &req.query {
        location.push('?');
        location.push_str(query);
    }
    Decision::respond(
        GatewayResponse::redirect(StatusCode::TEMPORARY_REDIRECT, &location),
        ForwardType::Redirect,
    )
}

/// Rebuild the registry from `config`. Every endpoint is prepared before any
/// is stored, so a bad entry leaves the running tables untouched.
pub fn load_endpoints(registry: &EndpointRegistry, config: &Config) -> Result<()> {
    let prepared = config
        .endpoints
        .iter()
        .map(|c| registry.prepare(ProxyEndpoint::from_config(c)))
        .collect::<Result<Vec<_>>>()?;
    let root = config
        .root
        .as_ref()
        .map(|c| registry.prepare(ProxyEndpoint::from_root_config(c)))
        .transpose()?;

    let mut keep: HashSet<(ProxyType, String)> = HashSet::new();
    for endpoint in &prepared {
        keep.insert((endpoint.proxy_type, endpoint.root_or_matching_domain.clone()));
    }
    for proxy_type in [ProxyType::Subdomain, ProxyType::VirtualDirectory] {
        for (key, _) in registry.range(proxy_type) {
            if !keep.contains(&(proxy_type, key.clone())) {
                registry.delete(proxy_type, &key);
            }
        }
    }

    for endpoint in prepared {
        registry.store(endpoint)?;
    }
    match root {
        Some(root) => {
            registry.store(root)?;
        }
        None => registry.delete(ProxyType::Root, "/"),
    }

    info!(
        hosts = registry.range(ProxyType::Subdomain).len(),
        vdirs = registry.range(ProxyType::VirtualDirectory).len(),
        root = registry.root().is_some(),
        "Endpoints loaded"
    );
    Ok(())
}
