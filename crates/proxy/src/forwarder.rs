//! Forwarding plans
//!
//! The forwarder turns a matched endpoint into a [`ForwardPlan`]: which
//! upstream to dial, the rewritten request target, the Host header and the
//! header edits for both directions. Byte transport (including WebSocket
//! tunnelling) is left to Pingora; the forwarder only resolves the upstream
//! address and classifies transport failures.

use crate::endpoint::{PreparedEndpoint, Upstream};
use crate::headers::HeaderOps;
use crate::request::RequestInfo;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Internal header marking a request as a WebSocket upgrade
pub const ORIGIN_UPGRADE_HEADER: &str = "X-Origin-Upgrade";

/// Picks one of an endpoint's active upstreams
pub trait OriginPicker: Send + Sync {
    fn pick(&self, upstreams: &[Upstream], req: &RequestInfo) -> Option<usize>;
}

/// Rotates through upstreams in order
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl OriginPicker for RoundRobin {
    fn pick(&self, upstreams: &[Upstream], _req: &RequestInfo) -> Option<usize> {
        if upstreams.is_empty() {
            return None;
        }
        Some(self.next.fetch_add(1, Ordering::Relaxed) % upstreams.len())
    }
}

/// Statistics label for how a request was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardType {
    HostHttp,
    HostWebsocket,
    VdirHttp,
    VdirWebsocket,
    RootHttp,
    RootWebsocket,
    Redirect,
    RootRedirect,
    Blacklist,
    Whitelist,
    RateLimit,
    Captcha,
    BasicAuth,
    ForwardAuth,
    OAuth2,
    RoutingRule,
    Metrics,
    NotFound,
    Error,
}

impl ForwardType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardType::HostHttp => "host-http",
            ForwardType::HostWebsocket => "host-websocket",
            ForwardType::VdirHttp => "vdir-http",
            ForwardType::VdirWebsocket => "vdir-websocket",
            ForwardType::RootHttp => "root-http",
            ForwardType::RootWebsocket => "root-websocket",
            ForwardType::Redirect => "redirect",
            ForwardType::RootRedirect => "root-redirect",
            ForwardType::Blacklist => "blacklist",
            ForwardType::Whitelist => "whitelist",
            ForwardType::RateLimit => "ratelimit",
            ForwardType::Captcha => "captcha",
            ForwardType::BasicAuth => "basic-auth",
            ForwardType::ForwardAuth => "forward-auth",
            ForwardType::OAuth2 => "oauth2",
            ForwardType::RoutingRule => "routing-rule",
            ForwardType::Metrics => "metrics",
            ForwardType::NotFound => "notfound",
            ForwardType::Error => "error",
        }
    }

    fn websocket(self) -> Self {
        match self {
            ForwardType::HostHttp => ForwardType::HostWebsocket,
            ForwardType::VdirHttp => ForwardType::VdirWebsocket,
            ForwardType::RootHttp => ForwardType::RootWebsocket,
            other => other,
        }
    }
}

impl std::fmt::Display for ForwardType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to relay one request to its upstream
#[derive(Debug, Clone)]
pub struct ForwardPlan {
    /// Key of the endpoint that matched
    pub endpoint_key: String,
    pub upstream: Upstream,
    pub forward_type: ForwardType,
    /// Rewritten request target (path and query)
    pub path_and_query: String,
    /// Host header sent upstream
    pub host_header: String,
    /// `ws://` / `wss://` target for upgrade requests
    pub websocket_target: Option<String>,
    pub upstream_headers: HeaderOps,
    pub downstream_headers: HeaderOps,
    pub remove_hop_by_hop: bool,
}

impl ForwardPlan {
    pub fn is_websocket(&self) -> bool {
        self.websocket_target.is_some()
    }
}

/// Why a forward failed before a response arrived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    /// Upstream name did not resolve
    Dns,
    /// Any other dial or proxy failure
    Other,
}

impl TransportFailure {
    /// Status class recorded for statistics
    pub fn status(&self) -> u16 {
        match self {
            TransportFailure::Dns => 404,
            TransportFailure::Other => 521,
        }
    }
}

/// Builds forward plans and resolves upstream addresses
#[derive(Debug, Clone)]
pub struct Forwarder {
    server_id: String,
}

impl Forwarder {
    pub fn new(host_id: &str) -> Self {
        Self {
            server_id: format!("gatehouse-{host_id}"),
        }
    }

    /// Plan a forward to one of the endpoint's own upstreams
    pub fn plan_endpoint(
        &self,
        endpoint: &PreparedEndpoint,
        req: &RequestInfo,
        forward_type: ForwardType,
        auth_headers: HeaderOps,
    ) -> Option<ForwardPlan> {
        let idx = endpoint.picker().pick(endpoint.upstreams(), req)?;
        let upstream = endpoint.upstreams().get(idx)?.clone();
        Some(self.plan(endpoint, upstream, None, req, forward_type, auth_headers))
    }

    /// Plan a forward to `upstream`, stripping `strip_prefix` from the path
    pub fn plan(
        &self,
        endpoint: &PreparedEndpoint,
        upstream: Upstream,
        strip_prefix: Option<&str>,
        req: &RequestInfo,
        forward_type: ForwardType,
        auth_headers: HeaderOps,
    ) -> ForwardPlan {
        let path_and_query = match strip_prefix {
            Some(prefix) => rewrite_url(prefix, &req.uri),
            None => req.uri.clone(),
        };

        let rules = &endpoint.header_rewrite;
        let (mut upstream_headers, downstream_headers) =
            rules.split(&endpoint.root_or_matching_domain, req.is_tls);

        upstream_headers.set("X-Forwarded-Host", req.host.clone());
        upstream_headers.set("X-Forwarded-Server", self.server_id.clone());
        upstream_headers.extend(auth_headers);

        let host_header = match &rules.request_host_overwrite {
            Some(host) => host.clone(),
            None if upstream.tls && is_external_domain(&upstream.host) => upstream.domain(),
            None => req.host.clone(),
        };

        let websocket_target = req.is_websocket().then(|| {
            upstream_headers.set(ORIGIN_UPGRADE_HEADER, "websocket");
            websocket_url(&upstream, &path_and_query)
        });
        let forward_type = if websocket_target.is_some() {
            forward_type.websocket()
        } else {
            forward_type
        };

        debug!(
            upstream = %upstream.authority(),
            target = %path_and_query,
            forward_type = %forward_type,
            "Planned forward"
        );

        ForwardPlan {
            endpoint_key: endpoint.root_or_matching_domain.clone(),
            upstream,
            forward_type,
            path_and_query,
            host_header,
            websocket_target,
            upstream_headers,
            downstream_headers,
            remove_hop_by_hop: !rules.disable_hop_by_hop_removal,
        }
    }

    /// Resolve an upstream to a socket address, classifying failures
    pub async fn resolve(&self, upstream: &Upstream) -> Result<SocketAddr, TransportFailure> {
        let host = upstream.host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, upstream.port));
        }

        match tokio::net::lookup_host((host, upstream.port)).await {
            Ok(mut addrs) => addrs.next().ok_or(TransportFailure::Dns),
            Err(e) => {
                debug!(host = %host, error = %e, "Upstream name resolution failed");
                Err(TransportFailure::Dns)
            }
        }
    }
}

/// Strip a matched prefix (minus its trailing slash) from a request target
pub fn rewrite_url(prefix: &str, uri: &str) -> String {
    let prefix = prefix.strip_suffix('/').unwrap_or(prefix);
    let rest = uri.strip_prefix(prefix).unwrap_or(uri);
    let mut rewritten = rest.replace("//", "/");
    if !rewritten.starts_with('/') {
        rewritten.insert(0, '/');
    }
    rewritten
}

/// WebSocket target URL for an upstream
pub fn websocket_url(upstream: &Upstream, path_and_query: &str) -> String {
    let scheme = if upstream.tls { "wss" } else { "ws" };
    let path = path_and_query.strip_prefix('/').unwrap_or(path_and_query);
    format!("{scheme}://{}/{path}", upstream.domain())
}

fn is_external_domain(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.parse::<IpAddr>().is_err() && host != "localhost" && host.contains('.')
}
