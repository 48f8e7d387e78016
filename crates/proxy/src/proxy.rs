//! Pingora integration
//!
//! `GatehouseProxy` adapts the transport-independent dispatcher to Pingora's
//! `ProxyHttp` hooks: the dispatch decision is made in `request_filter`, and
//! the later hooks carry out the resulting forward plan.

use crate::captcha::VERIFY_PATH;
use crate::dispatch::{Decision, Dispatcher};
use crate::forwarder::{ForwardPlan, ForwardType, TransportFailure};
use crate::headers::{HeaderOps, HOP_BY_HOP_HEADERS};
use crate::metrics::{forward_status, metrics, MetricsRegistry};
use crate::pages::Page;
use crate::request::RequestInfo;
use crate::response::GatewayResponse;
use async_trait::async_trait;
use bytes::BytesMut;
use http::{Method, StatusCode};
use pingora::prelude::*;
use pingora_core::ErrorSource;
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{FailToProxy, ProxyHttp, Session};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Largest CAPTCHA verification body that is read
const MAX_VERIFY_BODY: usize = 64 * 1024;

const PROXY_BY: &str = concat!("gatehouse/", env!("CARGO_PKG_VERSION"));

/// Per-request context
pub struct RequestCtx {
    pub plan: Option<ForwardPlan>,
    pub forward_type: Option<ForwardType>,
    pub failure: Option<TransportFailure>,
    pub drop_connection: bool,
    pub client_ip: Option<IpAddr>,
    pub is_tls: bool,
    in_flight: bool,
    pub request_start: Instant,
}

impl RequestCtx {
    pub fn new() -> Self {
        Self {
            plan: None,
            forward_type: None,
            failure: None,
            drop_connection: false,
            client_ip: None,
            is_tls: false,
            in_flight: false,
            request_start: Instant::now(),
        }
    }
}

impl Default for RequestCtx {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct GatehouseProxy {
    dispatcher: Arc<Dispatcher>,
    metrics_path: Option<String>,
}

impl GatehouseProxy {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            metrics_path: None,
        }
    }

    /// Serve the Prometheus export on `path` for every host
    pub fn with_metrics_path(mut self, path: Option<String>) -> Self {
        self.metrics_path = path.filter(|p| p.starts_with('/'));
        self
    }

    fn is_metrics_request(&self, req: &RequestInfo) -> bool {
        req.method == Method::GET && self.metrics_path.as_deref() == Some(req.path.as_str())
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Whether this request must have its body buffered before dispatch
    fn wants_body(&self, req: &RequestInfo) -> bool {
        req.method == Method::POST
            && req.path == VERIFY_PATH
            && self
                .dispatcher
                .registry()
                .find_host(&req.hostname())
                .is_some_and(|endpoint| endpoint.captcha.is_some())
    }

    async fn write_response(&self, session: &mut Session, response: &GatewayResponse) -> Result<()> {
        let header = response_header(response)?;
        session.write_response_header(Box::new(header), false).await?;
        session
            .write_response_body(Some(response.body.clone()), true)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ProxyHttp for GatehouseProxy {
    type CTX = RequestCtx;

    fn new_ctx(&self) -> Self::CTX {
        RequestCtx::new()
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        metrics().active_requests.inc();
        ctx.in_flight = true;

        let remote_addr = session
            .client_addr()
            .and_then(|a| a.as_inet())
            .map(|a| a.ip());
        let is_tls = session
            .digest()
            .and_then(|d| d.ssl_digest.as_ref())
            .is_some();
        let mut req = request_info(session.req_header(), remote_addr, is_tls);
        ctx.client_ip = req.client_ip();
        ctx.is_tls = is_tls;

        if self.is_metrics_request(&req) {
            ctx.forward_type = Some(ForwardType::Metrics);
            self.write_response(session, &metrics_response(metrics())).await?;
            return Ok(true);
        }

        if self.wants_body(&req) {
            let mut body = BytesMut::new();
            while let Some(chunk) = session.read_request_body().await? {
                if body.len() + chunk.len() > MAX_VERIFY_BODY {
                    warn!(host = %req.host, "CAPTCHA verification body too large");
                    let response = GatewayResponse::text(StatusCode::PAYLOAD_TOO_LARGE, "413 - Payload Too Large");
                    ctx.forward_type = Some(ForwardType::Captcha);
                    self.write_response(session, &response).await?;
                    return Ok(true);
                }
                body.extend_from_slice(&chunk);
            }
            req.body = Some(body.freeze());
        }

        match self.dispatcher.dispatch(&req).await {
            Decision::Respond { response, forward_type } => {
                ctx.forward_type = Some(forward_type);
                self.write_response(session, &response).await?;
                Ok(true)
            }
            Decision::Forward(plan) => {
                ctx.forward_type = Some(plan.forward_type);
                ctx.plan = Some(plan);
                Ok(false)
            }
            Decision::Drop => {
                debug!(host = %req.host, "Closing connection without a response");
                ctx.drop_connection = true;
                ctx.forward_type = Some(ForwardType::NotFound);
                Err(Error::explain(ErrorType::ConnectionClosed, "default site configured for no response"))
            }
        }
    }

    async fn upstream_peer(&self, _session: &mut Session, ctx: &mut Self::CTX) -> Result<Box<HttpPeer>> {
        let Some(plan) = ctx.plan.as_ref() else {
            return Err(Error::explain(ErrorType::InternalError, "no forward plan for request"));
        };
        let upstream = &plan.upstream;

        let addr = match self.dispatcher.forwarder().resolve(upstream).await {
            Ok(addr) => addr,
            Err(failure) => {
                ctx.failure = Some(failure);
                return Err(Error::explain(
                    ErrorType::ConnectNoRoute,
                    format!("could not resolve upstream {}", upstream.host),
                ));
            }
        };

        let mut peer = HttpPeer::new(addr, upstream.tls, upstream.sni.clone());
        if upstream.tls && !upstream.verify_cert {
            peer.options.verify_cert = false;
            peer.options.verify_hostname = false;
        }

        debug!(upstream = %upstream.authority(), addr = %addr, tls = upstream.tls, "Connecting to upstream");
        Ok(Box::new(peer))
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let Some(plan) = ctx.plan.as_ref() else {
            return Ok(());
        };

        let uri = plan
            .path_and_query
            .parse::<http::Uri>()
            .map_err(|e| Error::because(ErrorType::InvalidHTTPHeader, "rewritten request target", e))?;
        upstream_request.set_uri(uri);
        upstream_request.insert_header(http::header::HOST, plan.host_header.as_str())?;

        if plan.remove_hop_by_hop && !plan.is_websocket() {
            for name in HOP_BY_HOP_HEADERS {
                upstream_request.remove_header(name);
            }
        }

        if let Some(ip) = ctx.client_ip {
            let ip = ip.to_string();
            let forwarded_for = match upstream_request
                .headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
            {
                Some(existing) => format!("{existing}, {ip}"),
                None => ip.clone(),
            };
            upstream_request.insert_header("X-Forwarded-For", forwarded_for)?;
            upstream_request.insert_header("X-Real-IP", ip)?;
        }
        let proto = if ctx.is_tls { "https" } else { "http" };
        upstream_request.insert_header("X-Forwarded-Proto", proto)?;

        apply_request_ops(upstream_request, &plan.upstream_headers)?;
        Ok(())
    }

    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        if let Some(plan) = ctx.plan.as_ref() {
            apply_response_ops(upstream_response, &plan.downstream_headers)?;
        }
        upstream_response.insert_header("X-Proxy-By", PROXY_BY)?;
        Ok(())
    }

    async fn fail_to_proxy(&self, session: &mut Session, e: &Error, ctx: &mut Self::CTX) -> FailToProxy
    where
        Self::CTX: Send + Sync,
    {
        if ctx.drop_connection {
            return FailToProxy {
                error_code: 0,
                can_reuse_downstream: false,
            };
        }

        if session.response_written().is_some() {
            warn!(error = %e, "Proxy failed after the response started");
            return FailToProxy {
                error_code: 0,
                can_reuse_downstream: false,
            };
        }

        let response = if ctx.plan.is_some() {
            let failure = *ctx.failure.get_or_insert(TransportFailure::Other);
            let pages = self.dispatcher.pages();
            match failure {
                TransportFailure::Dns => {
                    warn!(error = %e, "Upstream host not found");
                    pages.render(Page::HostError, StatusCode::NOT_FOUND)
                }
                TransportFailure::Other => {
                    warn!(error = %e, "Upstream transport failed");
                    pages.render(Page::ProxyError, StatusCode::from_u16(521).unwrap_or(StatusCode::BAD_GATEWAY))
                }
            }
        } else {
            match e.esource() {
                ErrorSource::Downstream => {
                    debug!(error = %e, "Downstream error");
                    return FailToProxy {
                        error_code: 0,
                        can_reuse_downstream: false,
                    };
                }
                _ => {
                    error!(error = %e, "Request handling failed");
                    crate::auth::internal_error()
                }
            }
        };

        let code = response.status.as_u16();
        if let Err(write_err) = self.write_response(session, &response).await {
            debug!(error = %write_err, "Failed to write error response");
        }
        FailToProxy {
            error_code: code,
            can_reuse_downstream: false,
        }
    }

    async fn logging(&self, session: &mut Session, _e: Option<&Error>, ctx: &mut Self::CTX) {
        if ctx.in_flight {
            metrics().active_requests.dec();
        }
        metrics()
            .captcha_sessions
            .set(self.dispatcher.captcha().session_count() as u64);

        let forward_type = ctx.forward_type.unwrap_or(ForwardType::Error);
        let written = session.response_written().map(|r| r.status.as_u16());
        let status = if ctx.plan.is_some() {
            forward_status(ctx.failure)
        } else {
            written.unwrap_or(0)
        };

        let endpoint = endpoint_label(ctx);
        let req = session.req_header();
        let host = req
            .headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|h| crate::request::strip_port(h).to_lowercase())
            .unwrap_or_default();
        let elapsed = ctx.request_start.elapsed();
        metrics().record(endpoint, forward_type, status, elapsed);

        info!(
            method = %req.method,
            host = %host,
            path = %req.uri.path(),
            status = written.unwrap_or(status),
            forward_type = %forward_type,
            client = ?ctx.client_ip,
            duration_ms = elapsed.as_millis() as u64,
            "Request completed"
        );
    }
}

/// Matched endpoint key for statistics; `None` when nothing matched
fn endpoint_label(ctx: &RequestCtx) -> Option<&str> {
    ctx.plan.as_ref().map(|plan| plan.endpoint_key.as_str())
}

/// Prometheus text export of `registry`
pub fn metrics_response(registry: &MetricsRegistry) -> GatewayResponse {
    GatewayResponse::new(StatusCode::OK)
        .with_header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
        .with_body(registry.export())
}

/// Snapshot a Pingora request header into a [`RequestInfo`]
pub fn request_info(header: &RequestHeader, remote_addr: Option<IpAddr>, is_tls: bool) -> RequestInfo {
    let host = header
        .headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| header.uri.authority().map(|a| a.to_string()))
        .unwrap_or_default();
    let target = header
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut req = RequestInfo::new(header.method.clone(), &host, target).with_tls(is_tls);
    req.headers = header.headers.clone();
    req.remote_addr = remote_addr;
    req
}

/// Response header for a gateway-generated response
pub fn response_header(response: &GatewayResponse) -> Result<ResponseHeader> {
    let mut header = ResponseHeader::build(response.status, Some(response.headers.len() + 2))?;
    for (name, value) in &response.headers {
        header.append_header(name.clone(), value.as_str())?;
    }
    header.insert_header(http::header::CONTENT_LENGTH, response.body.len().to_string())?;
    header.insert_header("X-Proxy-By", PROXY_BY)?;
    Ok(header)
}

fn apply_request_ops(header: &mut RequestHeader, ops: &HeaderOps) -> Result<()> {
    for name in &ops.remove {
        header.remove_header(name.as_str());
    }
    for (name, value) in &ops.set {
        header.insert_header(name.clone(), value.as_str())?;
    }
    Ok(())
}

fn apply_response_ops(header: &mut ResponseHeader, ops: &HeaderOps) -> Result<()> {
    for name in &ops.remove {
        header.remove_header(name.as_str());
    }
    for (name, value) in &ops.set {
        header.insert_header(name.clone(), value.as_str())?;
    }
    Ok(())
}
