//! Root router
//!
//! Handles requests that matched no routing rule, host or virtual directory.
//! It either redirects unmatched hosts (to an explicit target or to the
//! host's registrable domain) or serves the root endpoint's default site.

use crate::dispatch::Decision;
use crate::endpoint::{DefaultSiteOption, PreparedEndpoint};
use crate::error::{ProxyError, Result};
use crate::forwarder::{ForwardType, Forwarder};
use crate::headers::HeaderOps;
use crate::pages::{Page, Pages};
use crate::request::RequestInfo;
use crate::response::GatewayResponse;
use crate::tld::TldMap;
use config::RootRoutingOptions;
use http::StatusCode;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// What to do with a request nothing else claimed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootAction {
    ForwardRoot,
    Redirect(String),
}

#[derive(Debug, Default)]
pub struct RootRouter {
    options: RwLock<RootRoutingOptions>,
    path: Option<PathBuf>,
}

impl RootRouter {
    pub fn new(options: RootRoutingOptions) -> Self {
        Self {
            options: RwLock::new(options),
            path: None,
        }
    }

    /// Load options from `path`, creating the file with defaults if absent
    pub fn load(path: &Path) -> Result<Self> {
        let options = RootRoutingOptions::load_or_create(path).map_err(|e| ProxyError::Config(e.to_string()))?;
        info!(
            path = ?path,
            redirect_unset = options.enable_redirect_for_unset_rules,
            "Root routing options loaded"
        );
        Ok(Self {
            options: RwLock::new(options),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn options(&self) -> RootRoutingOptions {
        self.options.read().clone()
    }

    /// Replace the options, persisting them when backed by a file
    pub fn update(&self, options: RootRoutingOptions) -> Result<()> {
        if let Some(path) = &self.path {
            options.save(path).map_err(|e| ProxyError::Config(e.to_string()))?;
        }
        *self.options.write() = options;
        Ok(())
    }

    /// Decide between forwarding to root and redirecting for `hostname`
    pub fn decide(&self, hostname: &str, tld: &TldMap) -> RootAction {
        let options = self.options.read();
        if !options.enable_redirect_for_unset_rules {
            return RootAction::ForwardRoot;
        }

        let target = options.unset_rule_redirect_target.trim();
        if target.is_empty() {
            return match tld.top_level_domain(hostname) {
                Some(top) if top != hostname => RootAction::Redirect(format!("//{top}")),
                _ => RootAction::ForwardRoot,
            };
        }

        if target_hostname(target).is_some_and(|h| h.eq_ignore_ascii_case(hostname)) {
            debug!(host = %hostname, target = %target, "Redirect target is the requested host");
            return RootAction::ForwardRoot;
        }
        RootAction::Redirect(target.to_string())
    }

    /// Full root handling: the redirect decision, then the default site
    pub fn route(
        &self,
        req: &RequestInfo,
        root: Option<&PreparedEndpoint>,
        tld: &TldMap,
        forwarder: &Forwarder,
        pages: &Pages,
    ) -> Decision {
        let hostname = req.hostname();
        match self.decide(&hostname, tld) {
            RootAction::Redirect(target) => {
                debug!(host = %hostname, target = %target, "Redirecting unmatched host");
                Decision::respond(
                    GatewayResponse::redirect(StatusCode::TEMPORARY_REDIRECT, &target),
                    ForwardType::RootRedirect,
                )
            }
            RootAction::ForwardRoot => match root {
                Some(root) => serve_default_site(root, req, forwarder),
                None => Decision::respond(pages.render(Page::NotFound, StatusCode::NOT_FOUND), ForwardType::NotFound),
            },
        }
    }
}

/// Serve a request through the root endpoint's default site option
pub fn serve_default_site(root: &PreparedEndpoint, req: &RequestInfo, forwarder: &Forwarder) -> Decision {
    match root.default_site {
        DefaultSiteOption::InternalStaticWebServer | DefaultSiteOption::ReverseProxy => {
            if let Some(vdir) = root.match_vdir(&req.path) {
                return Decision::Forward(forwarder.plan(
                    root,
                    vdir.upstream.clone(),
                    Some(&vdir.matching_path),
                    req,
                    ForwardType::VdirHttp,
                    HeaderOps::default(),
                ));
            }

            match forwarder.plan_endpoint(root, req, ForwardType::RootHttp, HeaderOps::default()) {
                Some(plan) => Decision::Forward(plan),
                None => {
                    warn!(host = %req.host, "Root endpoint has no active origin");
                    Decision::respond(
                        GatewayResponse::text(StatusCode::BAD_GATEWAY, "502 - Bad Gateway"),
                        ForwardType::Error,
                    )
                }
            }
        }
        DefaultSiteOption::Redirect => {
            let value = root.default_site_value.trim();
            let target = if value.is_empty() { "about:blank" } else { value };

            let hostname = req.hostname();
            match url::Url::parse(target) {
                Ok(url) if url.host_str().is_some_and(|h| h.eq_ignore_ascii_case(&hostname)) => {
                    warn!(host = %hostname, target = %target, "Default site redirect points back at itself");
                    Decision::respond(
                        GatewayResponse::text(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "Loopback redirects due to invalid settings",
                        ),
                        ForwardType::RootRedirect,
                    )
                }
                Ok(_) => Decision::respond(
                    GatewayResponse::redirect(StatusCode::TEMPORARY_REDIRECT, target),
                    ForwardType::RootRedirect,
                ),
                Err(e) => {
                    debug!(target = %target, error = %e, "Unparsable default site target, forwarding to root");
                    match forwarder.plan_endpoint(root, req, ForwardType::RootHttp, HeaderOps::default()) {
                        Some(plan) => Decision::Forward(plan),
                        None => Decision::respond(
                            GatewayResponse::text(StatusCode::NOT_FOUND, "404 - Not Found"),
                            ForwardType::NotFound,
                        ),
                    }
                }
            }
        }
        DefaultSiteOption::NotFoundPage => Decision::respond(
            GatewayResponse::text(StatusCode::NOT_FOUND, "404 page not found"),
            ForwardType::NotFound,
        ),
        DefaultSiteOption::NoResponse => Decision::Drop,
    }
}

/// Hostname of a redirect target given as a URL, `//host` or a bare host
fn target_hostname(target: &str) -> Option<String> {
    let candidate = if target.starts_with("//") {
        format!("http:{target}")
    } else if target.contains("://") {
        target.to_string()
    } else {
        format!("http://{target}")
    };
    url::Url::parse(&candidate)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Origin, ProxyEndpoint, ProxyType, VirtualDirectory};
    use http::Method;
    use tempfile::TempDir;

    fn router(enabled: bool, target: &str) -> RootRouter {
        RootRouter::new(RootRoutingOptions {
            enable_redirect_for_unset_rules: enabled,
            unset_rule_redirect_target: target.to_string(),
        })
    }

    fn root(option: DefaultSiteOption, value: &str) -> PreparedEndpoint {
        let mut endpoint = ProxyEndpoint::new(ProxyType::Root, "/", vec![Origin::new("127.0.0.1:8000", false)]);
        endpoint.default_site = option;
        endpoint.default_site_value = value.to_string();
        endpoint.virtual_directories.push(VirtualDirectory {
            matching_path: "/static/".to_string(),
            origin: Origin::new("127.0.0.1:9000", false),
            disabled: false,
        });
        PreparedEndpoint::prepare(endpoint).unwrap()
    }

    #[test]
    fn test_disabled_forwards_to_root() {
        let tld = TldMap::builtin();
        assert_eq!(router(false, "").decide("a.b.example.co.uk", &tld), RootAction::ForwardRoot);
    }

    #[test]
    fn test_tld_redirect() {
        let tld = TldMap::from_suffixes(["uk", "co.uk"]);
        let router = router(true, "");
        assert_eq!(
            router.decide("a.b.example.co.uk", &tld),
            RootAction::Redirect("//example.co.uk".to_string())
        );
        // Already top level
        assert_eq!(router.decide("example.co.uk", &tld), RootAction::ForwardRoot);
        assert_eq!(router.decide("localhost", &tld), RootAction::ForwardRoot);
    }

    #[test]
    fn test_explicit_target_loop_avoided() {
        let tld = TldMap::builtin();
        let explicit = router(true, "https://portal.example.com/welcome");
        assert_eq!(
            explicit.decide("unknown.example.com", &tld),
            RootAction::Redirect("https://portal.example.com/welcome".to_string())
        );
        assert_eq!(explicit.decide("portal.example.com", &tld), RootAction::ForwardRoot);

        let relative = router(true, "//portal.example.com");
        assert_eq!(relative.decide("portal.example.com", &tld), RootAction::ForwardRoot);
    }

    #[test]
    fn test_default_site_reverse_proxy() {
        let forwarder = Forwarder::new("test");
        let root = root(DefaultSiteOption::ReverseProxy, "");

        let req = RequestInfo::new(Method::GET, "anything.test", "/static/app.js");
        match serve_default_site(&root, &req, &forwarder) {
            Decision::Forward(plan) => {
                assert_eq!(plan.upstream.port, 9000);
                assert_eq!(plan.path_and_query, "/app.js");
                assert_eq!(plan.forward_type, ForwardType::VdirHttp);
            }
            other => panic!("unexpected decision {other:?}"),
        }

        let req = RequestInfo::new(Method::GET, "anything.test", "/index.html");
        match serve_default_site(&root, &req, &forwarder) {
            Decision::Forward(plan) => {
                assert_eq!(plan.upstream.port, 8000);
                assert_eq!(plan.forward_type, ForwardType::RootHttp);
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn test_default_site_redirect_and_loopback() {
        let forwarder = Forwarder::new("test");
        let req = RequestInfo::new(Method::GET, "gateway.test", "/");

        let root_redirect = root(DefaultSiteOption::Redirect, "https://landing.test/");
        match serve_default_site(&root_redirect, &req, &forwarder) {
            Decision::Respond { response, .. } => {
                assert_eq!(response.status, StatusCode::TEMPORARY_REDIRECT);
                assert_eq!(response.location(), Some("https://landing.test/"));
            }
            other => panic!("unexpected decision {other:?}"),
        }

        let looping = root(DefaultSiteOption::Redirect, "https://gateway.test/home");
        match serve_default_site(&looping, &req, &forwarder) {
            Decision::Respond { response, .. } => {
                assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(&response.body[..], b"Loopback redirects due to invalid settings");
            }
            other => panic!("unexpected decision {other:?}"),
        }

        let blank = root(DefaultSiteOption::Redirect, "");
        match serve_default_site(&blank, &req, &forwarder) {
            Decision::Respond { response, .. } => assert_eq!(response.location(), Some("about:blank")),
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn test_default_site_not_found_and_drop() {
        let forwarder = Forwarder::new("test");
        let req = RequestInfo::new(Method::GET, "gateway.test", "/");

        match serve_default_site(&root(DefaultSiteOption::NotFoundPage, ""), &req, &forwarder) {
            Decision::Respond { response, forward_type } => {
                assert_eq!(response.status, StatusCode::NOT_FOUND);
                assert_eq!(forward_type, ForwardType::NotFound);
            }
            other => panic!("unexpected decision {other:?}"),
        }
        assert!(matches!(
            serve_default_site(&root(DefaultSiteOption::NoResponse, ""), &req, &forwarder),
            Decision::Drop
        ));
    }

    #[test]
    fn test_no_root_endpoint_is_404() {
        let req = RequestInfo::new(Method::GET, "gateway.test", "/");
        let decision = router(false, "").route(&req, None, &TldMap::builtin(), &Forwarder::new("t"), &Pages::default());
        match decision {
            Decision::Respond { response, .. } => assert_eq!(response.status, StatusCode::NOT_FOUND),
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn test_update_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("root_config.json");
        let router = RootRouter::load(&path).unwrap();
        assert_eq!(router.options(), RootRoutingOptions::default());

        let options = RootRoutingOptions {
            enable_redirect_for_unset_rules: true,
            unset_rule_redirect_target: "https://example.com".to_string(),
        };
        router.update(options.clone()).unwrap();
        assert_eq!(RootRoutingOptions::load(&path).unwrap(), options);
        assert_eq!(RootRouter::load(&path).unwrap().options(), options);
    }
}
