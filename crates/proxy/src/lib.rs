//! proxy: request dispatch and forwarding core for gatehouse
//!
//! Incoming requests are routed through routing rules, access control,
//! redirects, host and virtual-directory endpoints and finally the root
//! router. The Pingora adapter in [`proxy`] drives the pipeline and relays
//! forwarded requests.

pub mod access;
pub mod auth;
pub mod captcha;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod forward_auth;
pub mod forwarder;
pub mod headers;
pub mod ip_filter;
pub mod metrics;
pub mod oauth2;
pub mod pages;
pub mod proxy;
pub mod rate_limit;
pub mod redirect;
pub mod registry;
pub mod request;
pub mod response;
pub mod root;
pub mod routing_rule;
pub mod tld;
pub mod tls_behavior;

pub use access::{AccessGate, AccessRules, BlockReason, GeoLookup, StaticAccessRules, StaticGeoLookup};
pub use auth::{hash_password, AuthGate, AuthMethod, AuthOutcome, BasicAuthSettings};
pub use captcha::{CaptchaGate, CaptchaSettings};
pub use dispatch::{load_endpoints, Decision, Dispatcher};
pub use endpoint::{DefaultSiteOption, Origin, PreparedEndpoint, ProxyEndpoint, ProxyType, Upstream};
pub use error::*;
pub use forwarder::{ForwardPlan, ForwardType, Forwarder, OriginPicker, RoundRobin, TransportFailure};
pub use metrics::{metrics, wait_for_requests_drain, MetricsRegistry};
pub use oauth2::{OAuth2Client, OAuth2Gate};
pub use pages::{Page, Pages};
pub use proxy::GatehouseProxy;
pub use rate_limit::{RateLimitResult, RateLimiter};
pub use redirect::{RedirectRule, RedirectTable};
pub use registry::{EndpointRegistry, VdirMatch};
pub use request::RequestInfo;
pub use response::GatewayResponse;
pub use root::{RootAction, RootRouter};
pub use routing_rule::{RoutingRule, RoutingRules, RuleHandler};
pub use tld::TldMap;
pub use tls_behavior::TlsBehaviorResolver;
