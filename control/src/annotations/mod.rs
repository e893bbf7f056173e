//! Gateway annotations
//!
//! Each feature reads its settings from resource annotations under the
//! `portti.io/` prefix, falling back to the `nginx.ingress.kubernetes.io/`
//! spelling so existing nginx manifests keep working. A feature that fails
//! to parse is switched off for that resource only; the error is logged and
//! conversion continues.

pub mod auth;
pub mod canary;
pub mod destination;
pub mod downstream_tls;
pub mod fallback;
pub mod matching;
pub mod redirect;
pub mod traffic_policy;

use crate::apis::listers::Lister;
use common::{Gateway, HttpRoute, LoadBalancerSettings, ClientTlsSettings};
use k8s_openapi::api::core::v1::{Secret, Service};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::error;

pub use auth::AuthConfig;
pub use canary::CanaryConfig;
pub use destination::DestinationConfig;
pub use downstream_tls::DownstreamTlsConfig;
pub use fallback::FallbackConfig;
pub use matching::{MatchConfig, PathRegexConfig};
pub use redirect::RedirectConfig;
pub use traffic_policy::TrafficPolicyConfig;

pub const PORTTI_ANNOTATIONS_PREFIX: &str = "portti.io";
pub const NGINX_ANNOTATIONS_PREFIX: &str = "nginx.ingress.kubernetes.io";

/// Cluster an emitted object was converted from
pub const CLUSTER_ID_ANNOTATION: &str = "internal.portti.io/cluster-id";
pub const RAW_CLUSTER_ID_ANNOTATION: &str = "internal.portti.io/raw-cluster-id";
/// Host an emitted gateway or virtual service serves
pub const HOST_ANNOTATION: &str = "internal.portti.io/host";
/// Label asking the discovery layer to push regardless of its own diffing
pub const ALWAYS_PUSH_LABEL: &str = "internal.portti.io/always-push";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnnotationError {
    #[error("invalid value '{value}' for annotation {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid annotation name {0}")]
    InvalidName(String),

    #[error("{kind} {name} referenced by annotation {key} not found")]
    MissingReference {
        key: String,
        kind: &'static str,
        name: String,
    },
}

impl AnnotationError {
    pub fn invalid(key: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Read access to a resource's annotations with prefix fallback
#[derive(Debug, Clone, Copy)]
pub struct Annotations<'a> {
    map: &'a BTreeMap<String, String>,
}

impl<'a> Annotations<'a> {
    pub fn new(map: &'a BTreeMap<String, String>) -> Self {
        Self { map }
    }

    fn lookup(&self, prefix: &str, key: &str) -> Option<&'a str> {
        self.map
            .get(&format!("{}/{}", prefix, key))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Value under the gateway prefix only
    pub fn string_portti(&self, key: &str) -> Option<&'a str> {
        self.lookup(PORTTI_ANNOTATIONS_PREFIX, key)
    }

    /// Value under the gateway prefix, else the nginx prefix
    pub fn string_asap(&self, key: &str) -> Option<&'a str> {
        self.string_portti(key)
            .or_else(|| self.lookup(NGINX_ANNOTATIONS_PREFIX, key))
    }

    pub fn has_portti(&self, key: &str) -> bool {
        self.string_portti(key).is_some()
    }

    pub fn has_asap(&self, key: &str) -> bool {
        self.string_asap(key).is_some()
    }

    pub fn bool_asap(&self, key: &str) -> Result<Option<bool>, AnnotationError> {
        match self.string_asap(key) {
            None => Ok(None),
            Some(value) => value
                .parse::<bool>()
                .map(Some)
                .map_err(|_| AnnotationError::invalid(key, value, "expected true or false")),
        }
    }

    pub fn int_asap(&self, key: &str) -> Result<Option<i32>, AnnotationError> {
        match self.string_asap(key) {
            None => Ok(None),
            Some(value) => value
                .parse::<i32>()
                .map(Some)
                .map_err(|_| AnnotationError::invalid(key, value, "expected an integer")),
        }
    }

    /// Gateway-prefixed entries as (key without prefix, value)
    pub fn portti_entries(&self) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        let prefix = format!("{}/", PORTTI_ANNOTATIONS_PREFIX);
        self.map.iter().filter_map(move |(k, v)| {
            k.strip_prefix(prefix.as_str())
                .map(|suffix| (suffix, v.as_str()))
        })
    }
}

/// Parsed annotation settings of one resource
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnotationConfig {
    pub cluster_id: String,
    pub namespace: String,
    pub name: String,

    pub auth: Option<AuthConfig>,
    pub canary: Option<CanaryConfig>,
    pub destination: Option<DestinationConfig>,
    pub redirect: Option<RedirectConfig>,
    pub fallback: Option<FallbackConfig>,
    pub downstream_tls: Option<DownstreamTlsConfig>,
    pub matching: Option<MatchConfig>,
    pub path_regex: Option<PathRegexConfig>,
    pub traffic_policy: Option<TrafficPolicyConfig>,

    /// Secrets this resource depends on, as `cluster/namespace/name`
    pub referenced_secrets: BTreeSet<String>,
}

impl AnnotationConfig {
    pub fn new(cluster_id: &str, namespace: &str, name: &str) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn is_canary(&self) -> bool {
        self.canary.as_ref().is_some_and(|c| c.enabled)
    }

    /// (by header or cookie, by weight)
    pub fn canary_kind(&self) -> (bool, bool) {
        match &self.canary {
            Some(canary) if canary.enabled => {
                let by_header = !canary.header.is_empty() || !canary.cookie.is_empty();
                (by_header, !by_header)
            }
            _ => (false, false),
        }
    }

    pub fn needs_regex_match(&self) -> bool {
        self.path_regex.as_ref().is_some_and(|p| p.use_regex)
    }

    pub fn is_full_path_regex(&self) -> bool {
        self.path_regex.as_ref().is_some_and(|p| p.full_path_regex)
    }

    pub fn needs_traffic_policy(&self) -> bool {
        self.traffic_policy.is_some()
    }

    /// Record a secret dependency in both the resource and the pass-wide set
    pub fn register_secret(&mut self, ctx: &mut GlobalContext, namespace: &str, name: &str) {
        let key = format!("{}/{}/{}", self.cluster_id, namespace, name);
        ctx.watched_secrets.insert(key.clone());
        self.referenced_secrets.insert(key);
    }
}

/// Cross-cluster lookups available while parsing annotations
#[derive(Clone, Default)]
pub struct GlobalContext {
    /// Every secret referenced in this pass, as `cluster/namespace/name`
    pub watched_secrets: BTreeSet<String>,
    pub cluster_secret_listers: BTreeMap<String, Lister<Secret>>,
    pub cluster_service_listers: BTreeMap<String, Lister<Service>>,
}

/// Split `[namespace/]name`, defaulting the namespace
pub fn split_namespaced_name(value: &str, default_namespace: &str) -> (String, String) {
    match value.split_once('/') {
        Some((namespace, name)) => (namespace.to_string(), name.to_string()),
        None => (default_namespace.to_string(), value.to_string()),
    }
}

pub trait Parser: Send + Sync {
    /// Read this feature's annotations into `config`.
    ///
    /// A missing annotation is not an error; the feature just stays unset.
    fn parse(
        &self,
        annotations: Annotations<'_>,
        config: &mut AnnotationConfig,
        ctx: &mut GlobalContext,
    ) -> Result<(), AnnotationError>;
}

pub trait GatewayHandler: Send + Sync {
    fn apply_gateway(&self, gateway: &mut Gateway, config: &AnnotationConfig);
}

pub trait RouteHandler: Send + Sync {
    fn apply_route(&self, route: &mut HttpRoute, config: &AnnotationConfig);
}

pub trait TrafficPolicyHandler: Send + Sync {
    /// Apply to either a whole-service or a port-level policy
    fn apply_traffic_policy(
        &self,
        load_balancer: &mut Option<LoadBalancerSettings>,
        tls: &mut Option<ClientTlsSettings>,
        config: &AnnotationConfig,
    );
}

/// Runs every annotation feature over resources, routes and gateways
pub struct AnnotationHandlerManager {
    parsers: Vec<(&'static str, Box<dyn Parser>)>,
    gateway_handlers: Vec<Box<dyn GatewayHandler>>,
    route_handlers: Vec<Box<dyn RouteHandler>>,
    traffic_policy_handlers: Vec<Box<dyn TrafficPolicyHandler>>,
}

impl Default for AnnotationHandlerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AnnotationHandlerManager {
    pub fn new() -> Self {
        Self {
            parsers: vec![
                ("canary", Box::new(canary::Canary)),
                ("auth", Box::new(auth::Auth)),
                ("destination", Box::new(destination::Destination)),
                ("downstream-tls", Box::new(downstream_tls::DownstreamTls)),
                ("fallback", Box::new(fallback::Fallback)),
                ("match", Box::new(matching::Match)),
                ("path-regex", Box::new(matching::PathRegex)),
                ("redirect", Box::new(redirect::Redirect)),
                ("traffic-policy", Box::new(traffic_policy::TrafficPolicy)),
            ],
            gateway_handlers: vec![Box::new(downstream_tls::DownstreamTls)],
            route_handlers: vec![
                Box::new(matching::Match),
                Box::new(redirect::Redirect),
                Box::new(fallback::Fallback),
            ],
            traffic_policy_handlers: vec![Box::new(traffic_policy::TrafficPolicy)],
        }
    }

    /// Parse every feature; failures disable only the failing feature
    pub fn parse(
        &self,
        annotations: &BTreeMap<String, String>,
        config: &mut AnnotationConfig,
        ctx: &mut GlobalContext,
    ) {
        let annotations = Annotations::new(annotations);
        for (feature, parser) in &self.parsers {
            if let Err(e) = parser.parse(annotations, config, ctx) {
                error!(
                    "Failed to parse {} annotations of ingress {}/{} within cluster {}: {}",
                    feature, config.namespace, config.name, config.cluster_id, e
                );
            }
        }
    }

    pub fn apply_gateway(&self, gateway: &mut Gateway, config: &AnnotationConfig) {
        for handler in &self.gateway_handlers {
            handler.apply_gateway(gateway, config);
        }
    }

    pub fn apply_route(&self, route: &mut HttpRoute, config: &AnnotationConfig) {
        for handler in &self.route_handlers {
            handler.apply_route(route, config);
        }
    }

    pub fn apply_traffic_policy(
        &self,
        load_balancer: &mut Option<LoadBalancerSettings>,
        tls: &mut Option<ClientTlsSettings>,
        config: &AnnotationConfig,
    ) {
        for handler in &self.traffic_policy_handlers {
            handler.apply_traffic_policy(load_balancer, tls, config);
        }
    }
}
