//! Pass-scoped conversion model
//!
//! Every listing request builds these wrappers from scratch: raw resources
//! paired with their parsed annotations, per-host gateway and route
//! fragments, and the [`ConvertOptions`] accumulator threaded through every
//! adapter call. Nothing here outlives a pass.

use crate::annotations::{AnnotationConfig, AuthConfig, DownstreamTlsConfig};
use crate::apis::ingress::knative::KnativeIngressSpec;
use crate::ingress::cache::{DomainCache, RouteCache};
use crate::ingress::dialect::standard::StandardIngressSpec;
use chrono::{DateTime, Utc};
use common::{
    clean_host, create_converted_name, Gateway, HttpRoute, PortTrafficPolicy, StringMatch,
    TrafficPolicy, VirtualService,
};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Host used when a rule or TLS entry names none
pub const DEFAULT_HOST: &str = "*";

/// Path used when a path entry names none
pub const DEFAULT_PATH: &str = "/";

/// Ingress resource shapes the controller understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IngressDialect {
    /// networking.k8s.io/v1
    V1,
    /// networking.k8s.io/v1beta1
    Legacy,
    /// networking.internal.knative.dev/v1alpha1
    Knative,
}

impl IngressDialect {
    pub const fn as_str(&self) -> &'static str {
        match self {
            IngressDialect::V1 => "ingress-v1",
            IngressDialect::Legacy => "ingress-v1beta1",
            IngressDialect::Knative => "knative-ingress",
        }
    }
}

impl fmt::Display for IngressDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a route path is matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathType {
    Exact,
    Prefix,
    /// `^path.*`
    PrefixRegex,
    /// `^path$`
    FullPathRegex,
}

impl PathType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            PathType::Exact => "exact",
            PathType::Prefix => "prefix",
            PathType::PrefixRegex => "prefixRegex",
            PathType::FullPathRegex => "fullPathRegex",
        }
    }
}

impl fmt::Display for PathType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded for a route or domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvertEvent {
    Normal,
    Unknown,
    EmptyRule,
    DuplicatedRoute,
    DuplicatedTls,
    InvalidBackendService,
    PortNameResolveError,
}

impl ConvertEvent {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConvertEvent::Normal => "Normal",
            ConvertEvent::Unknown => "Unknown",
            ConvertEvent::EmptyRule => "EmptyRule",
            ConvertEvent::DuplicatedRoute => "DuplicatedRoute",
            ConvertEvent::DuplicatedTls => "DuplicatedTls",
            ConvertEvent::InvalidBackendService => "InvalidBackendService",
            ConvertEvent::PortNameResolveError => "PortNameResolveError",
        }
    }
}

/// Identity of the resource that produced a route or domain
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IngressRef {
    pub cluster_id: String,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for IngressRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Metadata every dialect shares
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceMeta {
    pub cluster_id: String,
    pub raw_cluster_id: String,
    pub namespace: String,
    pub name: String,
    pub annotations: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub creation_timestamp: Option<DateTime<Utc>>,
}

impl ResourceMeta {
    /// `namespace/name`
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn ingress_ref(&self) -> IngressRef {
        IngressRef {
            cluster_id: self.cluster_id.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngressSpecKind {
    /// v1 and legacy resources after normalization
    Standard(StandardIngressSpec),
    Knative(KnativeIngressSpec),
}

/// A listed resource, defaults already applied
#[derive(Debug, Clone, PartialEq)]
pub struct RawConfig {
    pub dialect: IngressDialect,
    pub meta: ResourceMeta,
    pub spec: IngressSpecKind,
}

/// Oldest first; ties broken by `name.namespace`
pub fn sort_by_creation_time(configs: &mut [RawConfig]) {
    configs.sort_by(|a, b| {
        match a.meta.creation_timestamp.cmp(&b.meta.creation_timestamp) {
            Ordering::Equal => {
                let an = format!("{}.{}", a.meta.name, a.meta.namespace);
                let bn = format!("{}.{}", b.meta.name, b.meta.namespace);
                an.cmp(&bn)
            }
            other => other,
        }
    });
}

/// A raw resource and its parsed annotations
#[derive(Debug, Clone, PartialEq)]
pub struct WrapperConfig {
    pub config: Arc<RawConfig>,
    pub annotations: AnnotationConfig,
}

impl WrapperConfig {
    pub fn meta(&self) -> &ResourceMeta {
        &self.config.meta
    }
}

/// The gateway of one host
#[derive(Debug, Clone)]
pub struct WrapperGateway {
    pub gateway: Gateway,
    /// Resource that first claimed the host
    pub config: Arc<WrapperConfig>,
    pub cluster_id: String,
    pub host: String,
    /// Listener TLS policy; later resources fill it when the first had none
    pub downstream_tls: Option<DownstreamTlsConfig>,
}

impl WrapperGateway {
    pub fn is_https(&self) -> bool {
        self.gateway.servers.iter().any(|server| server.is_https())
    }
}

/// One route fragment
#[derive(Debug, Clone)]
pub struct WrapperHttpRoute {
    pub route: HttpRoute,
    pub config: Arc<WrapperConfig>,
    pub host: String,
    pub cluster_id: String,
    pub origin_path: String,
    pub origin_path_type: PathType,
    /// Explicit total the non-first weights are scaled against (0: none)
    pub weight_total: i32,
    pub is_default_backend: bool,
    pub rule_key: String,
    /// Auth policy; header canaries inherit their base route's
    pub auth: Option<AuthConfig>,
}

impl WrapperHttpRoute {
    pub fn new(config: Arc<WrapperConfig>, host: &str, cluster_id: &str) -> Self {
        let auth = config.annotations.auth.clone();
        Self {
            route: HttpRoute::default(),
            config,
            host: host.to_string(),
            cluster_id: cluster_id.to_string(),
            origin_path: String::new(),
            origin_path_type: PathType::Prefix,
            weight_total: 0,
            is_default_backend: false,
            rule_key: String::new(),
            auth,
        }
    }

    /// `host-pathType-path`
    pub fn path_format(&self) -> String {
        format!("{}-{}-{}", self.host, self.origin_path_type, self.origin_path)
    }

    /// `namespace-name` of the owning resource
    pub fn meta(&self) -> String {
        let meta = self.config.meta();
        format!("{}-{}", meta.namespace, meta.name)
    }
}

/// Name rendered from host, path and the first match's predicates
fn construct_route_name(route: &WrapperHttpRoute) -> String {
    let base = route.path_format();

    let mut header_mappings = Vec::new();
    let mut query_mappings = Vec::new();
    if let Some(predicate) = route.route.matches.first() {
        for (key, value) in &predicate.headers {
            header_mappings.push(create_converted_name(&[
                string_match_kind(value),
                key.as_str(),
                value.value(),
            ]));
        }
        for (key, value) in &predicate.query_params {
            query_mappings.push([string_match_kind(value), key.as_str(), value.value()].join(":"));
        }
    }
    header_mappings.sort();
    query_mappings.sort();

    let mappings: Vec<String> = header_mappings.into_iter().chain(query_mappings).collect();
    if mappings.is_empty() {
        return base;
    }
    create_converted_name(&[base, create_converted_name(&mappings)])
}

fn string_match_kind(value: &StringMatch) -> &'static str {
    match value {
        StringMatch::Exact(_) => "exact",
        StringMatch::Prefix(_) => "prefix",
        StringMatch::Regex(_) => "regex",
    }
}

/// First and last four characters of the host hash of `raw`
fn part_hash(raw: &str) -> String {
    let hashed = clean_host(raw);
    format!("{}{}", &hashed[..4], &hashed[hashed.len() - 4..])
}

/// Resources in the system namespace keep their bare name
fn unique_base_name(system_namespace: &str, route: &WrapperHttpRoute) -> String {
    let meta = route.config.meta();
    if meta.namespace == system_namespace {
        meta.name.clone()
    } else {
        route.meta()
    }
}

/// Deterministic route name: owner plus a short hash of host, path and predicates
pub fn generate_unique_route_name(system_namespace: &str, route: &WrapperHttpRoute) -> String {
    create_converted_name(&[
        unique_base_name(system_namespace, route),
        part_hash(&construct_route_name(route)),
    ])
}

pub fn generate_unique_route_name_with_suffix(
    system_namespace: &str,
    route: &WrapperHttpRoute,
    suffix: &str,
) -> String {
    create_converted_name(&[generate_unique_route_name(system_namespace, route), suffix.to_string()])
}

/// Route fragments of one host and the bookkeeping around them
#[derive(Debug, Clone)]
pub struct WrapperVirtualService {
    pub virtual_service: VirtualService,
    pub config: Arc<WrapperConfig>,
    /// A catch-all route or default backend already serves this host
    pub configured_default_backend: bool,
    /// Latest app-root seen for the host
    pub app_root: String,
}

impl WrapperVirtualService {
    pub fn new(config: Arc<WrapperConfig>, host: &str) -> Self {
        Self {
            virtual_service: VirtualService {
                hosts: vec![host.to_string()],
                ..Default::default()
            },
            config,
            configured_default_backend: false,
            app_root: String::new(),
        }
    }
}

/// A backend service port a traffic policy applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub namespace: String,
    pub name: String,
    pub port: i32,
    /// Set for registry destinations whose host is not a cluster service
    pub service_fqdn: String,
}

#[derive(Debug, Clone)]
pub struct WrapperTrafficPolicy {
    /// Whole-service policy, used when no port is known
    pub traffic_policy: Option<TrafficPolicy>,
    pub port_traffic_policy: Option<PortTrafficPolicy>,
    pub config: Arc<WrapperConfig>,
}

/// The resource a rule key was first claimed by
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleOwner {
    pub ingress: IngressRef,
    pub rule_key: String,
}

/// Mutable accumulator of one pass
#[derive(Debug, Default)]
pub struct ConvertOptions {
    /// Host to gateway
    pub gateways: BTreeMap<String, WrapperGateway>,
    pub domain_cache: DomainCache,

    pub virtual_services: BTreeMap<String, WrapperVirtualService>,
    /// Host to route fragments, in conversion order
    pub http_routes: BTreeMap<String, Vec<WrapperHttpRoute>>,
    pub route_cache: RouteCache,
    /// Rule key to the resource that first claimed it
    pub route_to_ingress: HashMap<String, RuleOwner>,
    /// Canary resources, merged once every base route is known
    pub canary_ingresses: Vec<Arc<WrapperConfig>>,

    pub service_traffic_policy: BTreeMap<ServiceKey, WrapperTrafficPolicy>,

    pub has_default_backend: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
pub(crate) mod tests {
    use super::*;
    use crate::ingress::dialect::standard::StandardIngressSpec;
    use chrono::TimeZone;
    use common::HttpMatchRequest;

    pub(crate) fn wrapper(namespace: &str, name: &str) -> Arc<WrapperConfig> {
        let meta = ResourceMeta {
            cluster_id: "c1".to_string(),
            raw_cluster_id: "c1".to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            ..Default::default()
        };
        Arc::new(WrapperConfig {
            annotations: AnnotationConfig::new("c1", namespace, name),
            config: Arc::new(RawConfig {
                dialect: IngressDialect::V1,
                meta,
                spec: IngressSpecKind::Standard(StandardIngressSpec::default()),
            }),
        })
    }

    fn raw(name: &str, created: Option<i64>) -> RawConfig {
        RawConfig {
            dialect: IngressDialect::V1,
            meta: ResourceMeta {
                namespace: "default".to_string(),
                name: name.to_string(),
                creation_timestamp: created.map(|s| Utc.timestamp_opt(s, 0).unwrap()),
                ..Default::default()
            },
            spec: IngressSpecKind::Standard(StandardIngressSpec::default()),
        }
    }

    #[test]
    fn test_sort_by_creation_time() {
        let mut configs = vec![raw("c", Some(20)), raw("b", Some(10)), raw("a", Some(20))];
        sort_by_creation_time(&mut configs);
        let names: Vec<&str> = configs.iter().map(|c| c.meta.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c"], "Older first, then by name");
    }

    #[test]
    fn test_path_format() {
        let mut route = WrapperHttpRoute::new(wrapper("default", "echo"), "a.example.com", "c1");
        route.origin_path = "/api".to_string();
        route.origin_path_type = PathType::FullPathRegex;
        assert_eq!(route.path_format(), "a.example.com-fullPathRegex-/api");
    }

    #[test]
    fn test_route_names_are_stable_and_distinct() {
        let mut a = WrapperHttpRoute::new(wrapper("default", "echo"), "a.example.com", "c1");
        a.origin_path = "/a".to_string();
        let mut b = a.clone();
        b.origin_path = "/b".to_string();

        let name_a = generate_unique_route_name("portti-system", &a);
        assert_eq!(name_a, generate_unique_route_name("portti-system", &a));
        assert!(name_a.starts_with("default-echo-"));
        assert_eq!(name_a.len(), "default-echo-".len() + 8);
        assert_ne!(name_a, generate_unique_route_name("portti-system", &b));
    }

    #[test]
    fn test_system_namespace_keeps_bare_name() {
        let route = WrapperHttpRoute::new(wrapper("portti-system", "echo"), "*", "c1");
        let name = generate_unique_route_name("portti-system", &route);
        assert!(name.starts_with("echo-"));
        assert!(generate_unique_route_name_with_suffix("portti-system", &route, "default")
            .ends_with("-default"));
    }

    #[test]
    fn test_route_name_depends_on_predicates() {
        let mut plain = WrapperHttpRoute::new(wrapper("default", "echo"), "a.example.com", "c1");
        plain.route.matches = vec![HttpMatchRequest::default()];
        let mut with_header = plain.clone();
        with_header.route.matches[0]
            .headers
            .insert("x-env".to_string(), StringMatch::Exact("prod".to_string()));

        assert_ne!(
            generate_unique_route_name("portti-system", &plain),
            generate_unique_route_name("portti-system", &with_header)
        );
    }
}
