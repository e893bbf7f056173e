//! Conversion shared by the v1 and v1beta1 Ingress dialects
//!
//! Both shapes are normalized into [`StandardIngressSpec`] when listed, with
//! optional fields defaulted, so gateway, route, default backend, canary and
//! traffic policy conversion only exist once.

use crate::annotations::destination::{MCP_BRIDGE_API_GROUP, MCP_BRIDGE_KIND, MCP_BRIDGE_NAME, MCP_NAMESPACE};
use crate::annotations::canary::{apply_by_header, apply_by_weight};
use crate::annotations::DestinationConfig;
use crate::apis::metrics::record_invalid_ingress;
use crate::config::{parse_tls_secret, ClusterOptions};
use crate::error::{PorttiError, Result};
use crate::ingress::cache::{BackendService, DomainProtocol, IngressDomainBuilder, IngressRouteBuilder};
use crate::ingress::dialect::AdapterContext;
use crate::ingress::model::{
    generate_unique_route_name, generate_unique_route_name_with_suffix, ConvertEvent,
    ConvertOptions, IngressSpecKind, PathType, RuleOwner, ServiceKey, WrapperConfig,
    WrapperGateway, WrapperHttpRoute, WrapperTrafficPolicy, WrapperVirtualService, DEFAULT_HOST,
    DEFAULT_PATH,
};
use crate::ingress::rule_key::create_rule_key;
use common::{
    create_converted_name, service_fqdn, Destination, Gateway, HttpMatchRequest,
    HttpRouteDestination, Port, PortSelector, PortTrafficPolicy, Server, ServerTlsMode,
    ServerTlsSettings, StringMatch, TrafficPolicy, PROTOCOL_HTTP, PROTOCOL_HTTPS,
};
use k8s_openapi::api::core::v1::TypedLocalObjectReference;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StandardIngressSpec {
    pub ingress_class_name: Option<String>,
    pub default_backend: Option<IngressBackend>,
    pub tls: Vec<IngressTls>,
    pub rules: Vec<IngressRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BackendPort {
    Number(u32),
    Name(String),
    #[default]
    Unset,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngressBackend {
    /// Empty when the backend is a resource reference
    pub service_name: String,
    pub service_port: BackendPort,
    pub resource: Option<TypedLocalObjectReference>,
}

impl IngressBackend {
    fn is_defined(&self) -> bool {
        !self.service_name.is_empty() || self.resource.is_some()
    }
}

/// Whether a resource backend selects the registry destinations of the destination annotation
pub fn is_registry_backend(resource: &TypedLocalObjectReference) -> bool {
    resource.api_group.as_deref() == Some(MCP_BRIDGE_API_GROUP)
        && resource.kind == MCP_BRIDGE_KIND
        && resource.name == MCP_BRIDGE_NAME
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngressTls {
    pub hosts: Vec<String>,
    pub secret_name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IngressPathType {
    Exact,
    #[default]
    Prefix,
    ImplementationSpecific,
}

impl IngressPathType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Exact" => Some(Self::Exact),
            "Prefix" => Some(Self::Prefix),
            "ImplementationSpecific" => Some(Self::ImplementationSpecific),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngressPath {
    pub path: String,
    pub path_type: Option<IngressPathType>,
    pub backend: IngressBackend,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngressRule {
    pub host: String,
    /// None when the rule has no `http` section
    pub paths: Option<Vec<IngressPath>>,
}

impl IngressRule {
    fn http_paths(&self) -> Option<&[IngressPath]> {
        self.paths.as_deref().filter(|paths| !paths.is_empty())
    }
}

impl StandardIngressSpec {
    /// Fill optional fields the way the gateway interprets them
    pub fn with_defaults(mut self, use_regex: bool) -> Self {
        for tls in &mut self.tls {
            if tls.hosts.is_empty() {
                tls.hosts = vec![DEFAULT_HOST.to_string()];
            }
        }
        for rule in &mut self.rules {
            if rule.host.is_empty() {
                rule.host = DEFAULT_HOST.to_string();
            }
            let Some(paths) = rule.paths.as_mut() else {
                continue;
            };
            for path in paths {
                if path.path.is_empty() {
                    path.path = DEFAULT_PATH.to_string();
                }
                match path.path_type {
                    None => {
                        path.path_type = Some(IngressPathType::Prefix);
                        // clusters predating pathType wrote prefixes as globs
                        if !use_regex {
                            for glob in [".*", "/*"] {
                                if let Some(trimmed) = path.path.strip_suffix(glob) {
                                    path.path = trimmed.to_string();
                                }
                            }
                            if path.path.is_empty() {
                                path.path = DEFAULT_PATH.to_string();
                            }
                        }
                    }
                    Some(IngressPathType::ImplementationSpecific) => {
                        path.path_type = Some(IngressPathType::Prefix);
                    }
                    Some(_) => {}
                }
            }
        }
        self
    }

    fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.default_backend.is_none()
    }
}

fn standard_spec(wrapper: &WrapperConfig) -> Result<&StandardIngressSpec> {
    match &wrapper.config.spec {
        IngressSpecKind::Standard(spec) => Ok(spec),
        IngressSpecKind::Knative(_) => Err(PorttiError::invalid_resource(
            wrapper.meta().key(),
            "expected an Ingress spec",
        )),
    }
}

fn check_not_empty(ctx: &AdapterContext, wrapper: &WrapperConfig, spec: &StandardIngressSpec) -> Result<()> {
    if spec.is_empty() {
        record_invalid_ingress(&ctx.options.cluster_id, ConvertEvent::EmptyRule.as_str());
        return Err(PorttiError::invalid_resource(
            wrapper.meta().key(),
            "no rules and no default backend",
        ));
    }
    Ok(())
}

/// Secret of the first TLS entry naming `host`
fn extract_tls_secret_name<'a>(host: &str, tls: &'a [IngressTls]) -> &'a str {
    tls.iter()
        .find(|entry| entry.hosts.iter().any(|h| h == host))
        .map_or("", |entry| entry.secret_name.as_str())
}

/// Resolve the TLS secret of `host` as (namespace, name); empty name when none applies
fn resolve_tls_secret(
    ctx: &AdapterContext,
    namespace: &str,
    host: &str,
    tls: &[IngressTls],
) -> (String, String) {
    let mut secret_namespace = namespace.to_string();
    let mut secret_name = extract_tls_secret_name(host, tls).to_string();

    let Some(credentials) = &ctx.https_credentials else {
        return (secret_namespace, secret_name);
    };
    let use_domain_match = if secret_name.is_empty() {
        true
    } else {
        credentials.fallback_for_invalid_secret
            && ctx.listers.secrets.get(&secret_namespace, &secret_name).is_none()
    };
    if !use_domain_match {
        return (secret_namespace, secret_name);
    }

    let (ns, name) = parse_tls_secret(credentials.match_secret_name_by_domain(host));
    if name.is_empty() {
        debug!("No credential covers host {}, serving it without TLS", host);
        return (secret_namespace, String::new());
    }
    debug!("Using fallback credential {}/{} for host {}", ns, name, host);
    secret_namespace = if ns.is_empty() {
        ctx.options.system_namespace.clone()
    } else {
        ns
    };
    secret_name = name;
    (secret_namespace, secret_name)
}

/// Hosts the gateway pass visits; a resource with only a default backend serves `*`
fn gateway_hosts(spec: &StandardIngressSpec) -> Vec<&str> {
    if spec.rules.is_empty() {
        return vec![DEFAULT_HOST];
    }
    spec.rules.iter().map(|rule| rule.host.as_str()).collect()
}

/// HTTP listener of `host`
pub(crate) fn http_server(cluster: &ClusterOptions, port: u32, host: &str) -> Server {
    Server {
        port: Port {
            number: port,
            protocol: PROTOCOL_HTTP.to_string(),
            name: create_converted_name(&[format!("http-{}-ingress", port), cluster.cluster_id.clone()]),
        },
        hosts: vec![host.to_string()],
        tls: None,
    }
}

/// Create the gateway of the domain's host with an HTTP listener on
/// `http_port`, or let an existing one inherit this resource's listener TLS
/// policy when it has none
pub(crate) fn ensure_gateway(
    cluster: &ClusterOptions,
    options: &mut ConvertOptions,
    wrapper: &Arc<WrapperConfig>,
    domain: &IngressDomainBuilder,
    http_port: u32,
) {
    if let Some(existing) = options.gateways.get_mut(&domain.host) {
        if existing.downstream_tls.is_none() {
            existing.downstream_tls = wrapper.annotations.downstream_tls.clone();
        }
        return;
    }

    let mut selector = BTreeMap::new();
    if !cluster.gateway_selector_key.is_empty() {
        selector.insert(
            cluster.gateway_selector_key.clone(),
            cluster.gateway_selector_value.clone(),
        );
    }
    let gateway = WrapperGateway {
        gateway: Gateway {
            selector,
            servers: vec![http_server(cluster, http_port, &domain.host)],
        },
        config: wrapper.clone(),
        cluster_id: cluster.cluster_id.clone(),
        host: domain.host.clone(),
        downstream_tls: wrapper.annotations.downstream_tls.clone(),
    };
    options.gateways.insert(domain.host.clone(), gateway);
    options.domain_cache.set_valid(domain.clone());
}

/// Attach an HTTPS listener serving the secret. A host already served over
/// HTTPS keeps its listener and the new claim becomes a conflict record.
pub(crate) fn attach_tls(
    cluster: &ClusterOptions,
    options: &mut ConvertOptions,
    mut domain: IngressDomainBuilder,
    secret_namespace: &str,
    secret_name: &str,
) {
    domain.protocol = DomainProtocol::Https;
    domain.secret_name = format!("{}/{}/{}", cluster.cluster_id, secret_namespace, secret_name);

    let Some(gateway) = options.gateways.get_mut(&domain.host) else {
        return;
    };
    if gateway.is_https() {
        warn!(
            "TLS of host {} in ingress {} within cluster {} conflicts with an earlier ingress",
            domain.host, domain.ingress, cluster.cluster_id
        );
        domain.event = ConvertEvent::DuplicatedTls;
        domain.pre_ingress = options.domain_cache.valid(&domain.host).map(|b| b.ingress.clone());
        record_invalid_ingress(&cluster.cluster_id, ConvertEvent::DuplicatedTls.as_str());
        options.domain_cache.push_invalid(domain);
        return;
    }

    let https_port = cluster.gateway_https_port;
    gateway.gateway.servers.push(Server {
        port: Port {
            number: https_port,
            protocol: PROTOCOL_HTTPS.to_string(),
            name: create_converted_name(&[
                format!("https-{}-ingress", https_port),
                cluster.cluster_id.clone(),
            ]),
        },
        hosts: vec![domain.host.clone()],
        tls: Some(ServerTlsSettings {
            mode: Some(ServerTlsMode::Simple),
            credential_name: kubernetes_ingress_credential(
                &cluster.raw_cluster_id,
                secret_namespace,
                secret_name,
            ),
            ..Default::default()
        }),
    });
    options.domain_cache.set_valid(domain);
}

pub fn convert_gateway(
    ctx: &AdapterContext,
    options: &mut ConvertOptions,
    wrapper: &Arc<WrapperConfig>,
) -> Result<()> {
    if wrapper.annotations.is_canary() {
        return Ok(());
    }
    let spec = standard_spec(wrapper)?;
    check_not_empty(ctx, wrapper, spec)?;

    let meta = wrapper.meta();
    let cluster = &ctx.options;

    for host in gateway_hosts(spec) {
        let domain = IngressDomainBuilder::new(host, meta.ingress_ref(), meta.creation_timestamp);
        ensure_gateway(cluster, options, wrapper, &domain, cluster.gateway_http_port);

        if spec.tls.is_empty() {
            continue;
        }
        let (secret_namespace, secret_name) = resolve_tls_secret(ctx, &meta.namespace, host, &spec.tls);
        if secret_name.is_empty() {
            continue;
        }
        attach_tls(cluster, options, domain, &secret_namespace, &secret_name);
    }
    Ok(())
}

/// Credential reference the data plane resolves through the ingress secret reader
pub fn kubernetes_ingress_credential(cluster: &str, namespace: &str, name: &str) -> String {
    format!("kubernetes-ingress://{}/{}/{}", cluster, namespace, name)
}

/// Match predicates for a path; `vs` learns when the path catches everything
pub fn generate_http_matches(
    path_type: PathType,
    path: &str,
    vs: Option<&mut WrapperVirtualService>,
) -> Vec<HttpMatchRequest> {
    let uri = |m: StringMatch| HttpMatchRequest {
        uri: Some(m),
        ..Default::default()
    };
    match path_type {
        PathType::PrefixRegex => vec![uri(StringMatch::Regex(format!("{}.*", path)))],
        PathType::FullPathRegex => vec![uri(StringMatch::Regex(format!("{}$", path)))],
        PathType::Exact => vec![uri(StringMatch::Exact(path.to_string()))],
        PathType::Prefix if path == DEFAULT_PATH => {
            if let Some(vs) = vs {
                vs.configured_default_backend = true;
            }
            vec![uri(StringMatch::Prefix(DEFAULT_PATH.to_string()))]
        }
        PathType::Prefix => {
            // exact plus prefix-with-slash keeps `/a` from matching `/ab`
            let trimmed = path.strip_suffix('/').unwrap_or(path);
            vec![
                uri(StringMatch::Exact(trimmed.to_string())),
                uri(StringMatch::Prefix(format!("{}/", trimmed))),
            ]
        }
    }
}

/// Path type and normalized origin path of a path entry
fn classify_path(wrapper: &WrapperConfig, path: &IngressPath) -> (PathType, String) {
    if wrapper.annotations.needs_regex_match() {
        let path_type = if wrapper.annotations.is_full_path_regex() {
            PathType::FullPathRegex
        } else {
            PathType::PrefixRegex
        };
        return (path_type, path.path.clone());
    }
    match path.path_type {
        Some(IngressPathType::Exact) => (PathType::Exact, path.path.clone()),
        _ => {
            let origin = if path.path == DEFAULT_PATH {
                path.path.clone()
            } else {
                path.path.strip_suffix('/').unwrap_or(&path.path).to_string()
            };
            (PathType::Prefix, origin)
        }
    }
}

/// Resolve a named service port through the service lister
fn resolve_port_name(ctx: &AdapterContext, namespace: &str, service: &str, port_name: &str) -> Option<u32> {
    let service = ctx.listers.services.get(namespace, service)?;
    service
        .spec
        .as_ref()?
        .ports
        .as_ref()?
        .iter()
        .find(|port| port.name.as_deref() == Some(port_name))
        .and_then(|port| u32::try_from(port.port).ok())
}

/// Numeric port of a service backend, resolving names
fn backend_port(ctx: &AdapterContext, namespace: &str, backend: &IngressBackend) -> Option<u32> {
    match &backend.service_port {
        BackendPort::Number(number) => Some(*number),
        BackendPort::Name(name) => resolve_port_name(ctx, namespace, &backend.service_name, name),
        BackendPort::Unset => Some(0),
    }
}

fn single_destination(namespace: &str, service: &str, port: u32) -> Vec<HttpRouteDestination> {
    vec![HttpRouteDestination {
        destination: Destination {
            host: service_fqdn(namespace, service),
            port: Some(PortSelector { number: port }),
            subset: None,
        },
        weight: 100,
        headers: None,
    }]
}

/// Destinations of a path backend, recording the backend on the builder
fn backend_to_route_destination(
    ctx: &AdapterContext,
    backend: &IngressBackend,
    namespace: &str,
    builder: &mut IngressRouteBuilder,
    destination: Option<&DestinationConfig>,
) -> (Vec<HttpRouteDestination>, ConvertEvent) {
    if !backend.is_defined() {
        return (Vec::new(), ConvertEvent::InvalidBackendService);
    }
    if let Some(resource) = &backend.resource {
        return match destination {
            Some(config) if is_registry_backend(resource) && !config.destinations.is_empty() => {
                (config.destinations.clone(), ConvertEvent::Normal)
            }
            _ => (Vec::new(), ConvertEvent::InvalidBackendService),
        };
    }

    if let BackendPort::Name(name) = &backend.service_port {
        builder.port_name = name.clone();
    }
    let Some(port) = backend_port(ctx, namespace, backend) else {
        return (Vec::new(), ConvertEvent::PortNameResolveError);
    };
    builder.services = vec![BackendService {
        namespace: namespace.to_string(),
        name: backend.service_name.clone(),
        port,
        weight: 100,
    }];
    (
        single_destination(namespace, &backend.service_name, port),
        ConvertEvent::Normal,
    )
}

pub fn convert_http_route(
    ctx: &AdapterContext,
    options: &mut ConvertOptions,
    wrapper: &Arc<WrapperConfig>,
) -> Result<()> {
    if wrapper.annotations.is_canary() {
        options.canary_ingresses.push(wrapper.clone());
        return Ok(());
    }
    let spec = standard_spec(wrapper)?;
    check_not_empty(ctx, wrapper, spec)?;

    let meta = wrapper.meta();
    let cluster_id = &ctx.options.cluster_id;
    let system_namespace = &ctx.options.system_namespace;

    if spec
        .default_backend
        .as_ref()
        .is_some_and(IngressBackend::is_defined)
    {
        options.has_default_backend = true;
    }

    let mut defined_rules: HashSet<String> = HashSet::new();
    for rule in &spec.rules {
        let Some(paths) = rule.http_paths() else {
            warn!("Rule of host {} in ingress {} has no paths", rule.host, meta.key());
            continue;
        };

        let vs = options
            .virtual_services
            .entry(rule.host.clone())
            .or_insert_with(|| WrapperVirtualService::new(wrapper.clone(), &rule.host));
        if let Some(redirect) = &wrapper.annotations.redirect {
            if !redirect.app_root.is_empty() {
                vs.app_root = redirect.app_root.clone();
            }
        }

        let mut routes = Vec::new();
        let mut rule_keys = Vec::new();
        for path in paths {
            let mut route = WrapperHttpRoute::new(wrapper.clone(), &rule.host, cluster_id);
            let (path_type, origin_path) = classify_path(wrapper, path);
            route.origin_path = origin_path;
            route.origin_path_type = path_type;
            let vs = options.virtual_services.get_mut(&rule.host);
            route.route.matches = generate_http_matches(path_type, &path.path, vs);
            route.route.name = generate_unique_route_name(system_namespace, &route);

            let mut builder = options.route_cache.new_builder(&route);
            let key = create_rule_key(&meta.annotations, &route.path_format());
            route.rule_key = key.clone();
            if let Some(owner) = options.route_to_ingress.get(&key) {
                builder.pre_ingress = Some(owner.ingress.clone());
                builder.event = ConvertEvent::DuplicatedRoute;
            }
            rule_keys.push(key);

            if builder.event == ConvertEvent::Normal {
                let path_format = route.path_format();
                if defined_rules.contains(&path_format) {
                    builder.pre_ingress = Some(meta.ingress_ref());
                    builder.event = ConvertEvent::DuplicatedRoute;
                }
                defined_rules.insert(path_format);
            }

            let destination = wrapper.annotations.destination.as_ref();
            let (destinations, mut event) =
                backend_to_route_destination(ctx, &path.backend, &meta.namespace, &mut builder, destination);
            route.route.route = destinations;
            if let Some(destination) = destination {
                route.weight_total = destination.weight_sum;
            }
            if builder.event != ConvertEvent::Normal {
                event = builder.event;
            }

            if event == ConvertEvent::Normal {
                routes.push(route);
            } else {
                debug!(
                    "Route of host {} and path {} in ingress {} is {}",
                    rule.host,
                    path.path,
                    meta.key(),
                    event.as_str()
                );
                record_invalid_ingress(cluster_id, event.as_str());
                builder.event = event;
            }
            options.route_cache.add(builder);
        }

        for key in rule_keys {
            options.route_to_ingress.entry(key.clone()).or_insert(RuleOwner {
                ingress: meta.ingress_ref(),
                rule_key: key,
            });
        }
        options
            .http_routes
            .entry(rule.host.clone())
            .or_default()
            .extend(routes);
    }
    Ok(())
}

/// Route forwarding everything on `host` to the default backend
fn create_default_route(
    ctx: &AdapterContext,
    wrapper: &Arc<WrapperConfig>,
    backend: &IngressBackend,
    host: &str,
) -> Option<WrapperHttpRoute> {
    let namespace = &wrapper.meta().namespace;
    let destinations = if !backend.service_name.is_empty() {
        let Some(port) = backend_port(ctx, namespace, backend) else {
            warn!(
                "Default backend {}/{} of ingress {} has an unresolvable port",
                namespace,
                backend.service_name,
                wrapper.meta().key()
            );
            return None;
        };
        single_destination(namespace, &backend.service_name, port)
    } else {
        match (&backend.resource, &wrapper.annotations.destination) {
            (Some(resource), Some(config)) if is_registry_backend(resource) => {
                config.destinations.clone()
            }
            _ => return None,
        }
    };

    let mut route = WrapperHttpRoute::new(wrapper.clone(), host, &ctx.options.cluster_id);
    route.route.route = destinations;
    route.is_default_backend = true;
    route.origin_path_type = PathType::Prefix;
    route.origin_path = DEFAULT_PATH.to_string();
    route.route.name =
        generate_unique_route_name_with_suffix(&ctx.options.system_namespace, &route, "default");
    Some(route)
}

/// Default route for `host` unless one is already configured, creating its virtual service
fn default_route_for(
    ctx: &AdapterContext,
    options: &mut ConvertOptions,
    wrapper: &Arc<WrapperConfig>,
    backend: &IngressBackend,
    host: &str,
) -> Option<WrapperHttpRoute> {
    let vs = options
        .virtual_services
        .entry(host.to_string())
        .or_insert_with(|| WrapperVirtualService::new(wrapper.clone(), host));
    if vs.configured_default_backend {
        return None;
    }
    create_default_route(ctx, wrapper, backend, host)
}

pub fn apply_default_backend(
    ctx: &AdapterContext,
    options: &mut ConvertOptions,
    wrapper: &Arc<WrapperConfig>,
) -> Result<()> {
    if wrapper.annotations.is_canary() {
        return Ok(());
    }
    let spec = standard_spec(wrapper)?;
    let Some(backend) = &spec.default_backend else {
        return Ok(());
    };

    // the wildcard host takes over catch-all routes other resources declared
    if let Some(default_route) = default_route_for(ctx, options, wrapper, backend, DEFAULT_HOST) {
        let routes = options.http_routes.entry(DEFAULT_HOST.to_string()).or_default();
        let mut found = false;
        for route in routes.iter_mut() {
            if route.origin_path_type == PathType::Prefix && route.origin_path == DEFAULT_PATH {
                found = true;
                options.route_cache.delete(route);
                route.route = default_route.route.clone();
                route.config = default_route.config.clone();
                options.route_cache.new_and_add(route);
            }
        }
        if !found {
            options.route_cache.new_and_add(&default_route);
            routes.push(default_route);
        }
    }

    for rule in &spec.rules {
        if rule.host == DEFAULT_HOST {
            continue;
        }
        let Some(default_route) = default_route_for(ctx, options, wrapper, backend, &rule.host) else {
            continue;
        };
        if let Some(vs) = options.virtual_services.get_mut(&rule.host) {
            vs.configured_default_backend = true;
        }
        options.route_cache.new_and_add(&default_route);
        options
            .http_routes
            .entry(rule.host.clone())
            .or_default()
            .push(default_route);
    }
    Ok(())
}

pub fn apply_canary_ingress(
    ctx: &AdapterContext,
    options: &mut ConvertOptions,
    wrapper: &Arc<WrapperConfig>,
) -> Result<()> {
    let (by_header, _) = wrapper.annotations.canary_kind();
    let Some(canary_config) = wrapper.annotations.canary.clone() else {
        return Ok(());
    };
    let spec = standard_spec(wrapper)?;
    check_not_empty(ctx, wrapper, spec)?;

    let meta = wrapper.meta();
    let cluster_id = &ctx.options.cluster_id;
    let system_namespace = &ctx.options.system_namespace;

    for rule in &spec.rules {
        let Some(paths) = rule.http_paths() else {
            warn!("Rule of host {} in canary ingress {} has no paths", rule.host, meta.key());
            continue;
        };
        if !options.http_routes.contains_key(&rule.host) {
            continue;
        }

        for path in paths {
            let mut canary = WrapperHttpRoute::new(wrapper.clone(), &rule.host, cluster_id);
            let (path_type, origin_path) = classify_path(wrapper, path);
            canary.origin_path = origin_path;
            canary.origin_path_type = path_type;
            canary.route.matches = generate_http_matches(path_type, &path.path, None);
            canary.route.name = generate_unique_route_name(system_namespace, &canary);
            canary.rule_key = create_rule_key(&meta.annotations, &canary.path_format());

            let mut builder = options.route_cache.new_builder(&canary);
            let (destinations, event) = backend_to_route_destination(
                ctx,
                &path.backend,
                &meta.namespace,
                &mut builder,
                wrapper.annotations.destination.as_ref(),
            );
            if event != ConvertEvent::Normal {
                record_invalid_ingress(cluster_id, event.as_str());
                builder.event = event;
                options.route_cache.add(builder);
                continue;
            }
            canary.route.route = destinations;

            let Some(routes) = options.http_routes.get_mut(&rule.host) else {
                continue;
            };
            let Some(pos) = routes
                .iter()
                .position(|r| !r.config.annotations.is_canary() && r.rule_key == canary.rule_key)
            else {
                debug!(
                    "Canary path {} of ingress {} has no base route on host {}",
                    path.path,
                    meta.key(),
                    rule.host
                );
                continue;
            };

            if by_header {
                let target = &routes[pos];
                apply_by_header(&mut canary.route, &target.route, &canary_config);
                canary.route.name = generate_unique_route_name(system_namespace, &canary);
                canary.auth = target.auth.clone();
                builder.route_name = canary.route.name.clone();
                routes.insert(pos, canary);
                options.route_cache.add(builder);
            } else {
                let target = &mut routes[pos];
                if target.weight_total == 0 {
                    target.weight_total = canary_config.weight_total;
                }
                apply_by_weight(&mut target.route, &canary.route, &canary_config);
                options.route_cache.update(target);
            }
        }
    }
    Ok(())
}

/// Register the service a backend points at for a traffic policy, first writer wins
fn store_backend_traffic_policy(
    ctx: &AdapterContext,
    wrapper: &Arc<WrapperConfig>,
    backend: &IngressBackend,
    store: &mut BTreeMap<ServiceKey, WrapperTrafficPolicy>,
) -> Result<()> {
    let namespace = &wrapper.meta().namespace;
    if let Some(resource) = &backend.resource {
        let Some(config) = &wrapper.annotations.destination else {
            return Ok(());
        };
        if !is_registry_backend(resource) {
            return Ok(());
        }
        for destination in &config.destinations {
            let port = destination.destination.port.as_ref().map_or(0, |p| p.number);
            let key = ServiceKey {
                namespace: MCP_NAMESPACE.to_string(),
                name: destination.destination.host.clone(),
                port: i32::try_from(port).unwrap_or_default(),
                service_fqdn: destination.destination.host.clone(),
            };
            store.entry(key).or_insert_with(|| {
                if port != 0 {
                    WrapperTrafficPolicy {
                        traffic_policy: None,
                        port_traffic_policy: Some(PortTrafficPolicy {
                            port: Some(PortSelector { number: port }),
                            ..Default::default()
                        }),
                        config: wrapper.clone(),
                    }
                } else {
                    WrapperTrafficPolicy {
                        traffic_policy: Some(TrafficPolicy::default()),
                        port_traffic_policy: None,
                        config: wrapper.clone(),
                    }
                }
            });
        }
        return Ok(());
    }

    if backend.service_name.is_empty() {
        return Ok(());
    }
    let port = backend_port(ctx, namespace, backend).ok_or_else(|| {
        PorttiError::BackendResolution(format!(
            "port of service {}/{} cannot be resolved",
            namespace, backend.service_name
        ))
    })?;
    let key = ServiceKey {
        namespace: namespace.clone(),
        name: backend.service_name.clone(),
        port: i32::try_from(port).unwrap_or_default(),
        service_fqdn: String::new(),
    };
    store.entry(key).or_insert_with(|| WrapperTrafficPolicy {
        traffic_policy: None,
        port_traffic_policy: Some(PortTrafficPolicy {
            port: Some(PortSelector { number: port }),
            ..Default::default()
        }),
        config: wrapper.clone(),
    });
    Ok(())
}

pub fn convert_traffic_policy(
    ctx: &AdapterContext,
    options: &mut ConvertOptions,
    wrapper: &Arc<WrapperConfig>,
) -> Result<()> {
    if !wrapper.annotations.needs_traffic_policy() {
        return Ok(());
    }
    let spec = standard_spec(wrapper)?;
    check_not_empty(ctx, wrapper, spec)?;

    let backends = spec.default_backend.iter().chain(
        spec.rules
            .iter()
            .filter_map(IngressRule::http_paths)
            .flatten()
            .map(|path| &path.backend),
    );
    for backend in backends {
        if let Err(e) = store_backend_traffic_policy(ctx, wrapper, backend, &mut options.service_traffic_policy) {
            error!(
                "Failed to store traffic policy of ingress {}: {}",
                wrapper.meta().key(),
                e
            );
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn path(path: &str, path_type: Option<IngressPathType>) -> IngressPath {
        IngressPath {
            path: path.to_string(),
            path_type,
            backend: IngressBackend::default(),
        }
    }

    #[test]
    fn test_defaults() {
        let spec = StandardIngressSpec {
            tls: vec![IngressTls {
                hosts: vec![],
                secret_name: "tls".to_string(),
            }],
            rules: vec![IngressRule {
                host: String::new(),
                paths: Some(vec![
                    path("", None),
                    path("/static/*", None),
                    path("/api.*", None),
                    path("/impl", Some(IngressPathType::ImplementationSpecific)),
                ]),
            }],
            ..Default::default()
        }
        .with_defaults(false);

        assert_eq!(spec.tls[0].hosts, vec!["*"]);
        let rule = &spec.rules[0];
        assert_eq!(rule.host, "*");
        let paths = rule.paths.as_ref().unwrap();
        let rendered: Vec<(&str, Option<IngressPathType>)> =
            paths.iter().map(|p| (p.path.as_str(), p.path_type)).collect();
        assert_eq!(
            rendered,
            vec![
                ("/", Some(IngressPathType::Prefix)),
                ("/static", Some(IngressPathType::Prefix)),
                ("/api", Some(IngressPathType::Prefix)),
                ("/impl", Some(IngressPathType::Prefix)),
            ]
        );
    }

    #[test]
    fn test_regex_paths_keep_globs() {
        let spec = StandardIngressSpec {
            rules: vec![IngressRule {
                host: "a.com".to_string(),
                paths: Some(vec![path("/api.*", None)]),
            }],
            ..Default::default()
        }
        .with_defaults(true);
        assert_eq!(spec.rules[0].paths.as_ref().unwrap()[0].path, "/api.*");
    }

    #[test]
    fn test_prefix_matches_avoid_regex() {
        let matches = generate_http_matches(PathType::Prefix, "/api/", None);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].uri, Some(StringMatch::Exact("/api".to_string())));
        assert_eq!(matches[1].uri, Some(StringMatch::Prefix("/api/".to_string())));
    }

    #[test]
    fn test_regex_matches_are_anchored() {
        let prefix = generate_http_matches(PathType::PrefixRegex, "/d(.*)", None);
        assert_eq!(prefix[0].uri, Some(StringMatch::Regex("/d(.*).*".to_string())));
        let full = generate_http_matches(PathType::FullPathRegex, "/d/[0-9]+", None);
        assert_eq!(full[0].uri, Some(StringMatch::Regex("/d/[0-9]+$".to_string())));
    }

    #[test]
    fn test_root_prefix_marks_default_backend_configured() {
        let mut vs = WrapperVirtualService::new(
            crate::ingress::model::tests::wrapper("default", "echo"),
            "a.com",
        );
        let matches = generate_http_matches(PathType::Prefix, "/", Some(&mut vs));
        assert_eq!(matches.len(), 1);
        assert!(vs.configured_default_backend);
    }

    #[test]
    fn test_extract_tls_secret_name() {
        let tls = vec![
            IngressTls {
                hosts: vec!["a.com".to_string()],
                secret_name: "a".to_string(),
            },
            IngressTls {
                hosts: vec!["b.com".to_string(), "a.com".to_string()],
                secret_name: "b".to_string(),
            },
        ];
        assert_eq!(extract_tls_secret_name("a.com", &tls), "a");
        assert_eq!(extract_tls_secret_name("b.com", &tls), "b");
        assert_eq!(extract_tls_secret_name("c.com", &tls), "");
    }

    #[test]
    fn test_registry_backend_sentinel() {
        let sentinel = TypedLocalObjectReference {
            api_group: Some(MCP_BRIDGE_API_GROUP.to_string()),
            kind: MCP_BRIDGE_KIND.to_string(),
            name: MCP_BRIDGE_NAME.to_string(),
        };
        assert!(is_registry_backend(&sentinel));
        let other = TypedLocalObjectReference {
            api_group: Some("storage.k8s.io".to_string()),
            kind: "Bucket".to_string(),
            name: "default".to_string(),
        };
        assert!(!is_registry_backend(&other));
    }
}
