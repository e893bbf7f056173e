//! Configuration store
//!
//! [`IngressConfigStore`] answers listing requests from the discovery layer.
//! Each request for a gateway, virtual service or destination rule listing
//! runs one full pass: list every adapter, parse annotations, convert,
//! merge, order and emit. A pass owns its [`ConvertOptions`]; only the
//! diagnostics, the basic-auth filter and the plugin set outlive it.

use crate::annotations::destination::MCP_NAMESPACE;
use crate::annotations::fallback::{FALLBACK_ROUTE_HEADER, FALLBACK_ROUTE_SUFFIX, FALLBACK_SERVICE_HEADER};
use crate::annotations::{
    AnnotationConfig, AnnotationHandlerManager, GlobalContext, CLUSTER_ID_ANNOTATION, HOST_ANNOTATION,
    RAW_CLUSTER_ID_ANNOTATION,
};
use crate::apis::metrics::record_conversion_pass;
use crate::error::{PorttiError, Result};
use crate::ingress::cache::{IngressDomainCollection, IngressRouteCollection};
use crate::ingress::dialect::IngressAdapter;
use crate::ingress::events::{synthetic_meta, Event, EventHandler, HandlerRegistry};
use crate::ingress::model::{
    sort_by_creation_time, ConvertOptions, PathType, RawConfig, WrapperConfig, WrapperHttpRoute, DEFAULT_PATH,
};
use crate::ingress::ordering::sort_routes;
use crate::ingress::secret_tracker::SecretTracker;
use crate::ingress::weights::normalize_weights;
use crate::sync::{safe_read, safe_write};
use common::{
    clean_host, create_converted_name, service_fqdn, ConfigKind, ConfigMeta, ConfigObject, ConfigSpec, Destination,
    DestinationRule, EnvoyConfigPatch, EnvoyFilter, HttpMatchRequest, HttpRedirect, HttpRouteDestination,
    PatchValue, PluginConfig, PortSelector, ServiceEntry, StringMatch, TrafficPolicy, VirtualService,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Prefix of every emitted object name
pub const GATEWAY_NAME_PREFIX: &str = "portti";

/// Cluster id of a single-cluster deployment, left out of object names
const LOCAL_CLUSTER_ID: &str = "Kubernetes";

const APP_ROOT_SUFFIX: &str = "app-root";
const APP_ROOT_REDIRECT_CODE: u32 = 302;

const BASIC_AUTH_FILTER: &str = "basic-auth";

/// Registry-provided services, emitted as service entries
pub trait ServiceEntrySource: Send + Sync {
    fn service_entries(&self) -> Vec<ServiceEntry>;
}

/// What readers see between passes
#[derive(Default)]
struct Snapshot {
    routes: IngressRouteCollection,
    domains: IngressDomainCollection,
    envoy_filters: Vec<ConfigObject>,
}

#[derive(Serialize)]
struct BasicAuthRule {
    realm: String,
    #[serde(rename = "_match_route_")]
    match_route: Vec<String>,
    credentials: Vec<String>,
    encrypted: bool,
}

#[derive(Serialize)]
struct BasicAuthRules {
    #[serde(rename = "_rules_")]
    rules: Vec<BasicAuthRule>,
}

/// Orchestrates conversion across every cluster and dialect
pub struct IngressConfigStore {
    system_namespace: String,
    /// Empty for the local cluster
    cluster_id: String,
    adapters: RwLock<Vec<Arc<IngressAdapter>>>,
    annotation_handler: AnnotationHandlerManager,
    handlers: Arc<HandlerRegistry>,
    secret_tracker: Arc<SecretTracker>,
    service_entries: Option<Arc<dyn ServiceEntrySource>>,
    snapshot: RwLock<Snapshot>,
    plugins: RwLock<BTreeMap<String, PluginConfig>>,
}

impl IngressConfigStore {
    pub fn new(
        system_namespace: &str,
        cluster_id: &str,
        handlers: Arc<HandlerRegistry>,
        secret_tracker: Arc<SecretTracker>,
    ) -> Self {
        let cluster_id = if cluster_id == LOCAL_CLUSTER_ID { "" } else { cluster_id };
        Self {
            system_namespace: system_namespace.to_string(),
            cluster_id: cluster_id.to_string(),
            adapters: RwLock::new(Vec::new()),
            annotation_handler: AnnotationHandlerManager::new(),
            handlers,
            secret_tracker,
            service_entries: None,
            snapshot: RwLock::new(Snapshot::default()),
            plugins: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn with_service_entry_source(mut self, source: Arc<dyn ServiceEntrySource>) -> Self {
        self.service_entries = Some(source);
        self
    }

    /// Register the adapter of one dialect of one cluster
    pub fn add_adapter(&self, adapter: IngressAdapter) -> Arc<IngressAdapter> {
        info!(
            "Adding {} adapter for cluster {}",
            adapter.dialect(),
            adapter.cluster_id()
        );
        let adapter = Arc::new(adapter);
        safe_write(&self.adapters).push(adapter.clone());
        adapter
    }

    pub fn register_event_handler(&self, kind: ConfigKind, handler: EventHandler) {
        info!("Registering event handler for {}", kind);
        self.handlers.register(kind, handler);
    }

    /// True once every adapter's listers finished their initial list
    pub fn has_synced(&self) -> bool {
        let synced = safe_read(&self.adapters).iter().all(|adapter| adapter.has_synced());
        if synced {
            debug!("Ingress config store synced");
        }
        synced
    }

    pub fn get_ingress_routes(&self) -> IngressRouteCollection {
        safe_read(&self.snapshot).routes.clone()
    }

    pub fn get_ingress_domains(&self) -> IngressDomainCollection {
        safe_read(&self.snapshot).domains.clone()
    }

    /// Forward a secret change (`cluster/namespace/name`) to the dependency tracker
    pub fn handle_secret_change(&self, secret: &str) -> bool {
        self.secret_tracker.handle_secret_change(secret)
    }

    /// List every object of `kind`. Only cluster-wide listing is supported.
    pub fn list(&self, kind: ConfigKind, namespace: &str) -> Result<Vec<ConfigObject>> {
        if !namespace.is_empty() {
            warn!("Ingress store only lists {} across all namespaces", kind);
            return Err(PorttiError::unsupported(format!(
                "list {} in namespace {}",
                kind, namespace
            )));
        }

        let out = match kind {
            ConfigKind::Gateway => self.run_pass(kind, |wrappers| self.convert_gateways(wrappers)),
            ConfigKind::VirtualService => {
                self.run_pass(kind, |wrappers| self.convert_virtual_services(wrappers))
            }
            ConfigKind::DestinationRule => {
                self.run_pass(kind, |wrappers| self.convert_destination_rules(wrappers))
            }
            ConfigKind::EnvoyFilter => safe_read(&self.snapshot).envoy_filters.clone(),
            ConfigKind::ServiceEntry => self.convert_service_entries(),
            ConfigKind::PluginConfig => self.convert_plugins(),
        };
        info!("Resource type {}, configs number {}", kind, out.len());
        Ok(out)
    }

    fn run_pass<F>(&self, kind: ConfigKind, convert: F) -> Vec<ConfigObject>
    where
        F: FnOnce(&[Arc<WrapperConfig>]) -> Vec<ConfigObject>,
    {
        let start = Instant::now();
        let wrappers = self.create_wrapper_configs(self.list_raw_configs());
        let out = convert(&wrappers);
        record_conversion_pass(kind.as_str(), start.elapsed().as_secs_f64());
        out
    }

    fn adapters(&self) -> Vec<Arc<IngressAdapter>> {
        safe_read(&self.adapters).clone()
    }

    fn adapter_for(&self, wrapper: &WrapperConfig) -> Option<Arc<IngressAdapter>> {
        let meta = wrapper.meta();
        safe_read(&self.adapters)
            .iter()
            .find(|adapter| adapter.cluster_id() == meta.cluster_id && adapter.dialect() == wrapper.config.dialect)
            .cloned()
    }

    /// Every selected resource, oldest first
    fn list_raw_configs(&self) -> Vec<RawConfig> {
        let mut configs: Vec<RawConfig> = self.adapters().iter().flat_map(|adapter| adapter.list()).collect();
        sort_by_creation_time(&mut configs);
        configs
    }

    /// Parse annotations of every resource and refresh secret dependencies
    fn create_wrapper_configs(&self, configs: Vec<RawConfig>) -> Vec<Arc<WrapperConfig>> {
        let mut ctx = GlobalContext::default();
        for adapter in self.adapters() {
            let listers = &adapter.context().listers;
            ctx.cluster_secret_listers
                .entry(adapter.cluster_id().to_string())
                .or_insert_with(|| listers.secrets.clone());
            ctx.cluster_service_listers
                .entry(adapter.cluster_id().to_string())
                .or_insert_with(|| listers.services.clone());
        }

        let mut observed: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut wrappers = Vec::with_capacity(configs.len());
        for raw in configs {
            let meta = &raw.meta;
            let mut annotations = AnnotationConfig::new(&meta.cluster_id, &meta.namespace, &meta.name);
            self.annotation_handler.parse(&meta.annotations, &mut annotations, &mut ctx);
            if !annotations.referenced_secrets.is_empty() {
                observed
                    .entry(format!("{}/{}", meta.cluster_id, meta.key()))
                    .or_default()
                    .extend(annotations.referenced_secrets.iter().cloned());
            }
            wrappers.push(Arc::new(WrapperConfig {
                config: Arc::new(raw),
                annotations,
            }));
        }

        self.secret_tracker.set_watched(ctx.watched_secrets);
        self.secret_tracker.refresh(&observed);
        wrappers
    }

    fn object(&self, kind: ConfigKind, name: String, annotations: BTreeMap<String, String>, spec: ConfigSpec) -> ConfigObject {
        let mut meta = ConfigMeta::new(kind, self.system_namespace.clone(), name);
        meta.annotations = annotations;
        ConfigObject { meta, spec }
    }

    fn convert_gateways(&self, wrappers: &[Arc<WrapperConfig>]) -> Vec<ConfigObject> {
        let mut options = ConvertOptions::default();
        for wrapper in wrappers {
            let Some(adapter) = self.adapter_for(wrapper) else {
                continue;
            };
            if let Err(e) = adapter.convert_gateway(&mut options, wrapper) {
                let meta = wrapper.meta();
                error!(
                    "Failed to convert ingress {}/{} to gateway within cluster {}: {}",
                    meta.namespace, meta.name, meta.cluster_id, e
                );
            }
        }

        for gateway in options.gateways.values_mut() {
            let mut annotations = gateway.config.annotations.clone();
            annotations.downstream_tls = gateway.downstream_tls.clone();
            self.annotation_handler.apply_gateway(&mut gateway.gateway, &annotations);
        }

        safe_write(&self.snapshot).domains = options.domain_cache.extract();

        options
            .gateways
            .into_iter()
            .map(|(host, gateway)| {
                let annotations = BTreeMap::from([
                    (CLUSTER_ID_ANNOTATION.to_string(), gateway.cluster_id.clone()),
                    (
                        RAW_CLUSTER_ID_ANNOTATION.to_string(),
                        gateway.config.meta().raw_cluster_id.clone(),
                    ),
                    (HOST_ANNOTATION.to_string(), host.clone()),
                ]);
                self.object(
                    ConfigKind::Gateway,
                    create_converted_name(&[GATEWAY_NAME_PREFIX, clean_host(&host).as_str()]),
                    annotations,
                    ConfigSpec::Gateway(gateway.gateway),
                )
            })
            .collect()
    }

    fn convert_virtual_services(&self, wrappers: &[Arc<WrapperConfig>]) -> Vec<ConfigObject> {
        let mut options = ConvertOptions::default();
        for wrapper in wrappers {
            let Some(adapter) = self.adapter_for(wrapper) else {
                continue;
            };
            if let Err(e) = adapter.convert_http_route(&mut options, wrapper) {
                let meta = wrapper.meta();
                error!(
                    "Failed to convert ingress {}/{} to HTTP routes within cluster {}: {}",
                    meta.namespace, meta.name, meta.cluster_id, e
                );
            }
        }

        for routes in options.http_routes.values_mut() {
            for route in routes.iter_mut() {
                self.annotation_handler.apply_route(&mut route.route, &route.config.annotations);
            }
        }

        if wrappers.len() > options.canary_ingresses.len() {
            self.apply_canary_ingresses(&mut options);
        }

        for routes in options.http_routes.values_mut() {
            for route in routes.iter_mut() {
                let split = route.route.route.len() > 1;
                normalize_weights(route);
                if split {
                    options.route_cache.update(route);
                }
            }
        }

        if options.has_default_backend {
            for wrapper in wrappers {
                let Some(adapter) = self.adapter_for(wrapper) else {
                    continue;
                };
                if let Err(e) = adapter.apply_default_backend(&mut options, wrapper) {
                    let meta = wrapper.meta();
                    error!(
                        "Failed to apply default backend of ingress {}/{} within cluster {}: {}",
                        meta.namespace, meta.name, meta.cluster_id, e
                    );
                }
            }
        }

        apply_app_root(&mut options);
        apply_internal_active_redirect(&mut options);

        safe_write(&self.snapshot).routes = options.route_cache.extract();

        let mut out = Vec::with_capacity(options.http_routes.len());
        for (host, routes) in options.http_routes.iter_mut() {
            if routes.is_empty() {
                continue;
            }
            sort_routes(routes);

            let cleaned = clean_host(host);
            let mut virtual_service = match options.virtual_services.get(host) {
                Some(wrapper) => wrapper.virtual_service.clone(),
                None => {
                    warn!("Virtual service of host {} does not exist", host);
                    VirtualService {
                        hosts: vec![host.clone()],
                        ..Default::default()
                    }
                }
            };
            virtual_service.gateways = vec![
                format!(
                    "{}/{}",
                    self.system_namespace,
                    create_converted_name(&[self.cluster_id.as_str(), cleaned.as_str()])
                ),
                create_converted_name(&[GATEWAY_NAME_PREFIX, cleaned.as_str()]),
            ];
            virtual_service.http = routes.iter().map(|route| route.route.clone()).collect();

            let first = &routes[0];
            let owner = first.config.meta();
            let annotations = BTreeMap::from([
                (CLUSTER_ID_ANNOTATION.to_string(), first.cluster_id.clone()),
                (RAW_CLUSTER_ID_ANNOTATION.to_string(), owner.raw_cluster_id.clone()),
            ]);
            out.push(self.object(
                ConfigKind::VirtualService,
                create_converted_name(&[
                    GATEWAY_NAME_PREFIX,
                    owner.namespace.as_str(),
                    owner.name.as_str(),
                    cleaned.as_str(),
                ]),
                annotations,
                ConfigSpec::VirtualService(virtual_service),
            ));
        }

        self.convert_envoy_filters(&options);
        out
    }

    fn apply_canary_ingresses(&self, options: &mut ConvertOptions) {
        if options.canary_ingresses.is_empty() {
            return;
        }
        info!("Found {} canary ingresses", options.canary_ingresses.len());
        let canaries = std::mem::take(&mut options.canary_ingresses);
        for canary in &canaries {
            let Some(adapter) = self.adapter_for(canary) else {
                continue;
            };
            if let Err(e) = adapter.apply_canary_ingress(options, canary) {
                let meta = canary.meta();
                error!(
                    "Failed to apply canary ingress {}/{} within cluster {}: {}",
                    meta.namespace, meta.name, meta.cluster_id, e
                );
            }
        }
        options.canary_ingresses = canaries;
    }

    /// Build the basic-auth filter patch from the routes of a virtual service pass
    fn convert_envoy_filters(&self, options: &ConvertOptions) {
        let mut mappings: BTreeMap<String, BasicAuthRule> = BTreeMap::new();
        for route in options.http_routes.values().flatten() {
            if route.route.name.ends_with(APP_ROOT_SUFFIX) {
                continue;
            }
            let Some(auth) = &route.auth else {
                continue;
            };
            let key = format!(
                "{}/{}/{}",
                auth.secret_cluster_id,
                auth.secret_key(),
                auth.auth_realm
            );
            mappings
                .entry(key)
                .or_insert_with(|| BasicAuthRule {
                    realm: auth.auth_realm.clone(),
                    match_route: Vec::new(),
                    credentials: auth.credentials.clone(),
                    encrypted: true,
                })
                .match_route
                .push(route.route.name.clone());
        }

        info!("Found {} basic auth rules", mappings.len());
        let mut filters = Vec::new();
        if !mappings.is_empty() {
            let rules = BasicAuthRules {
                rules: mappings.into_values().collect(),
            };
            match self.basic_auth_filter(&rules) {
                Ok(filter) => filters.push(filter),
                Err(e) => error!("Failed to construct basic auth filter: {}", e),
            }
        }
        safe_write(&self.snapshot).envoy_filters = filters;
    }

    fn basic_auth_filter(&self, rules: &BasicAuthRules) -> Result<ConfigObject> {
        let configuration = serde_json::to_string(rules)?;
        let value = serde_json::json!({
            "name": BASIC_AUTH_FILTER,
            "typed_config": {
                "@type": "type.googleapis.com/udpa.type.v1.TypedStruct",
                "type_url": "type.googleapis.com/envoy.extensions.filters.http.wasm.v3.Wasm",
                "value": {
                    "config": {
                        "name": BASIC_AUTH_FILTER,
                        "fail_open": true,
                        "vm_config": {
                            "runtime": "envoy.wasm.runtime.null",
                            "code": {"local": {"inline_string": "envoy.wasm.basic_auth"}}
                        },
                        "configuration": {
                            "@type": "type.googleapis.com/google.protobuf.StringValue",
                            "value": configuration
                        }
                    }
                }
            }
        });
        let filter = EnvoyFilter {
            config_patches: vec![EnvoyConfigPatch {
                apply_to: "HTTP_FILTER".to_string(),
                match_spec: serde_json::json!({
                    "context": "GATEWAY",
                    "listener": {
                        "filterChain": {
                            "filter": {
                                "name": "envoy.filters.network.http_connection_manager",
                                "subFilter": {"name": "envoy.filters.http.cors"}
                            }
                        }
                    }
                }),
                patch: PatchValue {
                    operation: "INSERT_AFTER".to_string(),
                    value,
                },
            }],
        };
        Ok(self.object(
            ConfigKind::EnvoyFilter,
            create_converted_name(&[GATEWAY_NAME_PREFIX, BASIC_AUTH_FILTER]),
            BTreeMap::new(),
            ConfigSpec::EnvoyFilter(filter),
        ))
    }

    fn convert_destination_rules(&self, wrappers: &[Arc<WrapperConfig>]) -> Vec<ConfigObject> {
        let mut options = ConvertOptions::default();
        for wrapper in wrappers {
            let Some(adapter) = self.adapter_for(wrapper) else {
                continue;
            };
            if let Err(e) = adapter.convert_traffic_policy(&mut options, wrapper) {
                let meta = wrapper.meta();
                error!(
                    "Failed to convert ingress {}/{} to destination rule within cluster {}: {}",
                    meta.namespace, meta.name, meta.cluster_id, e
                );
            }
        }
        debug!("Traffic policy number {}", options.service_traffic_policy.len());

        for policy in options.service_traffic_policy.values_mut() {
            let annotations = &policy.config.annotations;
            if let Some(port_policy) = policy.port_traffic_policy.as_mut() {
                self.annotation_handler.apply_traffic_policy(
                    &mut port_policy.load_balancer,
                    &mut port_policy.tls,
                    annotations,
                );
            } else if let Some(service_policy) = policy.traffic_policy.as_mut() {
                self.annotation_handler.apply_traffic_policy(
                    &mut service_policy.load_balancer,
                    &mut service_policy.tls,
                    annotations,
                );
            }
        }

        // one destination rule per service, port policies merged into it
        let mut rules: BTreeMap<String, (String, DestinationRule)> = BTreeMap::new();
        for (key, policy) in options.service_traffic_policy {
            let host = if key.service_fqdn.is_empty() {
                service_fqdn(&key.namespace, &key.name)
            } else {
                key.service_fqdn.clone()
            };
            match rules.get_mut(&host) {
                None => {
                    let traffic_policy = match (policy.port_traffic_policy, policy.traffic_policy) {
                        (Some(port_policy), _) => TrafficPolicy {
                            port_level_settings: vec![port_policy],
                            ..Default::default()
                        },
                        (None, Some(service_policy)) => service_policy,
                        (None, None) => TrafficPolicy::default(),
                    };
                    let name = create_converted_name(&[
                        GATEWAY_NAME_PREFIX.to_string(),
                        create_converted_name(&[self.cluster_id.as_str(), key.namespace.as_str(), key.name.as_str()]),
                    ]);
                    rules.insert(
                        host.clone(),
                        (
                            name,
                            DestinationRule {
                                host,
                                traffic_policy: Some(traffic_policy),
                            },
                        ),
                    );
                }
                Some((_, rule)) => {
                    if let (Some(port_policy), Some(traffic_policy)) =
                        (policy.port_traffic_policy, rule.traffic_policy.as_mut())
                    {
                        traffic_policy.port_level_settings.push(port_policy);
                    }
                }
            }
        }

        rules
            .into_values()
            .map(|(name, mut rule)| {
                if let Some(traffic_policy) = rule.traffic_policy.as_mut() {
                    // port-less settings first, then ascending port
                    traffic_policy
                        .port_level_settings
                        .sort_by_key(|setting| setting.port.as_ref().map(|port| port.number));
                }
                self.object(
                    ConfigKind::DestinationRule,
                    name,
                    BTreeMap::new(),
                    ConfigSpec::DestinationRule(rule),
                )
            })
            .collect()
    }

    fn convert_service_entries(&self) -> Vec<ConfigObject> {
        let Some(source) = &self.service_entries else {
            return Vec::new();
        };
        source
            .service_entries()
            .into_iter()
            .filter_map(|entry| {
                let name = entry.hosts.first()?.clone();
                Some(ConfigObject {
                    meta: ConfigMeta::new(ConfigKind::ServiceEntry, MCP_NAMESPACE, name),
                    spec: ConfigSpec::ServiceEntry(entry),
                })
            })
            .collect()
    }

    fn convert_plugins(&self) -> Vec<ConfigObject> {
        safe_read(&self.plugins)
            .iter()
            .map(|(name, plugin)| {
                self.object(
                    ConfigKind::PluginConfig,
                    name.clone(),
                    BTreeMap::new(),
                    ConfigSpec::PluginConfig(plugin.clone()),
                )
            })
            .collect()
    }

    /// Store a plugin of the system namespace and tell the plugin handlers
    pub fn add_or_update_plugin(&self, namespace: &str, name: &str, plugin: PluginConfig) {
        if namespace != self.system_namespace {
            debug!("Ignoring plugin {}/{} outside the system namespace", namespace, name);
            return;
        }
        let meta = synthetic_meta(ConfigKind::PluginConfig, namespace, name);
        self.handlers.notify(&meta, Event::Update);
        safe_write(&self.plugins).insert(name.to_string(), plugin);
    }

    pub fn delete_plugin(&self, namespace: &str, name: &str) {
        if namespace != self.system_namespace {
            return;
        }
        let removed = safe_write(&self.plugins).remove(name).is_some();
        if removed {
            let meta = synthetic_meta(ConfigKind::PluginConfig, namespace, name);
            self.handlers.notify(&meta, Event::Delete);
        }
    }
}

/// Prepend a redirect from `/` to the app root of every host that has one
fn apply_app_root(options: &mut ConvertOptions) {
    for (host, vs) in &options.virtual_services {
        if vs.app_root.is_empty() {
            continue;
        }
        let mut route = WrapperHttpRoute::new(vs.config.clone(), host, &vs.config.annotations.cluster_id);
        route.origin_path = DEFAULT_PATH.to_string();
        route.origin_path_type = PathType::Exact;
        route.route.name = create_converted_name(&[host.as_str(), APP_ROOT_SUFFIX]);
        route.route.matches = vec![HttpMatchRequest {
            uri: Some(StringMatch::Exact(DEFAULT_PATH.to_string())),
            ..Default::default()
        }];
        route.route.redirect = Some(HttpRedirect {
            uri: Some(vs.app_root.clone()),
            redirect_code: APP_ROOT_REDIRECT_CODE,
            ..Default::default()
        });
        options
            .http_routes
            .entry(host.clone())
            .or_default()
            .insert(0, route);
    }
}

/// Companion route that serves the fallback service once the proxy redirects internally
fn fallback_route(route: &WrapperHttpRoute) -> Option<WrapperHttpRoute> {
    route.route.internal_active_redirect.as_ref()?;
    let fallback = route.config.annotations.fallback.as_ref()?;

    let mut companion = WrapperHttpRoute::new(route.config.clone(), &route.host, &route.cluster_id);
    companion.origin_path = DEFAULT_PATH.to_string();
    companion.origin_path_type = PathType::Exact;
    companion.auth = route.auth.clone();
    companion.route = route.route.clone();
    companion.route.name = format!("{}{}", route.route.name, FALLBACK_ROUTE_SUFFIX);
    companion.route.internal_active_redirect = None;

    let headers = BTreeMap::from([
        (
            FALLBACK_ROUTE_HEADER.to_string(),
            StringMatch::Exact(companion.route.name.clone()),
        ),
        (
            FALLBACK_SERVICE_HEADER.to_string(),
            StringMatch::Exact(fallback.service_key()),
        ),
    ]);
    companion.route.matches = vec![HttpMatchRequest {
        uri: Some(StringMatch::Exact(DEFAULT_PATH.to_string())),
        headers,
        ..Default::default()
    }];
    companion.route.route = vec![HttpRouteDestination {
        destination: Destination {
            host: service_fqdn(&fallback.namespace, &fallback.service),
            port: Some(PortSelector { number: fallback.port }),
            subset: None,
        },
        weight: 100,
        headers: None,
    }];
    Some(companion)
}

fn apply_internal_active_redirect(options: &mut ConvertOptions) {
    for routes in options.http_routes.values_mut() {
        let mut merged = Vec::with_capacity(routes.len());
        let mut companions = Vec::new();
        for route in routes.drain(..) {
            if let Some(companion) = fallback_route(&route) {
                companions.push(companion);
            }
            merged.push(route);
        }
        companions.reverse();
        companions.extend(merged);
        *routes = companions;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::apis::listers::{ClusterListers, Lister};
    use crate::config::ControllerConfig;
    use crate::ingress::dialect::AdapterContext;
    use crate::ingress::model::IngressDialect;
    use common::{LoadBalancerSettings, SimpleLb};
    use k8s_openapi::api::core::v1::{Secret, Service};
    use k8s_openapi::api::networking::v1::Ingress;
    use std::sync::Mutex;

    fn ingress(name: &str, annotations: serde_json::Value, spec: serde_json::Value) -> Ingress {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": {"name": name, "namespace": "default", "annotations": annotations},
            "spec": spec
        }))
        .unwrap()
    }

    fn simple_spec(host: &str, path: &str, service: &str, port: i32) -> serde_json::Value {
        serde_json::json!({
            "rules": [{
                "host": host,
                "http": {"paths": [{
                    "path": path,
                    "pathType": "Prefix",
                    "backend": {"service": {"name": service, "port": {"number": port}}}
                }]}
            }]
        })
    }

    fn service(name: &str, port: i32) -> Service {
        serde_json::from_value(serde_json::json!({
            "metadata": {"name": name, "namespace": "default"},
            "spec": {"ports": [{"name": "http", "port": port}]}
        }))
        .unwrap()
    }

    fn store(ingresses: Vec<Ingress>, services: Vec<Service>, secrets: Vec<Secret>) -> IngressConfigStore {
        let config = ControllerConfig {
            cluster_id: "c1".to_string(),
            ingress_class: "*".to_string(),
            ..Default::default()
        };
        let mut listers = ClusterListers::empty();
        listers.ingresses = Lister::from_objects(ingresses);
        listers.services = Lister::from_objects(services);
        listers.secrets = Lister::from_objects(secrets);

        let handlers = Arc::new(HandlerRegistry::default());
        let store = IngressConfigStore::new(
            &config.system_namespace,
            &config.cluster_id,
            handlers.clone(),
            Arc::new(SecretTracker::new(None)),
        );
        let ctx = AdapterContext {
            options: config.cluster_options(),
            listers,
            https_credentials: None,
            knative_ingress_class: config.knative_ingress_class.clone(),
        };
        store.add_adapter(IngressAdapter::new(IngressDialect::V1, ctx, handlers));
        store
    }

    fn virtual_services(store: &IngressConfigStore) -> Vec<(ConfigMeta, VirtualService)> {
        store
            .list(ConfigKind::VirtualService, "")
            .unwrap()
            .into_iter()
            .map(|object| match object.spec {
                ConfigSpec::VirtualService(vs) => (object.meta, vs),
                other => panic!("expected a virtual service, got {:?}", other.kind()),
            })
            .collect()
    }

    #[test]
    fn test_namespaced_listing_is_unsupported() {
        let store = store(vec![], vec![], vec![]);
        let err = store.list(ConfigKind::Gateway, "default").unwrap_err();
        assert!(matches!(err, PorttiError::UnsupportedOperation(_)));
    }

    #[test]
    fn test_gateway_objects_are_named_by_host() {
        let echo = ingress("echo", serde_json::json!({}), simple_spec("a.example.com", "/", "echo", 80));
        let store = store(vec![echo], vec![], vec![]);

        let gateways = store.list(ConfigKind::Gateway, "").unwrap();
        assert_eq!(gateways.len(), 1);
        let meta = &gateways[0].meta;
        assert_eq!(meta.name, format!("portti-{}", clean_host("a.example.com")));
        assert_eq!(meta.namespace, "portti-system");
        assert_eq!(meta.annotations.get(HOST_ANNOTATION).unwrap(), "a.example.com");
        assert_eq!(meta.annotations.get(CLUSTER_ID_ANNOTATION).unwrap(), "c1");

        let domains = store.get_ingress_domains();
        assert_eq!(domains.valid.len(), 1);
        assert!(domains.invalid.is_empty());
    }

    #[test]
    fn test_virtual_service_gateways_and_name() {
        let echo = ingress("echo", serde_json::json!({}), simple_spec("a.example.com", "/api", "echo", 80));
        let store = store(vec![echo], vec![], vec![]);

        let vss = virtual_services(&store);
        assert_eq!(vss.len(), 1);
        let (meta, vs) = &vss[0];
        let cleaned = clean_host("a.example.com");
        assert_eq!(meta.name, format!("portti-default-echo-{}", cleaned));
        assert_eq!(
            vs.gateways,
            vec![format!("portti-system/c1-{}", cleaned), format!("portti-{}", cleaned)]
        );
        assert_eq!(vs.http.len(), 1);
        assert_eq!(vs.http[0].route[0].weight, 100);
        assert_eq!(store.get_ingress_routes().valid.len(), 1);
    }

    #[test]
    fn test_app_root_route_is_added() {
        let echo = ingress(
            "echo",
            serde_json::json!({"portti.io/app-root": "/app"}),
            simple_spec("a.example.com", "/api", "echo", 80),
        );
        let store = store(vec![echo], vec![], vec![]);

        let (_, vs) = virtual_services(&store).remove(0);
        let app_root = vs
            .http
            .iter()
            .find(|route| route.name == "a.example.com-app-root")
            .expect("App root route should be emitted");
        let redirect = app_root.redirect.as_ref().unwrap();
        assert_eq!(redirect.uri.as_deref(), Some("/app"));
        assert_eq!(redirect.redirect_code, 302);
        assert_eq!(
            app_root.matches[0].uri,
            Some(StringMatch::Exact("/".to_string()))
        );
    }

    #[test]
    fn test_fallback_companion_route() {
        let echo = ingress(
            "echo",
            serde_json::json!({"portti.io/default-backend": "errors"}),
            simple_spec("a.example.com", "/api", "echo", 80),
        );
        let store = store(vec![echo], vec![service("errors", 8080)], vec![]);

        let (_, vs) = virtual_services(&store).remove(0);
        assert_eq!(vs.http.len(), 2);
        let base = vs
            .http
            .iter()
            .find(|route| route.internal_active_redirect.is_some())
            .expect("Base route should redirect internally");
        let companion = vs
            .http
            .iter()
            .find(|route| route.name == format!("{}-fallback", base.name))
            .expect("Fallback route should be emitted");

        assert!(companion.internal_active_redirect.is_none());
        let predicate = &companion.matches[0];
        assert_eq!(
            predicate.headers.get(FALLBACK_ROUTE_HEADER),
            Some(&StringMatch::Exact(companion.name.clone()))
        );
        assert_eq!(
            predicate.headers.get(FALLBACK_SERVICE_HEADER),
            Some(&StringMatch::Exact("default/errors".to_string()))
        );
        assert_eq!(companion.route[0].destination.host, "errors.default.svc.cluster.local");
        assert_eq!(companion.route[0].destination.port, Some(PortSelector { number: 8080 }));
    }

    #[test]
    fn test_destination_rules_merge_ports_per_service() {
        let spec = serde_json::json!({
            "rules": [{
                "host": "a.example.com",
                "http": {"paths": [
                    {"path": "/b", "pathType": "Prefix",
                     "backend": {"service": {"name": "echo", "port": {"number": 9090}}}},
                    {"path": "/a", "pathType": "Prefix",
                     "backend": {"service": {"name": "echo", "port": {"number": 8080}}}}
                ]}
            }]
        });
        let echo = ingress("echo", serde_json::json!({"portti.io/load-balance": "least_conn"}), spec);
        let store = store(vec![echo], vec![], vec![]);

        let rules = store.list(ConfigKind::DestinationRule, "").unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].meta.name, "portti-c1-default-echo");
        let ConfigSpec::DestinationRule(rule) = &rules[0].spec else {
            panic!("expected a destination rule");
        };
        assert_eq!(rule.host, "echo.default.svc.cluster.local");
        let settings = &rule.traffic_policy.as_ref().unwrap().port_level_settings;
        let ports: Vec<u32> = settings.iter().map(|s| s.port.as_ref().unwrap().number).collect();
        assert_eq!(ports, vec![8080, 9090], "Port policies are sorted by port");
        assert!(settings
            .iter()
            .all(|s| s.load_balancer == Some(LoadBalancerSettings::Simple(SimpleLb::LeastConn))));
    }

    #[test]
    fn test_basic_auth_filter_and_secret_tracking() {
        let secret: Secret = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "basic", "namespace": "default"},
            "data": {"auth": "Ym9iOiRhcHIxJHg="}
        }))
        .unwrap();
        let echo = ingress(
            "echo",
            serde_json::json!({
                "portti.io/auth-type": "basic",
                "portti.io/auth-secret": "basic",
                "portti.io/auth-realm": "Restricted"
            }),
            simple_spec("a.example.com", "/", "echo", 80),
        );
        let store = store(vec![echo], vec![], vec![secret]);

        assert!(store.list(ConfigKind::EnvoyFilter, "").unwrap().is_empty());
        let (_, vs) = virtual_services(&store).remove(0);

        let filters = store.list(ConfigKind::EnvoyFilter, "").unwrap();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].meta.name, "portti-basic-auth");
        let ConfigSpec::EnvoyFilter(filter) = &filters[0].spec else {
            panic!("expected an envoy filter");
        };
        let configuration = filter.config_patches[0].patch.value["typed_config"]["value"]["config"]
            ["configuration"]["value"]
            .as_str()
            .unwrap();
        let rules: serde_json::Value = serde_json::from_str(configuration).unwrap();
        assert_eq!(rules["_rules_"][0]["realm"], "Restricted");
        assert_eq!(rules["_rules_"][0]["_match_route_"][0], vs.http[0].name.as_str());
        assert_eq!(rules["_rules_"][0]["credentials"][0], "bob:$apr1$x");

        assert!(store.handle_secret_change("c1/default/basic"));
        assert!(!store.handle_secret_change("c1/default/unrelated"));
    }

    #[test]
    fn test_plugins_notify_handlers() {
        let store = store(vec![], vec![], vec![]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        store.register_event_handler(
            ConfigKind::PluginConfig,
            Arc::new(move |meta: &ConfigMeta, event: Event| {
                recorder.lock().unwrap().push((meta.name.clone(), event));
            }),
        );

        store.add_or_update_plugin("portti-system", "cors", PluginConfig::default());
        store.add_or_update_plugin("default", "ignored", PluginConfig::default());
        assert_eq!(store.list(ConfigKind::PluginConfig, "").unwrap().len(), 1);

        store.delete_plugin("portti-system", "cors");
        store.delete_plugin("portti-system", "cors");
        assert!(store.list(ConfigKind::PluginConfig, "").unwrap().is_empty());

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("cors-pluginconfig".to_string(), Event::Update),
                ("cors-pluginconfig".to_string(), Event::Delete),
            ]
        );
    }

    struct StaticEntries;

    impl ServiceEntrySource for StaticEntries {
        fn service_entries(&self) -> Vec<ServiceEntry> {
            vec![
                ServiceEntry {
                    hosts: vec!["foo.dns".to_string()],
                    ..Default::default()
                },
                ServiceEntry::default(),
            ]
        }
    }

    #[test]
    fn test_service_entries_from_source() {
        let store = store(vec![], vec![], vec![]).with_service_entry_source(Arc::new(StaticEntries));
        let entries = store.list(ConfigKind::ServiceEntry, "").unwrap();
        assert_eq!(entries.len(), 1, "Entries without hosts are skipped");
        assert_eq!(entries[0].meta.name, "foo.dns");
        assert_eq!(entries[0].meta.namespace, "mcp");
    }
}
