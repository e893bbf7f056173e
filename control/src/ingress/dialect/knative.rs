//! Knative `networking.internal.knative.dev/v1alpha1` Ingress
//!
//! Rules carry several hosts and a visibility, paths are always prefixes and
//! backends are weighted splits. There is no canary, default backend or
//! traffic policy handling for this dialect.

use crate::apis::ingress::knative::{
    HttpOption, KnativeHttpIngressPath, KnativeIngressSpec, KnativeIngressTls, Visibility,
};
use crate::apis::ingress::{KnativeIngress, KNATIVE_INGRESS_CLASS_ANNOTATION};
use crate::apis::metrics::record_invalid_ingress;
use crate::error::{PorttiError, Result};
use crate::ingress::cache::{BackendService, IngressDomainBuilder};
use crate::ingress::dialect::standard::{attach_tls, ensure_gateway};
use crate::ingress::dialect::{AdapterContext, DialectResource};
use crate::ingress::model::{
    generate_unique_route_name, ConvertEvent, ConvertOptions, IngressDialect, IngressSpecKind,
    PathType, RawConfig, RuleOwner, WrapperConfig, WrapperHttpRoute, WrapperVirtualService,
};
use crate::ingress::rule_key::create_rule_key;
use common::{
    service_fqdn, Destination, HeaderOperations, Headers, HttpMatchRequest, HttpRoute,
    HttpRouteDestination, HttpRewrite, PortSelector, ServerTlsSettings, StringMatch, PROTOCOL_HTTP,
};
use kube::ResourceExt;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Listener port of cluster-local rules
pub const CLUSTER_LOCAL_PORT: u32 = 8081;

impl DialectResource for KnativeIngress {
    fn should_process(&self, ctx: &AdapterContext) -> bool {
        let class = self.annotations().get(KNATIVE_INGRESS_CLASS_ANNOTATION);
        if class.map(String::as_str) != Some(ctx.knative_ingress_class.as_str()) {
            debug!(
                "Knative ingress {}/{} has class {:?}, want {}",
                self.namespace().unwrap_or_default(),
                self.name_any(),
                class,
                ctx.knative_ingress_class
            );
            return false;
        }
        ctx.namespace_watched(&self.namespace().unwrap_or_default())
    }
}

pub fn list(ctx: &AdapterContext) -> Vec<RawConfig> {
    ctx.listers
        .knative_ingresses
        .list()
        .into_iter()
        .filter(|ingress| ingress.should_process(ctx))
        .map(|ingress| RawConfig {
            dialect: IngressDialect::Knative,
            meta: ctx.resource_meta(ingress.as_ref()),
            spec: IngressSpecKind::Knative(ingress.spec.clone()),
        })
        .collect()
}

fn knative_spec<'a>(ctx: &AdapterContext, wrapper: &'a WrapperConfig) -> Result<&'a KnativeIngressSpec> {
    let IngressSpecKind::Knative(spec) = &wrapper.config.spec else {
        record_invalid_ingress(&ctx.options.cluster_id, ConvertEvent::Unknown.as_str());
        return Err(PorttiError::invalid_resource(
            wrapper.meta().key(),
            "expected a Knative ingress spec",
        ));
    };
    if spec.rules.is_empty() {
        record_invalid_ingress(&ctx.options.cluster_id, ConvertEvent::EmptyRule.as_str());
        return Err(PorttiError::invalid_resource(
            wrapper.meta().key(),
            "rules must be specified",
        ));
    }
    Ok(spec)
}

/// Any rule reachable from outside the cluster
fn is_public(spec: &KnativeIngressSpec) -> bool {
    spec.rules
        .iter()
        .any(|rule| rule.visibility == Visibility::ExternalIP)
}

fn extract_tls<'a>(host: &str, tls: &'a [KnativeIngressTls]) -> Option<&'a KnativeIngressTls> {
    tls.iter().find(|entry| entry.hosts.iter().any(|h| h == host))
}

pub fn convert_gateway(
    ctx: &AdapterContext,
    options: &mut ConvertOptions,
    wrapper: &Arc<WrapperConfig>,
) -> Result<()> {
    let spec = knative_spec(ctx, wrapper)?;
    let meta = wrapper.meta();
    let cluster = &ctx.options;
    let public = is_public(spec);

    for rule in &spec.rules {
        let http_port = match rule.visibility {
            Visibility::ClusterLocal => CLUSTER_LOCAL_PORT,
            Visibility::ExternalIP => cluster.gateway_http_port,
        };
        for host in &rule.hosts {
            let domain = IngressDomainBuilder::new(host, meta.ingress_ref(), meta.creation_timestamp);
            ensure_gateway(cluster, options, wrapper, &domain, http_port);

            if public {
                if let Some(gateway) = options.gateways.get_mut(host) {
                    for server in &mut gateway.gateway.servers {
                        if server.port.protocol != PROTOCOL_HTTP {
                            continue;
                        }
                        server.tls = match spec.http_option {
                            HttpOption::Redirected => Some(ServerTlsSettings {
                                https_redirect: true,
                                ..Default::default()
                            }),
                            HttpOption::Enabled => None,
                        };
                    }
                }
            }

            let Some(tls) = extract_tls(host, &spec.tls) else {
                continue;
            };
            if tls.secret_name.is_empty() {
                continue;
            }
            let secret_namespace = if tls.secret_namespace.is_empty() {
                meta.namespace.as_str()
            } else {
                tls.secret_namespace.as_str()
            };
            attach_tls(cluster, options, domain, secret_namespace, &tls.secret_name);
        }
    }
    Ok(())
}

/// Route for one path on one host
fn make_route(host: &str, path: &KnativeHttpIngressPath, namespace: &str) -> HttpRoute {
    let headers: BTreeMap<String, StringMatch> = path
        .headers
        .iter()
        .map(|(name, value)| (name.clone(), StringMatch::Exact(value.exact.clone())))
        .collect();
    let matches = vec![HttpMatchRequest {
        uri: (!path.path.is_empty()).then(|| StringMatch::Prefix(path.path.clone())),
        authority: Some(StringMatch::Prefix(host.to_string())),
        headers,
        ..Default::default()
    }];

    let route = path
        .splits
        .iter()
        .map(|split| {
            let split_namespace = if split.service_namespace.is_empty() {
                namespace
            } else {
                split.service_namespace.as_str()
            };
            HttpRouteDestination {
                destination: Destination {
                    host: service_fqdn(split_namespace, &split.service_name),
                    port: Some(PortSelector {
                        number: split.port_number(),
                    }),
                    subset: None,
                },
                weight: split.percent,
                headers: (!split.append_headers.is_empty()).then(|| Headers {
                    request: Some(HeaderOperations {
                        set: split.append_headers.clone(),
                        ..Default::default()
                    }),
                    response: None,
                }),
            }
        })
        .collect();

    HttpRoute {
        matches,
        route,
        rewrite: (!path.rewrite_host.is_empty()).then(|| HttpRewrite {
            uri: None,
            authority: Some(path.rewrite_host.clone()),
        }),
        headers: (!path.append_headers.is_empty()).then(|| Headers {
            request: Some(HeaderOperations {
                set: path.append_headers.clone(),
                ..Default::default()
            }),
            response: None,
        }),
        ..Default::default()
    }
}

/// Every split names a service; records them on the diagnostic builder
fn check_splits(
    path: &KnativeHttpIngressPath,
    namespace: &str,
    services: &mut Vec<BackendService>,
) -> ConvertEvent {
    if path.splits.is_empty() {
        return ConvertEvent::InvalidBackendService;
    }
    for split in &path.splits {
        if split.service_name.is_empty() {
            return ConvertEvent::InvalidBackendService;
        }
        services.push(BackendService {
            namespace: namespace.to_string(),
            name: split.service_name.clone(),
            port: split.port_number(),
            weight: split.percent,
        });
    }
    ConvertEvent::Normal
}

pub fn convert_http_route(
    ctx: &AdapterContext,
    options: &mut ConvertOptions,
    wrapper: &Arc<WrapperConfig>,
) -> Result<()> {
    let spec = knative_spec(ctx, wrapper)?;
    let meta = wrapper.meta();
    let cluster_id = &ctx.options.cluster_id;
    let mut defined_rules: HashSet<String> = HashSet::new();

    for rule in &spec.rules {
        for host in &rule.hosts {
            let Some(paths) = rule.http.as_ref().map(|http| &http.paths).filter(|p| !p.is_empty()) else {
                warn!(
                    "Rule of host {} in knative ingress {} within cluster {} has no paths",
                    host,
                    meta.key(),
                    cluster_id
                );
                continue;
            };
            options
                .virtual_services
                .entry(host.clone())
                .or_insert_with(|| WrapperVirtualService::new(wrapper.clone(), host));

            let mut routes = Vec::new();
            let mut rule_keys = Vec::new();
            for path in paths {
                let mut route = WrapperHttpRoute::new(wrapper.clone(), host, cluster_id);
                route.origin_path = path.path.clone();
                route.origin_path_type = PathType::Prefix;
                route.route = make_route(host, path, &meta.namespace);
                route.route.name = generate_unique_route_name(&ctx.options.system_namespace, &route);

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

                let mut event = check_splits(path, &meta.namespace, &mut builder.services);
                if let Some(destination) = &wrapper.annotations.destination {
                    route.weight_total = destination.weight_sum;
                }
                if builder.event != ConvertEvent::Normal {
                    event = builder.event;
                }
                if event == ConvertEvent::Normal {
                    routes.push(route);
                } else {
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
            options.http_routes.entry(host.clone()).or_default().extend(routes);
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::annotations::AnnotationConfig;
    use crate::apis::listers::ClusterListers;
    use crate::config::ClusterOptions;
    use crate::ingress::model::ResourceMeta;

    fn ctx() -> AdapterContext {
        let mut options = ClusterOptions::from_cluster_id("c1");
        options.gateway_http_port = 80;
        options.gateway_https_port = 443;
        options.system_namespace = "portti-system".to_string();
        AdapterContext {
            options,
            listers: ClusterListers::empty(),
            https_credentials: None,
            knative_ingress_class: "portti".to_string(),
        }
    }

    fn wrapper(spec: serde_json::Value) -> Arc<WrapperConfig> {
        let spec: KnativeIngressSpec = serde_json::from_value(spec).unwrap();
        Arc::new(WrapperConfig {
            config: Arc::new(RawConfig {
                dialect: IngressDialect::Knative,
                meta: ResourceMeta {
                    cluster_id: "c1".to_string(),
                    raw_cluster_id: "c1".to_string(),
                    namespace: "serving".to_string(),
                    name: "hello".to_string(),
                    ..Default::default()
                },
                spec: IngressSpecKind::Knative(spec),
            }),
            annotations: AnnotationConfig::new("c1", "serving", "hello"),
        })
    }

    fn hello_spec(http_option: &str) -> serde_json::Value {
        serde_json::json!({
            "httpOption": http_option,
            "tls": [{"hosts": ["hello.example.com"], "secretName": "hello-tls", "secretNamespace": "certs"}],
            "rules": [
                {
                    "hosts": ["hello.example.com"],
                    "visibility": "ExternalIP",
                    "http": {"paths": [{
                        "path": "/",
                        "rewriteHost": "hello.serving.svc.cluster.local",
                        "headers": {"x-version": {"exact": "v2"}},
                        "appendHeaders": {"knative-serving-namespace": "serving"},
                        "splits": [
                            {"serviceName": "hello-00001", "servicePort": 80, "percent": 90},
                            {"serviceName": "hello-00002", "servicePort": 80, "percent": 10,
                             "appendHeaders": {"knative-serving-revision": "hello-00002"}}
                        ]
                    }]}
                },
                {
                    "hosts": ["hello.serving.svc.cluster.local"],
                    "visibility": "ClusterLocal",
                    "http": {"paths": [{"splits": [{"serviceName": "hello-00001", "servicePort": 80, "percent": 100}]}]}
                }
            ]
        })
    }

    #[test]
    fn test_gateways_by_visibility() {
        let mut options = ConvertOptions::default();
        convert_gateway(&ctx(), &mut options, &wrapper(hello_spec("Enabled"))).unwrap();

        let public = &options.gateways["hello.example.com"].gateway;
        assert_eq!(public.servers[0].port.number, 80);
        assert_eq!(public.servers[1].port.number, 443);
        assert_eq!(
            public.servers[1].tls.as_ref().unwrap().credential_name,
            "kubernetes-ingress://c1/certs/hello-tls"
        );

        let local = &options.gateways["hello.serving.svc.cluster.local"].gateway;
        assert_eq!(local.servers.len(), 1);
        assert_eq!(local.servers[0].port.number, CLUSTER_LOCAL_PORT);
        assert_eq!(local.servers[0].port.name, "http-8081-ingress-c1");
    }

    #[test]
    fn test_redirected_sets_https_redirect() {
        let mut options = ConvertOptions::default();
        convert_gateway(&ctx(), &mut options, &wrapper(hello_spec("Redirected"))).unwrap();

        let http = &options.gateways["hello.example.com"].gateway.servers[0];
        assert!(http.tls.as_ref().unwrap().https_redirect);
    }

    #[test]
    fn test_routes_from_splits() {
        let mut options = ConvertOptions::default();
        convert_http_route(&ctx(), &mut options, &wrapper(hello_spec("Enabled"))).unwrap();

        let routes = &options.http_routes["hello.example.com"];
        assert_eq!(routes.len(), 1);
        let route = &routes[0].route;
        let predicate = &route.matches[0];
        assert_eq!(predicate.authority, Some(StringMatch::Prefix("hello.example.com".to_string())));
        assert_eq!(predicate.uri, Some(StringMatch::Prefix("/".to_string())));
        assert_eq!(predicate.headers["x-version"], StringMatch::Exact("v2".to_string()));

        assert_eq!(route.route.len(), 2);
        assert_eq!(route.route[0].destination.host, "hello-00001.serving.svc.cluster.local");
        assert_eq!(route.route[0].weight, 90);
        assert_eq!(
            route.route[1].headers.as_ref().unwrap().request.as_ref().unwrap().set["knative-serving-revision"],
            "hello-00002"
        );
        assert_eq!(
            route.rewrite.as_ref().unwrap().authority.as_deref(),
            Some("hello.serving.svc.cluster.local")
        );

        let local = &options.http_routes["hello.serving.svc.cluster.local"][0];
        assert_eq!(local.route.matches[0].uri, None, "Empty path matches any uri");
    }

    #[test]
    fn test_missing_splits_are_invalid() {
        let mut options = ConvertOptions::default();
        let spec = serde_json::json!({
            "rules": [{"hosts": ["a.example.com"], "http": {"paths": [{"path": "/"}]}}]
        });
        convert_http_route(&ctx(), &mut options, &wrapper(spec)).unwrap();

        assert!(options.http_routes["a.example.com"].is_empty());
        let collection = options.route_cache.extract();
        assert_eq!(collection.invalid.len(), 1);
        assert_eq!(collection.invalid[0].event, "InvalidBackendService");
    }

    #[test]
    fn test_empty_rules_rejected() {
        let mut options = ConvertOptions::default();
        assert!(convert_gateway(&ctx(), &mut options, &wrapper(serde_json::json!({}))).is_err());
        assert!(options.gateways.is_empty());
    }
}
