//! End-to-end conversion tests
//!
//! Drive the config store over in-memory listers, the way the controller
//! drives it over watched ones.
//!
//! Run with: cargo test --test conversion_test

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use common::{ConfigKind, ConfigObject, ConfigSpec, Gateway, VirtualService, PROTOCOL_HTTPS};
use control::apis::listers::{ClusterListers, Lister};
use control::config::{CredentialEntry, HttpsCredentialConfig};
use control::ingress::dialect::{AdapterContext, IngressAdapter};
use control::ingress::events::HandlerRegistry;
use control::ingress::model::IngressDialect;
use control::ingress::secret_tracker::SecretTracker;
use control::{ControllerConfig, IngressConfigStore};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use serde_json::{json, Value};
use std::sync::Arc;

fn ingress(name: &str, created: &str, annotations: Value, spec: Value) -> Ingress {
    serde_json::from_value(json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "Ingress",
        "metadata": {
            "name": name,
            "namespace": "default",
            "creationTimestamp": created,
            "annotations": annotations
        },
        "spec": spec
    }))
    .expect("Ingress fixture should deserialize")
}

fn path(path: &str, service: &str, port: i32) -> Value {
    json!({
        "path": path,
        "pathType": "Prefix",
        "backend": {"service": {"name": service, "port": {"number": port}}}
    })
}

fn named_port_path(path: &str, service: &str, port: &str) -> Value {
    json!({
        "path": path,
        "pathType": "Prefix",
        "backend": {"service": {"name": service, "port": {"name": port}}}
    })
}

fn service(name: &str, ports: Value) -> Service {
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {"name": name, "namespace": "default"},
        "spec": {"ports": ports}
    }))
    .expect("Service fixture should deserialize")
}

fn rule(host: &str, paths: Vec<Value>) -> Value {
    json!({"host": host, "http": {"paths": paths}})
}

fn new_store(ingresses: Vec<Ingress>) -> IngressConfigStore {
    new_store_with(ingresses, vec![], None)
}

fn new_store_with(
    ingresses: Vec<Ingress>,
    services: Vec<Service>,
    https_credentials: Option<HttpsCredentialConfig>,
) -> IngressConfigStore {
    let config = ControllerConfig {
        cluster_id: "c1".to_string(),
        ingress_class: "*".to_string(),
        ..Default::default()
    };
    let mut listers = ClusterListers::empty();
    listers.ingresses = Lister::from_objects(ingresses);
    listers.services = Lister::from_objects(services);

    let handlers = Arc::new(HandlerRegistry::default());
    let store = IngressConfigStore::new(
        &config.system_namespace,
        &config.cluster_id,
        handlers.clone(),
        Arc::new(SecretTracker::new(None)),
    );
    store.add_adapter(IngressAdapter::new(
        IngressDialect::V1,
        AdapterContext {
            options: config.cluster_options(),
            listers,
            https_credentials,
            knative_ingress_class: config.knative_ingress_class.clone(),
        },
        handlers,
    ));
    store
}

fn list(store: &IngressConfigStore, kind: ConfigKind) -> Vec<ConfigObject> {
    store.list(kind, "").expect("Cluster-wide listing should succeed")
}

fn virtual_service_of(store: &IngressConfigStore, host: &str) -> VirtualService {
    list(store, ConfigKind::VirtualService)
        .into_iter()
        .find_map(|object| match object.spec {
            ConfigSpec::VirtualService(vs) if vs.hosts == [host] => Some(vs),
            _ => None,
        })
        .unwrap_or_else(|| panic!("No virtual service for host {}", host))
}

fn gateway_of(store: &IngressConfigStore, host: &str) -> Gateway {
    list(store, ConfigKind::Gateway)
        .into_iter()
        .find_map(|object| match object.spec {
            ConfigSpec::Gateway(gateway) if gateway.servers.iter().any(|s| s.hosts == [host]) => {
                Some(gateway)
            }
            _ => None,
        })
        .unwrap_or_else(|| panic!("No gateway for host {}", host))
}

#[test]
fn test_duplicate_route_keeps_oldest_owner() {
    let first = ingress(
        "first",
        "2024-01-01T00:00:00Z",
        json!({}),
        json!({"rules": [rule("a.example.com", vec![path("/api", "svc-a", 80)])]}),
    );
    let second = ingress(
        "second",
        "2024-01-02T00:00:00Z",
        json!({}),
        json!({"rules": [rule("a.example.com", vec![path("/api", "svc-b", 80)])]}),
    );
    // lister order must not matter, only creation time does
    let store = new_store(vec![second, first]);

    let vs = virtual_service_of(&store, "a.example.com");
    assert_eq!(vs.http.len(), 1, "The duplicate must not be emitted");
    assert_eq!(
        vs.http[0].route[0].destination.host,
        "svc-a.default.svc.cluster.local"
    );

    let routes = store.get_ingress_routes();
    assert_eq!(routes.valid.len(), 1);
    assert_eq!(routes.valid[0].ingress, "first");
    assert_eq!(routes.invalid.len(), 1);
    assert_eq!(routes.invalid[0].ingress, "second");
    assert_eq!(routes.invalid[0].event, "DuplicatedRoute");
    assert!(
        routes.invalid[0].message.contains("default/first"),
        "Message should name the owner: {}",
        routes.invalid[0].message
    );
}

#[test]
fn test_conflicting_tls_first_claim_wins() {
    let first = ingress(
        "first",
        "2024-01-01T00:00:00Z",
        json!({}),
        json!({
            "tls": [{"hosts": ["a.example.com"], "secretName": "tls-a"}],
            "rules": [rule("a.example.com", vec![path("/a", "svc-a", 80)])]
        }),
    );
    let second = ingress(
        "second",
        "2024-01-02T00:00:00Z",
        json!({}),
        json!({
            "tls": [{"hosts": ["a.example.com"], "secretName": "tls-b"}],
            "rules": [rule("a.example.com", vec![path("/b", "svc-b", 80)])]
        }),
    );
    let store = new_store(vec![first, second]);

    let gateway = gateway_of(&store, "a.example.com");
    let https: Vec<_> = gateway.servers.iter().filter(|s| s.port.protocol == PROTOCOL_HTTPS).collect();
    assert_eq!(https.len(), 1, "Only one HTTPS listener per host");
    let credential = &https[0].tls.as_ref().unwrap().credential_name;
    assert!(credential.ends_with("/default/tls-a"), "Got credential {}", credential);

    let domains = store.get_ingress_domains();
    assert_eq!(domains.invalid.len(), 1);
    assert_eq!(domains.invalid[0].ingress, "second");
    assert_eq!(domains.invalid[0].event, "DuplicatedTls");

    // routes of both resources are still served
    let vs = virtual_service_of(&store, "a.example.com");
    assert_eq!(vs.http.len(), 2);
}

#[test]
fn test_weighted_canary_splits_traffic() {
    let base = ingress(
        "echo",
        "2024-01-01T00:00:00Z",
        json!({}),
        json!({"rules": [rule("a.example.com", vec![path("/", "echo", 80)])]}),
    );
    let canary = ingress(
        "echo-canary",
        "2024-01-02T00:00:00Z",
        json!({"portti.io/canary": "true", "portti.io/canary-weight": "30"}),
        json!({"rules": [rule("a.example.com", vec![path("/", "echo-v2", 80)])]}),
    );
    let store = new_store(vec![base, canary]);

    let vs = virtual_service_of(&store, "a.example.com");
    assert_eq!(vs.http.len(), 1, "A weighted canary joins the base route");
    let split: Vec<(String, i32)> = vs.http[0]
        .route
        .iter()
        .map(|d| (d.destination.host.clone(), d.weight))
        .collect();
    assert_eq!(
        split,
        vec![
            ("echo.default.svc.cluster.local".to_string(), 70),
            ("echo-v2.default.svc.cluster.local".to_string(), 30),
        ]
    );

    // canaries never claim a gateway of their own
    assert_eq!(list(&store, ConfigKind::Gateway).len(), 1);
}

#[test]
fn test_header_canary_is_ordered_before_base() {
    let base = ingress(
        "echo",
        "2024-01-01T00:00:00Z",
        json!({}),
        json!({"rules": [rule("a.example.com", vec![path("/api", "echo", 80)])]}),
    );
    let canary = ingress(
        "echo-canary",
        "2024-01-02T00:00:00Z",
        json!({"portti.io/canary": "true", "portti.io/canary-by-header": "x-canary"}),
        json!({"rules": [rule("a.example.com", vec![path("/api", "echo-v2", 80)])]}),
    );
    let store = new_store(vec![base, canary]);

    let vs = virtual_service_of(&store, "a.example.com");
    assert_eq!(vs.http.len(), 2);
    assert!(
        vs.http[0].matches.iter().all(|m| m.headers.contains_key("x-canary")),
        "The header canary must be tried first"
    );
    assert_eq!(
        vs.http[0].route[0].destination.host,
        "echo-v2.default.svc.cluster.local"
    );
    assert_eq!(
        vs.http[1].route[0].destination.host,
        "echo.default.svc.cluster.local"
    );
}

#[test]
fn test_default_backend_serves_wildcard_host() {
    let fallback = ingress(
        "fallback",
        "2024-01-01T00:00:00Z",
        json!({}),
        json!({"defaultBackend": {"service": {"name": "errors", "port": {"number": 8080}}}}),
    );
    let echo = ingress(
        "echo",
        "2024-01-02T00:00:00Z",
        json!({}),
        json!({"rules": [rule("a.example.com", vec![path("/api", "echo", 80)])]}),
    );
    let store = new_store(vec![fallback, echo]);

    let wildcard = virtual_service_of(&store, "*");
    assert_eq!(wildcard.http.len(), 1);
    assert_eq!(
        wildcard.http[0].route[0].destination.host,
        "errors.default.svc.cluster.local"
    );
    assert_eq!(wildcard.http[0].route[0].weight, 100);

    // the wildcard gateway exists for the default backend
    gateway_of(&store, "*");

    let echo_vs = virtual_service_of(&store, "a.example.com");
    assert!(
        echo_vs
            .http
            .iter()
            .all(|r| r.route[0].destination.host == "echo.default.svc.cluster.local"),
        "A resource without a default backend keeps its own routes"
    );
}

#[test]
fn test_routes_ordered_longest_prefix_first() {
    let echo = ingress(
        "echo",
        "2024-01-01T00:00:00Z",
        json!({}),
        json!({"rules": [rule(
            "a.example.com",
            vec![path("/", "root", 80), path("/api", "api", 80), path("/api/v2", "v2", 80)]
        )]}),
    );
    let store = new_store(vec![echo]);

    let vs = virtual_service_of(&store, "a.example.com");
    let hosts: Vec<&str> = vs
        .http
        .iter()
        .map(|r| r.route[0].destination.host.as_str())
        .collect();
    assert_eq!(
        hosts,
        vec![
            "v2.default.svc.cluster.local",
            "api.default.svc.cluster.local",
            "root.default.svc.cluster.local",
        ]
    );
}

#[test]
fn test_output_is_deterministic() {
    let fixtures = || {
        vec![
            ingress(
                "alpha",
                "2024-01-01T00:00:00Z",
                json!({"portti.io/load-balance": "random"}),
                json!({
                    "tls": [{"hosts": ["a.example.com"], "secretName": "tls-a"}],
                    "rules": [rule("a.example.com", vec![path("/a", "svc-a", 80)])]
                }),
            ),
            ingress(
                "beta",
                "2024-01-01T00:00:00Z",
                json!({}),
                json!({"rules": [
                    rule("b.example.com", vec![path("/b", "svc-b", 80)]),
                    rule("a.example.com", vec![path("/c", "svc-c", 80)])
                ]}),
            ),
        ]
    };
    let mut reversed = fixtures();
    reversed.reverse();

    let one = new_store(fixtures());
    let two = new_store(reversed);
    for kind in [
        ConfigKind::Gateway,
        ConfigKind::VirtualService,
        ConfigKind::DestinationRule,
    ] {
        let first = list(&one, kind);
        assert_eq!(first, list(&two, kind), "{} output depends on input order", kind);
        assert_eq!(first, list(&one, kind), "{} output changes between passes", kind);
    }
}

#[test]
fn test_namespaced_listing_is_rejected() {
    let store = new_store(vec![]);
    assert!(store.list(ConfigKind::VirtualService, "default").is_err());
    assert!(list(&store, ConfigKind::VirtualService).is_empty());
}

#[test]
fn test_named_port_resolves_through_service() {
    let echo = ingress(
        "echo",
        "2024-01-01T00:00:00Z",
        json!({}),
        json!({"rules": [rule("a.example.com", vec![named_port_path("/", "echo", "http")])]}),
    );
    let store = new_store_with(
        vec![echo],
        vec![service("echo", json!([{"name": "http", "port": 8080}]))],
        None,
    );

    let vs = virtual_service_of(&store, "a.example.com");
    assert_eq!(vs.http.len(), 1);
    let destination = &vs.http[0].route[0].destination;
    assert_eq!(destination.host, "echo.default.svc.cluster.local");
    assert_eq!(destination.port.as_ref().map(|p| p.number), Some(8080));
    assert!(store.get_ingress_routes().invalid.is_empty());
}

#[test]
fn test_unresolvable_port_name_drops_route() {
    let ghost = ingress(
        "ghost",
        "2024-01-01T00:00:00Z",
        json!({}),
        json!({"rules": [rule(
            "a.example.com",
            vec![path("/ok", "echo", 80), named_port_path("/grpc", "ghost", "grpc")]
        )]}),
    );
    let store = new_store_with(
        vec![ghost],
        vec![service("ghost", json!([{"name": "http", "port": 8080}]))],
        None,
    );

    let vs = virtual_service_of(&store, "a.example.com");
    assert_eq!(vs.http.len(), 1, "Only the resolvable route is served");
    assert_eq!(
        vs.http[0].route[0].destination.host,
        "echo.default.svc.cluster.local"
    );

    let routes = store.get_ingress_routes();
    assert_eq!(routes.invalid.len(), 1);
    assert_eq!(routes.invalid[0].event, "PortNameResolveError");
    assert_eq!(routes.invalid[0].path, "/grpc");
    assert!(
        routes.invalid[0].message.contains("grpc"),
        "Message should name the port: {}",
        routes.invalid[0].message
    );
}

#[test]
fn test_missing_secret_falls_back_to_domain_credential() {
    let covered = ingress(
        "covered",
        "2024-01-01T00:00:00Z",
        json!({}),
        json!({
            "tls": [{"hosts": ["a.example.com"], "secretName": "missing"}],
            "rules": [rule("a.example.com", vec![path("/", "svc-a", 80)])]
        }),
    );
    let uncovered = ingress(
        "uncovered",
        "2024-01-01T00:00:00Z",
        json!({}),
        json!({
            "tls": [{"hosts": ["b.other.io"], "secretName": "missing"}],
            "rules": [rule("b.other.io", vec![path("/", "svc-b", 80)])]
        }),
    );
    let credentials = HttpsCredentialConfig {
        fallback_for_invalid_secret: true,
        credential_config: vec![CredentialEntry {
            domains: vec!["*.example.com".to_string()],
            tls_secret: "certs/wildcard".to_string(),
        }],
    };
    let store = new_store_with(vec![covered, uncovered], vec![], Some(credentials));

    let gateway = gateway_of(&store, "a.example.com");
    let https: Vec<_> = gateway.servers.iter().filter(|s| s.port.protocol == PROTOCOL_HTTPS).collect();
    assert_eq!(https.len(), 1);
    let credential = &https[0].tls.as_ref().unwrap().credential_name;
    assert!(credential.ends_with("/certs/wildcard"), "Got credential {}", credential);

    let gateway = gateway_of(&store, "b.other.io");
    assert!(
        gateway.servers.iter().all(|s| s.port.protocol != PROTOCOL_HTTPS),
        "A host no credential covers is served over HTTP only"
    );
}
