use anyhow::Result;
use common::{ConfigKind, ConfigMeta};
use control::apis::ingress::{KnativeIngress, LegacyIngress};
use control::apis::listers::{ClusterListers, Lister};
use control::apis::metrics::gather_controller_metrics;
use control::apis::watch::{spawn_watcher, ResourceChange};
use control::ingress::dialect::{AdapterContext, DialectResource, IngressAdapter};
use control::ingress::events::{Event, HandlerRegistry, AFFECTED_KINDS};
use control::ingress::model::IngressDialect;
use control::ingress::secret_tracker::{PushNotifier, PushRequest, SecretTracker};
use control::{ControllerConfig, IngressConfigStore};
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1::{Ingress, IngressClass};
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::reflector::store::Writer;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Wakes the pass loop when the tracker asks for a full push
struct PassTrigger(Arc<Notify>);

impl PushNotifier for PassTrigger {
    fn push(&self, request: PushRequest) {
        info!(
            "Full push requested ({}) for {} kinds",
            request.reason,
            request.configs_updated.len()
        );
        self.0.notify_one();
    }
}

/// Namespaced resources follow the watch namespace, everything else is cluster-wide
fn scoped_api<K>(client: &Client, namespace: &str) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    if namespace.is_empty() {
        Api::all(client.clone())
    } else {
        Api::namespaced(client.clone(), namespace)
    }
}

/// Watch an ingress dialect and feed its changes to the adapter
fn watch_dialect<K>(
    kind: &'static str,
    api: Api<K>,
    lister: &Lister<K>,
    writer: Writer<K>,
    adapter: Arc<IngressAdapter>,
    trigger: Arc<Notify>,
) -> JoinHandle<()>
where
    K: DialectResource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + std::hash::Hash + Clone + Default + Send + Sync,
{
    spawn_watcher(kind, api, lister, writer, move |change: ResourceChange<K>| {
        if matches!(change, ResourceChange::Synced) {
            trigger.notify_one();
        }
        adapter.on_event(change);
    })
}

/// Run one conversion pass over every kind and log what came out
fn run_pass(store: &IngressConfigStore) {
    for kind in ConfigKind::ALL {
        match store.list(kind, "") {
            Ok(objects) => info!("Emitted {} {} objects", objects.len(), kind),
            Err(e) => error!("Failed to list {}: {}", kind, e),
        }
    }

    let routes = store.get_ingress_routes();
    let domains = store.get_ingress_domains();
    info!(
        "Ingress routes: {} valid, {} invalid; domains: {} valid, {} invalid",
        routes.valid.len(),
        routes.invalid.len(),
        domains.valid.len(),
        domains.invalid.len()
    );

    match gather_controller_metrics() {
        Ok(metrics) => debug!("Controller metrics:\n{}", metrics),
        Err(e) => error!("Failed to gather metrics: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ControllerConfig::from_env()?;
    info!(
        "Starting PORTTI ingress controller: cluster {}, class '{}', system namespace {}",
        config.cluster_id, config.ingress_class, config.system_namespace
    );

    let client = Client::try_default().await?;
    let options = config.cluster_options();
    let trigger = Arc::new(Notify::new());

    let handlers = Arc::new(HandlerRegistry::default());
    let tracker = Arc::new(SecretTracker::new(Some(Arc::new(PassTrigger(trigger.clone())))));
    let store = Arc::new(IngressConfigStore::new(
        &config.system_namespace,
        &config.cluster_id,
        handlers.clone(),
        tracker,
    ));
    for kind in AFFECTED_KINDS {
        let trigger = trigger.clone();
        store.register_event_handler(
            kind,
            Arc::new(move |meta: &ConfigMeta, event: Event| {
                debug!("{} {:?}", meta, event);
                trigger.notify_one();
            }),
        );
    }

    let (ingresses, ingress_writer) = Lister::<Ingress>::with_writer();
    let (ingress_classes, class_writer) = Lister::<IngressClass>::with_writer();
    let (services, service_writer) = Lister::<Service>::with_writer();
    let (secrets, secret_writer) = Lister::<Secret>::with_writer();
    let (legacy_ingresses, legacy_writer) = if config.enable_legacy_ingress {
        let (lister, writer) = Lister::<LegacyIngress>::with_writer();
        (lister, Some(writer))
    } else {
        (Lister::empty(), None)
    };
    let (knative_ingresses, knative_writer) = if config.enable_knative {
        let (lister, writer) = Lister::<KnativeIngress>::with_writer();
        (lister, Some(writer))
    } else {
        (Lister::empty(), None)
    };

    let listers = ClusterListers {
        ingresses: ingresses.clone(),
        legacy_ingresses: legacy_ingresses.clone(),
        knative_ingresses: knative_ingresses.clone(),
        ingress_classes: ingress_classes.clone(),
        services: services.clone(),
        secrets: secrets.clone(),
    };
    let adapter = |dialect: IngressDialect| {
        store.add_adapter(IngressAdapter::new(
            dialect,
            AdapterContext {
                options: options.clone(),
                listers: listers.clone(),
                https_credentials: config.https_credentials.clone(),
                knative_ingress_class: config.knative_ingress_class.clone(),
            },
            handlers.clone(),
        ))
    };

    let namespace = config.watch_namespace.as_str();
    let mut handles = vec![watch_dialect(
        "Ingress",
        scoped_api(&client, namespace),
        &ingresses,
        ingress_writer,
        adapter(IngressDialect::V1),
        trigger.clone(),
    )];
    if let Some(writer) = legacy_writer {
        handles.push(watch_dialect(
            "LegacyIngress",
            scoped_api(&client, namespace),
            &legacy_ingresses,
            writer,
            adapter(IngressDialect::Legacy),
            trigger.clone(),
        ));
    }
    if let Some(writer) = knative_writer {
        handles.push(watch_dialect(
            "KnativeIngress",
            scoped_api(&client, namespace),
            &knative_ingresses,
            writer,
            adapter(IngressDialect::Knative),
            trigger.clone(),
        ));
    }

    let class_trigger = trigger.clone();
    handles.push(spawn_watcher(
        "IngressClass",
        Api::all(client.clone()),
        &ingress_classes,
        class_writer,
        move |change: ResourceChange<IngressClass>| {
            if matches!(change, ResourceChange::Synced) {
                class_trigger.notify_one();
            }
        },
    ));

    let service_trigger = trigger.clone();
    handles.push(spawn_watcher(
        "Service",
        Api::all(client.clone()),
        &services,
        service_writer,
        move |change: ResourceChange<Service>| {
            if matches!(change, ResourceChange::Synced) {
                service_trigger.notify_one();
            }
        },
    ));

    let secret_store = store.clone();
    let secret_trigger = trigger.clone();
    let cluster_id = options.cluster_id.clone();
    handles.push(spawn_watcher(
        "Secret",
        Api::all(client.clone()),
        &secrets,
        secret_writer,
        move |change: ResourceChange<Secret>| {
            let secret = match change {
                ResourceChange::Applied(secret) | ResourceChange::Deleted(secret) => secret,
                ResourceChange::Synced => {
                    secret_trigger.notify_one();
                    return;
                }
            };
            let key = format!(
                "{}/{}/{}",
                cluster_id,
                secret.namespace().unwrap_or_default(),
                secret.name_any()
            );
            secret_store.handle_secret_change(&key);
        },
    ));

    let debounce = Duration::from_millis(config.debounce_ms);
    let pass_store = store.clone();
    let pass_trigger = trigger.clone();
    handles.push(tokio::spawn(async move {
        loop {
            pass_trigger.notified().await;
            // collapse bursts of watch events into one pass
            tokio::time::sleep(debounce).await;
            if !pass_store.has_synced() {
                debug!("Listers not synced yet, deferring conversion pass");
                continue;
            }
            run_pass(&pass_store);
        }
    }));

    info!("Watching ingress resources. Press Ctrl-C to exit.");
    signal::ctrl_c().await?;
    info!("Shutdown signal received");

    for handle in handles {
        handle.abort();
    }
    Ok(())
}
