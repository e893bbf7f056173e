//! Ingress dialect adapters
//!
//! One [`IngressAdapter`] per watched resource shape. All of them answer the
//! same conversion calls; the v1 and legacy shapes share their logic through
//! [`standard`], Knative has its own in [`knative`].

pub mod knative;
pub mod legacy;
pub mod standard;
pub mod v1;

use crate::apis::listers::ClusterListers;
use crate::apis::metrics::record_ingress_resources;
use crate::apis::watch::ResourceChange;
use crate::config::{ClusterOptions, HttpsCredentialConfig, DEFAULT_INGRESS_CLASS, INGRESS_CONTROLLER_NAME};
use crate::error::Result;
use crate::ingress::events::{EventFilter, Fingerprint, HandlerRegistry, ObservedChange};
use crate::ingress::model::{ConvertOptions, IngressDialect, RawConfig, ResourceMeta, WrapperConfig};
use k8s_openapi::api::networking::v1::IngressClass;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Everything an adapter reads while converting one cluster's resources
#[derive(Clone)]
pub struct AdapterContext {
    pub options: ClusterOptions,
    pub listers: ClusterListers,
    pub https_credentials: Option<HttpsCredentialConfig>,
    /// Class Knative resources must carry
    pub knative_ingress_class: String,
}

impl AdapterContext {
    /// Resource metadata of a listed object, stamped with this cluster
    pub fn resource_meta<K: Resource>(&self, object: &K) -> ResourceMeta {
        ResourceMeta {
            cluster_id: self.options.cluster_id.clone(),
            raw_cluster_id: self.options.raw_cluster_id.clone(),
            namespace: object.namespace().unwrap_or_default(),
            name: object.name_any(),
            annotations: object.annotations().clone(),
            labels: object.labels().clone(),
            creation_timestamp: object.meta().creation_timestamp.as_ref().map(|t| t.0),
        }
    }

    pub fn namespace_watched(&self, namespace: &str) -> bool {
        self.options.watch_namespace.is_empty() || self.options.watch_namespace == namespace
    }
}

/// A watched resource shape
pub trait DialectResource: Resource + Serialize {
    /// Passes the class and namespace filters of `ctx`
    fn should_process(&self, ctx: &AdapterContext) -> bool;
}

/// Ingress class selection shared by the v1 and legacy shapes.
///
/// The class annotation wins over everything, then an IngressClass object
/// named by `spec.ingressClassName`, then the bare class name. An empty or
/// `*` configured class selects every resource.
pub fn class_selected(
    configured: &str,
    annotation_class: Option<&str>,
    class_object: Option<&IngressClass>,
    class_name: Option<&str>,
) -> bool {
    if configured.is_empty() || configured == "*" {
        return true;
    }
    if let Some(class) = annotation_class {
        return if configured == DEFAULT_INGRESS_CLASS {
            class.is_empty() || class == DEFAULT_INGRESS_CLASS
        } else {
            class == configured
        };
    }
    if let Some(class) = class_object {
        let controller = class.spec.as_ref().and_then(|s| s.controller.as_deref());
        return class.name_any() == configured || controller == Some(INGRESS_CONTROLLER_NAME);
    }
    if configured == DEFAULT_INGRESS_CLASS {
        return class_name.map_or(true, |name| name.is_empty() || name == DEFAULT_INGRESS_CLASS);
    }
    class_name == Some(configured)
}

/// Serialized spec of a watched object, what update filtering compares
fn spec_value<K: Serialize>(object: &K) -> serde_json::Value {
    serde_json::to_value(object)
        .ok()
        .and_then(|value| value.get("spec").cloned())
        .unwrap_or_default()
}

/// Converts one dialect of one cluster
pub struct IngressAdapter {
    dialect: IngressDialect,
    ctx: AdapterContext,
    filter: EventFilter,
    handlers: Arc<HandlerRegistry>,
}

impl IngressAdapter {
    pub fn new(dialect: IngressDialect, ctx: AdapterContext, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            dialect,
            ctx,
            filter: EventFilter::default(),
            handlers,
        }
    }

    pub fn dialect(&self) -> IngressDialect {
        self.dialect
    }

    pub fn context(&self) -> &AdapterContext {
        &self.ctx
    }

    pub fn cluster_id(&self) -> &str {
        &self.ctx.options.cluster_id
    }

    /// Selected resources with optional fields defaulted
    pub fn list(&self) -> Vec<RawConfig> {
        let configs = match self.dialect {
            IngressDialect::V1 => v1::list(&self.ctx),
            IngressDialect::Legacy => legacy::list(&self.ctx),
            IngressDialect::Knative => knative::list(&self.ctx),
        };
        record_ingress_resources(&self.ctx.options.cluster_id, configs.len());
        configs
    }

    pub fn has_synced(&self) -> bool {
        self.ctx.listers.has_synced()
    }

    pub fn convert_gateway(&self, options: &mut ConvertOptions, wrapper: &Arc<WrapperConfig>) -> Result<()> {
        match self.dialect {
            IngressDialect::Knative => knative::convert_gateway(&self.ctx, options, wrapper),
            _ => standard::convert_gateway(&self.ctx, options, wrapper),
        }
    }

    pub fn convert_http_route(&self, options: &mut ConvertOptions, wrapper: &Arc<WrapperConfig>) -> Result<()> {
        match self.dialect {
            IngressDialect::Knative => knative::convert_http_route(&self.ctx, options, wrapper),
            _ => standard::convert_http_route(&self.ctx, options, wrapper),
        }
    }

    pub fn apply_default_backend(&self, options: &mut ConvertOptions, wrapper: &Arc<WrapperConfig>) -> Result<()> {
        match self.dialect {
            IngressDialect::Knative => Ok(()),
            _ => standard::apply_default_backend(&self.ctx, options, wrapper),
        }
    }

    pub fn apply_canary_ingress(&self, options: &mut ConvertOptions, wrapper: &Arc<WrapperConfig>) -> Result<()> {
        match self.dialect {
            IngressDialect::Knative => Ok(()),
            _ => standard::apply_canary_ingress(&self.ctx, options, wrapper),
        }
    }

    pub fn convert_traffic_policy(&self, options: &mut ConvertOptions, wrapper: &Arc<WrapperConfig>) -> Result<()> {
        match self.dialect {
            IngressDialect::Knative => Ok(()),
            _ => standard::convert_traffic_policy(&self.ctx, options, wrapper),
        }
    }

    /// Announce a watched change to the registered handlers when it matters
    pub fn on_event<K: DialectResource>(&self, change: ResourceChange<K>) {
        let observed = match change {
            ResourceChange::Applied(object) => ObservedChange::Applied {
                key: resource_key(&object),
                fingerprint: Fingerprint {
                    annotations: object.annotations().clone(),
                    labels: object.labels().clone(),
                    spec: spec_value(&object),
                },
                should_process: object.should_process(&self.ctx),
            },
            ResourceChange::Deleted(object) => ObservedChange::Deleted {
                key: resource_key(&object),
            },
            ResourceChange::Synced => return,
        };
        let key = match &observed {
            ObservedChange::Applied { key, .. } | ObservedChange::Deleted { key } => key.clone(),
        };
        if let Some(event) = self.filter.observe(observed) {
            debug!("{} ingress {} changed: {:?}", self.dialect, key, event);
            let (namespace, name) = key.split_once('/').unwrap_or(("", key.as_str()));
            self.handlers.notify_ingress(namespace, name, event);
        }
    }
}

fn resource_key<K: Resource>(object: &K) -> String {
    format!("{}/{}", object.namespace().unwrap_or_default(), object.name_any())
}
