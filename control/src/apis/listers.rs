//! Read-only resource listers
//!
//! A [`Lister`] is a view over a reflector store. The watch glue in
//! [`super::watch`] feeds the store; conversion only ever calls `list` and
//! `get` and never talks to the API server itself.

use crate::apis::ingress::{KnativeIngress, LegacyIngress};
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1::{Ingress, IngressClass};
use kube::runtime::reflector::{self, store::Writer, ObjectRef, Store};
use kube::runtime::watcher;
use kube::Resource;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cached, read-only access to one resource kind
pub struct Lister<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    store: Store<K>,
    synced: Arc<AtomicBool>,
}

impl<K> Clone for Lister<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            synced: self.synced.clone(),
        }
    }
}

impl<K> Lister<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    pub fn new(store: Store<K>, synced: Arc<AtomicBool>) -> Self {
        Self { store, synced }
    }

    /// Create a lister and the writer that feeds it.
    ///
    /// The lister reports unsynced until the writer's watcher marks it.
    pub fn with_writer() -> (Self, Writer<K>) {
        let (store, writer) = reflector::store();
        (Self::new(store, Arc::new(AtomicBool::new(false))), writer)
    }

    /// Lister over a fixed set of objects, already synced
    pub fn from_objects(objects: impl IntoIterator<Item = K>) -> Self {
        let mut writer = Writer::<K>::default();
        for object in objects {
            writer.apply_watcher_event(&watcher::Event::Apply(object));
        }
        Self::new(writer.as_reader(), Arc::new(AtomicBool::new(true)))
    }

    /// Synced lister with no objects, used for dialects that are switched off
    pub fn empty() -> Self {
        Self::from_objects(Vec::new())
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.store.state()
    }

    /// Lookup by key; an empty namespace addresses cluster-scoped objects
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        let key = ObjectRef::new(name);
        if namespace.is_empty() {
            self.store.get(&key)
        } else {
            self.store.get(&key.within(namespace))
        }
    }

    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Shared flag the watch glue flips once the initial list is in
    pub fn synced_flag(&self) -> Arc<AtomicBool> {
        self.synced.clone()
    }
}

/// Every lister one cluster contributes
#[derive(Clone)]
pub struct ClusterListers {
    pub ingresses: Lister<Ingress>,
    pub legacy_ingresses: Lister<LegacyIngress>,
    pub knative_ingresses: Lister<KnativeIngress>,
    pub ingress_classes: Lister<IngressClass>,
    pub services: Lister<Service>,
    pub secrets: Lister<Secret>,
}

impl ClusterListers {
    /// Synced listers with no objects
    pub fn empty() -> Self {
        Self {
            ingresses: Lister::empty(),
            legacy_ingresses: Lister::empty(),
            knative_ingresses: Lister::empty(),
            ingress_classes: Lister::empty(),
            services: Lister::empty(),
            secrets: Lister::empty(),
        }
    }

    pub fn has_synced(&self) -> bool {
        self.ingresses.has_synced()
            && self.legacy_ingresses.has_synced()
            && self.knative_ingresses.has_synced()
            && self.ingress_classes.has_synced()
            && self.services.has_synced()
            && self.secrets.has_synced()
    }
}
