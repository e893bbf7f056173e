//! Watch glue
//!
//! Spawns one reflector-backed watcher per resource kind. Each watcher keeps
//! its lister's store current, marks the lister synced after the initial
//! list, and reports changes to a callback.

use crate::apis::listers::Lister;
use futures::StreamExt;
use kube::runtime::reflector::{reflector, store::Writer};
use kube::runtime::watcher;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::WatchStreamExt;
use kube::{api::Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::Ordering;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A change observed by a watcher
#[derive(Debug, Clone)]
pub enum ResourceChange<K> {
    Applied(K),
    Deleted(K),
    /// Initial list finished; the lister is now synced
    Synced,
}

/// Watch `api`, feeding `writer` and reporting every change to `on_change`.
///
/// Runs until the task is aborted. Watch errors are logged and the stream
/// backs off and resumes.
pub fn spawn_watcher<K, F>(
    kind: &'static str,
    api: Api<K>,
    lister: &Lister<K>,
    writer: Writer<K>,
    on_change: F,
) -> JoinHandle<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default + Send + Sync,
    F: Fn(ResourceChange<K>) + Send + Sync + 'static,
{
    let synced = lister.synced_flag();

    tokio::spawn(async move {
        let stream = reflector(writer, watcher(api, WatcherConfig::default()).default_backoff());
        futures::pin_mut!(stream);

        info!("Starting {} watcher", kind);

        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Apply(object)) | Ok(watcher::Event::InitApply(object)) => {
                    debug!(
                        "{} applied: {}/{}",
                        kind,
                        object.namespace().unwrap_or_default(),
                        object.name_any()
                    );
                    on_change(ResourceChange::Applied(object));
                }
                Ok(watcher::Event::Delete(object)) => {
                    debug!(
                        "{} deleted: {}/{}",
                        kind,
                        object.namespace().unwrap_or_default(),
                        object.name_any()
                    );
                    on_change(ResourceChange::Deleted(object));
                }
                Ok(watcher::Event::Init) => {
                    debug!("{} watcher initialized", kind);
                }
                Ok(watcher::Event::InitDone) => {
                    synced.store(true, Ordering::Release);
                    info!("{} watcher initial sync complete", kind);
                    on_change(ResourceChange::Synced);
                }
                Err(e) => {
                    warn!("{} watcher error: {}", kind, e);
                }
            }
        }
    })
}
