//! Change notification
//!
//! Watch events for ingress resources are filtered down to the ones that
//! can change emitted configuration, then fanned out to registered handlers
//! as synthetic per-kind identities. Handlers only learn *that* something
//! changed; they list the store again to learn what.

use crate::annotations::ALWAYS_PUSH_LABEL;
use crate::sync::{safe_read, safe_write};
use common::{ConfigKind, ConfigMeta};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Kinds an ingress change can affect
pub const AFFECTED_KINDS: [ConfigKind; 4] = [
    ConfigKind::DestinationRule,
    ConfigKind::VirtualService,
    ConfigKind::EnvoyFilter,
    ConfigKind::Gateway,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Add,
    Update,
    Delete,
}

pub type EventHandler = Arc<dyn Fn(&ConfigMeta, Event) + Send + Sync>;

/// Handlers registered per emitted kind
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<BTreeMap<ConfigKind, Vec<EventHandler>>>,
}

impl HandlerRegistry {
    pub fn register(&self, kind: ConfigKind, handler: EventHandler) {
        safe_write(&self.handlers).entry(kind).or_default().push(handler);
    }

    pub fn notify(&self, meta: &ConfigMeta, event: Event) {
        let handlers = safe_read(&self.handlers)
            .get(&meta.kind)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler(meta, event);
        }
    }

    /// Tell every affected kind that ingress `namespace/name` changed
    pub fn notify_ingress(&self, namespace: &str, name: &str, event: Event) {
        for kind in AFFECTED_KINDS {
            self.notify(&synthetic_meta(kind, namespace, name), event);
        }
    }
}

/// `<name>-<kind suffix>`, marked for unconditional push
pub fn synthetic_meta(kind: ConfigKind, namespace: &str, name: &str) -> ConfigMeta {
    let mut meta = ConfigMeta::new(kind, namespace, format!("{}-{}", name, kind.suffix()));
    meta.labels
        .insert(ALWAYS_PUSH_LABEL.to_string(), "true".to_string());
    meta
}

/// What an update is compared on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub annotations: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub spec: serde_json::Value,
}

/// One observed watch event, already classified by the adapter
#[derive(Debug, Clone)]
pub enum ObservedChange {
    Applied {
        key: String,
        fingerprint: Fingerprint,
        /// Passes the class and namespace filters
        should_process: bool,
    },
    Deleted {
        key: String,
    },
}

/// Remembers which resources were processed and how they looked
#[derive(Debug, Default)]
pub struct EventFilter {
    processed: RwLock<HashMap<String, Fingerprint>>,
}

impl EventFilter {
    /// Decide whether a change must be announced, and as which event
    pub fn observe(&self, change: ObservedChange) -> Option<Event> {
        let mut processed = safe_write(&self.processed);
        match change {
            ObservedChange::Deleted { key } => processed.remove(&key).map(|_| Event::Delete),
            ObservedChange::Applied {
                key,
                fingerprint,
                should_process,
            } => {
                if !should_process {
                    // a resource that left our class is gone as far as we are concerned
                    return processed.remove(&key).map(|_| {
                        debug!("Ingress {} no longer selected", key);
                        Event::Delete
                    });
                }
                match processed.insert(key, fingerprint.clone()) {
                    None => Some(Event::Add),
                    Some(previous) if previous != fingerprint => Some(Event::Update),
                    Some(_) => None,
                }
            }
        }
    }

    pub fn was_processed(&self, key: &str) -> bool {
        safe_read(&self.processed).contains_key(key)
    }
}
