//! Secret dependency tracking
//!
//! Resources reference secrets through annotations (basic auth credentials,
//! upstream client certificates). The credentials end up inlined in emitted
//! objects, so a secret edit must trigger a full push, but only when some
//! resource still depends on that secret.

use crate::apis::metrics::record_secret_change;
use crate::sync::{safe_read, safe_write};
use common::ConfigKind;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

pub const AUTH_SECRET_CHANGE_REASON: &str = "auth-secret-change";

/// Request for the discovery layer to recompute and push configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRequest {
    pub full: bool,
    pub configs_updated: BTreeSet<ConfigKind>,
    pub reason: String,
}

/// Receiver of push requests, implemented by the discovery layer
pub trait PushNotifier: Send + Sync {
    fn push(&self, request: PushRequest);
}

#[derive(Debug, Default)]
struct TrackerState {
    /// Secret key to the resources depending on it
    dependents: BTreeMap<String, BTreeSet<String>>,
    /// Resource key to the secrets it depends on
    configs: BTreeMap<String, BTreeSet<String>>,
    /// Secrets referenced by the latest pass
    watched: BTreeSet<String>,
}

/// Reference-counted interest set of secrets
///
/// Keys are `cluster/namespace/name` for both secrets and resources.
pub struct SecretTracker {
    state: RwLock<TrackerState>,
    notifier: Option<Arc<dyn PushNotifier>>,
}

impl TrackerState {
    fn add_config(&mut self, secret: &str, config: &str) {
        self.dependents
            .entry(secret.to_string())
            .or_default()
            .insert(config.to_string());
        self.configs
            .entry(config.to_string())
            .or_default()
            .insert(secret.to_string());
    }

    fn delete_config(&mut self, config: &str) {
        let Some(secrets) = self.configs.remove(config) else {
            return;
        };
        for secret in secrets {
            if let Some(dependents) = self.dependents.get_mut(&secret) {
                dependents.remove(config);
                if dependents.is_empty() {
                    self.dependents.remove(&secret);
                    self.watched.remove(&secret);
                    debug!("Secret {} has no dependents left", secret);
                }
            }
        }
    }
}

impl SecretTracker {
    pub fn new(notifier: Option<Arc<dyn PushNotifier>>) -> Self {
        Self {
            state: RwLock::new(TrackerState::default()),
            notifier,
        }
    }

    /// Register that `config` depends on `secret`; repeating it is a no-op
    pub fn add_config(&self, secret: &str, config: &str) {
        safe_write(&self.state).add_config(secret, config);
    }

    /// Drop every dependency of `config`, untracking secrets left without dependents
    pub fn delete_config(&self, config: &str) {
        safe_write(&self.state).delete_config(config);
    }

    /// Replace the dependency set with the one observed by a pass
    ///
    /// The rebuild happens under a single write guard, so a concurrent
    /// secret change never sees a half-applied set.
    pub fn refresh(&self, observed: &BTreeMap<String, BTreeSet<String>>) {
        let mut state = safe_write(&self.state);
        let stale: Vec<String> = state
            .configs
            .keys()
            .filter(|config| !observed.contains_key(*config))
            .cloned()
            .collect();
        for config in stale {
            state.delete_config(&config);
        }

        for (config, secrets) in observed {
            if state.configs.get(config) == Some(secrets) {
                continue;
            }
            state.delete_config(config);
            for secret in secrets {
                state.add_config(secret, config);
            }
        }
    }

    /// Replace the set of secrets referenced by the latest pass
    pub fn set_watched(&self, watched: BTreeSet<String>) {
        safe_write(&self.state).watched = watched;
    }

    pub fn is_watched(&self, secret: &str) -> bool {
        safe_read(&self.state).watched.contains(secret)
    }

    pub fn is_tracked(&self, secret: &str) -> bool {
        safe_read(&self.state).dependents.contains_key(secret)
    }

    pub fn dependents(&self, secret: &str) -> BTreeSet<String> {
        safe_read(&self.state)
            .dependents
            .get(secret)
            .cloned()
            .unwrap_or_default()
    }

    /// Push everything when a secret some resource depends on changed.
    ///
    /// Returns whether a push was requested.
    pub fn handle_secret_change(&self, secret: &str) -> bool {
        let relevant = {
            let state = safe_read(&self.state);
            state
                .dependents
                .get(secret)
                .is_some_and(|dependents| !dependents.is_empty())
        };
        if !relevant {
            record_secret_change("ignored");
            return false;
        }

        info!("Secret {} changed, requesting full push", secret);
        record_secret_change("pushed");
        if let Some(notifier) = &self.notifier {
            notifier.push(PushRequest {
                full: true,
                configs_updated: [ConfigKind::VirtualService, ConfigKind::EnvoyFilter]
                    .into_iter()
                    .collect(),
                reason: AUTH_SECRET_CHANGE_REASON.to_string(),
            });
        }
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub(crate) requests: Mutex<Vec<PushRequest>>,
    }

    impl PushNotifier for RecordingNotifier {
        fn push(&self, request: PushRequest) {
            self.requests.lock().unwrap().push(request);
        }
    }

    #[test]
    fn test_add_twice_delete_once_untracks() {
        let tracker = SecretTracker::new(None);
        tracker.add_config("c1/default/basic", "c1/default/echo");
        tracker.add_config("c1/default/basic", "c1/default/echo");

        tracker.delete_config("c1/default/echo");

        assert!(!tracker.is_tracked("c1/default/basic"));
        assert!(tracker.dependents("c1/default/basic").is_empty());
    }

    #[test]
    fn test_secret_stays_tracked_while_any_dependent_remains() {
        let tracker = SecretTracker::new(None);
        tracker.add_config("c1/default/basic", "c1/default/a");
        tracker.add_config("c1/default/basic", "c1/default/b");

        tracker.delete_config("c1/default/a");

        assert!(tracker.is_tracked("c1/default/basic"));
        assert_eq!(tracker.dependents("c1/default/basic").len(), 1);
    }

    #[test]
    fn test_change_pushes_only_with_dependents() {
        let notifier = Arc::new(RecordingNotifier::default());
        let tracker = SecretTracker::new(Some(notifier.clone()));

        assert!(!tracker.handle_secret_change("c1/default/basic"));
        assert!(notifier.requests.lock().unwrap().is_empty());

        tracker.add_config("c1/default/basic", "c1/default/echo");
        assert!(tracker.handle_secret_change("c1/default/basic"));

        let requests = notifier.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].full);
        assert_eq!(requests[0].reason, "auth-secret-change");
        assert!(requests[0].configs_updated.contains(&ConfigKind::EnvoyFilter));
    }

    #[test]
    fn test_watched_secret_without_dependents_is_ignored() {
        let notifier = Arc::new(RecordingNotifier::default());
        let tracker = SecretTracker::new(Some(notifier.clone()));
        tracker.set_watched(["c1/default/basic".to_string()].into_iter().collect());
        assert!(!tracker.handle_secret_change("c1/default/basic"));

        tracker.add_config("c1/default/basic", "c1/default/echo");
        tracker.add_config("c1/default/basic", "c1/default/echo");
        tracker.delete_config("c1/default/echo");

        assert!(!tracker.is_tracked("c1/default/basic"));
        assert!(!tracker.is_watched("c1/default/basic"));
        assert!(!tracker.handle_secret_change("c1/default/basic"));
        assert!(notifier.requests.lock().unwrap().is_empty());
    }

    #[test]
    fn test_refresh_drops_resources_no_longer_listed() {
        let tracker = SecretTracker::new(None);
        tracker.add_config("c1/default/old", "c1/default/gone");

        let mut observed = BTreeMap::new();
        observed.insert(
            "c1/default/echo".to_string(),
            ["c1/default/basic".to_string()].into_iter().collect(),
        );
        tracker.refresh(&observed);

        assert!(!tracker.is_tracked("c1/default/old"));
        assert!(tracker.is_tracked("c1/default/basic"));

        tracker.refresh(&BTreeMap::new());
        assert!(!tracker.is_tracked("c1/default/basic"));
    }
}
