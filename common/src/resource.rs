//! Typed envelope for emitted configuration objects

use crate::networking::{
    DestinationRule, EnvoyFilter, Gateway, PluginConfig, ServiceEntry, VirtualService,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kinds of configuration object served to the data plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConfigKind {
    Gateway,
    VirtualService,
    DestinationRule,
    EnvoyFilter,
    ServiceEntry,
    PluginConfig,
}

impl ConfigKind {
    pub const ALL: [ConfigKind; 6] = [
        ConfigKind::Gateway,
        ConfigKind::VirtualService,
        ConfigKind::DestinationRule,
        ConfigKind::EnvoyFilter,
        ConfigKind::ServiceEntry,
        ConfigKind::PluginConfig,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            ConfigKind::Gateway => "Gateway",
            ConfigKind::VirtualService => "VirtualService",
            ConfigKind::DestinationRule => "DestinationRule",
            ConfigKind::EnvoyFilter => "EnvoyFilter",
            ConfigKind::ServiceEntry => "ServiceEntry",
            ConfigKind::PluginConfig => "PluginConfig",
        }
    }

    /// Lower-case suffix used when naming per-resource change notifications
    pub const fn suffix(&self) -> &'static str {
        match self {
            ConfigKind::Gateway => "gateway",
            ConfigKind::VirtualService => "virtualservice",
            ConfigKind::DestinationRule => "destinationrule",
            ConfigKind::EnvoyFilter => "envoyfilter",
            ConfigKind::ServiceEntry => "serviceentry",
            ConfigKind::PluginConfig => "pluginconfig",
        }
    }
}

impl fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity and labels of an emitted object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigMeta {
    pub kind: ConfigKind,
    pub name: String,
    pub namespace: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ConfigMeta {
    pub fn new(kind: ConfigKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: namespace.into(),
            annotations: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }
}

impl fmt::Display for ConfigMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "spec")]
pub enum ConfigSpec {
    Gateway(Gateway),
    VirtualService(VirtualService),
    DestinationRule(DestinationRule),
    EnvoyFilter(EnvoyFilter),
    ServiceEntry(ServiceEntry),
    PluginConfig(PluginConfig),
}

impl ConfigSpec {
    pub fn kind(&self) -> ConfigKind {
        match self {
            ConfigSpec::Gateway(_) => ConfigKind::Gateway,
            ConfigSpec::VirtualService(_) => ConfigKind::VirtualService,
            ConfigSpec::DestinationRule(_) => ConfigKind::DestinationRule,
            ConfigSpec::EnvoyFilter(_) => ConfigKind::EnvoyFilter,
            ConfigSpec::ServiceEntry(_) => ConfigKind::ServiceEntry,
            ConfigSpec::PluginConfig(_) => ConfigKind::PluginConfig,
        }
    }
}

/// An emitted configuration object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigObject {
    pub meta: ConfigMeta,
    pub spec: ConfigSpec,
}
