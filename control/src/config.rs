//! Configuration for PORTTI controller
//!
//! Process-level settings come from `PORTTI_*` environment variables.
//! Per-cluster settings ([`ClusterOptions`]) are derived from the process
//! settings or from a composite cluster id of the form
//! `k8sId_ingressClass_watchNamespace[_enableStatus]`.

use serde::{Deserialize, Serialize};
use std::env;

/// Ingress class used when a cluster id does not name one
pub const DEFAULT_INGRESS_CLASS: &str = "nginx";

/// Controller value an IngressClass must carry to be ours
pub const INGRESS_CONTROLLER_NAME: &str = "portti.io/ingress-controller";

/// Controller configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Namespace that owns every emitted object
    #[serde(default = "default_system_namespace")]
    pub system_namespace: String,

    /// Composite id of the local cluster
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    /// Ingress class to process (`*` means every class, empty means unclassed only)
    #[serde(default = "default_ingress_class")]
    pub ingress_class: String,

    /// Restrict processing to one namespace (empty watches all)
    #[serde(default)]
    pub watch_namespace: String,

    /// Gateway workload selector, e.g. `app=portti-gateway`
    #[serde(default = "default_gateway_selector_key")]
    pub gateway_selector_key: String,

    #[serde(default = "default_gateway_selector_value")]
    pub gateway_selector_value: String,

    #[serde(default)]
    pub ports: GatewayPorts,

    /// Also watch networking.k8s.io/v1beta1 Ingress
    #[serde(default = "default_false")]
    pub enable_legacy_ingress: bool,

    /// Also watch Knative ingresses
    #[serde(default = "default_false")]
    pub enable_knative: bool,

    /// Knative ingress class we answer to
    #[serde(default = "default_knative_class")]
    pub knative_ingress_class: String,

    /// Domain based fallback for TLS secrets
    #[serde(default)]
    pub https_credentials: Option<HttpsCredentialConfig>,

    /// Minimum delay between two conversion passes in milliseconds
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

/// Gateway listener ports
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayPorts {
    #[serde(default = "default_http_port")]
    pub http: u32,

    #[serde(default = "default_https_port")]
    pub https: u32,
}

fn default_system_namespace() -> String {
    "portti-system".to_string()
}

fn default_cluster_id() -> String {
    "Kubernetes".to_string()
}

fn default_ingress_class() -> String {
    DEFAULT_INGRESS_CLASS.to_string()
}

fn default_gateway_selector_key() -> String {
    "app".to_string()
}

fn default_gateway_selector_value() -> String {
    "portti-gateway".to_string()
}

fn default_knative_class() -> String {
    "portti".to_string()
}

fn default_http_port() -> u32 {
    80
}

fn default_https_port() -> u32 {
    443
}

fn default_false() -> bool {
    false
}

fn default_debounce_ms() -> u64 {
    100
}

impl Default for GatewayPorts {
    fn default() -> Self {
        Self {
            http: default_http_port(),
            https: default_https_port(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            system_namespace: default_system_namespace(),
            cluster_id: default_cluster_id(),
            ingress_class: default_ingress_class(),
            watch_namespace: String::new(),
            gateway_selector_key: default_gateway_selector_key(),
            gateway_selector_value: default_gateway_selector_value(),
            ports: GatewayPorts::default(),
            enable_legacy_ingress: default_false(),
            enable_knative: default_false(),
            knative_ingress_class: default_knative_class(),
            https_credentials: None,
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, crate::error::PorttiError> {
        let mut config = Self::default();

        if let Ok(val) = env::var("PORTTI_SYSTEM_NAMESPACE") {
            config.system_namespace = val;
        }
        if let Ok(val) = env::var("PORTTI_CLUSTER_ID") {
            config.cluster_id = val;
        }
        if let Ok(val) = env::var("PORTTI_INGRESS_CLASS") {
            config.ingress_class = val;
        }
        if let Ok(val) = env::var("PORTTI_WATCH_NAMESPACE") {
            config.watch_namespace = val;
        }
        if let Ok(val) = env::var("PORTTI_GATEWAY_SELECTOR") {
            let (key, value) = val.split_once('=').ok_or_else(|| {
                crate::error::PorttiError::Config(format!(
                    "PORTTI_GATEWAY_SELECTOR must be key=value, got '{}'",
                    val
                ))
            })?;
            config.gateway_selector_key = key.to_string();
            config.gateway_selector_value = value.to_string();
        }
        if let Ok(val) = env::var("PORTTI_GATEWAY_HTTP_PORT") {
            config.ports.http = parse_env("PORTTI_GATEWAY_HTTP_PORT", &val)?;
        }
        if let Ok(val) = env::var("PORTTI_GATEWAY_HTTPS_PORT") {
            config.ports.https = parse_env("PORTTI_GATEWAY_HTTPS_PORT", &val)?;
        }
        if let Ok(val) = env::var("PORTTI_ENABLE_LEGACY_INGRESS") {
            config.enable_legacy_ingress = parse_env("PORTTI_ENABLE_LEGACY_INGRESS", &val)?;
        }
        if let Ok(val) = env::var("PORTTI_ENABLE_KNATIVE") {
            config.enable_knative = parse_env("PORTTI_ENABLE_KNATIVE", &val)?;
        }
        if let Ok(val) = env::var("PORTTI_KNATIVE_INGRESS_CLASS") {
            config.knative_ingress_class = val;
        }
        if let Ok(val) = env::var("PORTTI_HTTPS_CREDENTIALS") {
            let parsed: HttpsCredentialConfig = serde_json::from_str(&val).map_err(|e| {
                crate::error::PorttiError::Config(format!(
                    "PORTTI_HTTPS_CREDENTIALS is not valid JSON: {}",
                    e
                ))
            })?;
            config.https_credentials = Some(parsed);
        }
        if let Ok(val) = env::var("PORTTI_DEBOUNCE_MS") {
            config.debounce_ms = parse_env("PORTTI_DEBOUNCE_MS", &val)?;
        }

        Ok(config)
    }

    /// Options for the local cluster
    pub fn cluster_options(&self) -> ClusterOptions {
        ClusterOptions {
            enable: true,
            cluster_id: self.cluster_id.clone(),
            raw_cluster_id: self.cluster_id.clone(),
            ingress_class: self.ingress_class.clone(),
            watch_namespace: self.watch_namespace.clone(),
            enable_status: true,
            system_namespace: self.system_namespace.clone(),
            gateway_selector_key: self.gateway_selector_key.clone(),
            gateway_selector_value: self.gateway_selector_value.clone(),
            gateway_http_port: self.ports.http,
            gateway_https_port: self.ports.https,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, crate::error::PorttiError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| {
        crate::error::PorttiError::Config(format!("{} has invalid value '{}': {}", name, value, e))
    })
}

/// Per-cluster conversion options
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterOptions {
    pub enable: bool,
    pub cluster_id: String,
    pub raw_cluster_id: String,
    pub ingress_class: String,
    pub watch_namespace: String,
    pub enable_status: bool,
    pub system_namespace: String,
    pub gateway_selector_key: String,
    pub gateway_selector_value: String,
    pub gateway_http_port: u32,
    pub gateway_https_port: u32,
}

impl ClusterOptions {
    /// Derive options from a composite cluster id.
    ///
    /// Ids with fewer than three `_`-separated parts are treated as plain
    /// cluster names and come back disabled.
    pub fn from_cluster_id(raw: &str) -> Self {
        let parts: Vec<&str> = raw.split('_').collect();
        if parts.len() < 3 {
            return Self {
                cluster_id: parts.first().map(|p| p.to_string()).unwrap_or_default(),
                raw_cluster_id: raw.to_string(),
                ..Default::default()
            };
        }

        let mut options = Self {
            enable: true,
            cluster_id: parts[0].to_string(),
            ingress_class: parts[1].to_string(),
            watch_namespace: parts[2].to_string(),
            raw_cluster_id: raw.to_string(),
            enable_status: true,
            ..Default::default()
        };

        if parts.len() == 4 {
            if let Ok(enable) = parts[3].parse::<bool>() {
                options.enable_status = enable;
            }
        }
        options
    }

    /// Fill gateway-level settings from the process configuration
    pub fn with_gateway(mut self, config: &ControllerConfig) -> Self {
        self.system_namespace = config.system_namespace.clone();
        self.gateway_selector_key = config.gateway_selector_key.clone();
        self.gateway_selector_value = config.gateway_selector_value.clone();
        self.gateway_http_port = config.ports.http;
        self.gateway_https_port = config.ports.https;
        self
    }
}

/// One domain group sharing a TLS secret
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialEntry {
    pub domains: Vec<String>,

    /// `namespace/name` or bare `name` (system namespace)
    pub tls_secret: String,
}

/// Domain based TLS secret fallback
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpsCredentialConfig {
    /// Use the domain match when the ingress references a secret that does not exist
    #[serde(default)]
    pub fallback_for_invalid_secret: bool,

    #[serde(default)]
    pub credential_config: Vec<CredentialEntry>,
}

impl HttpsCredentialConfig {
    /// First configured secret whose domain covers `host`, or empty
    pub fn match_secret_name_by_domain(&self, host: &str) -> &str {
        let host = host.to_ascii_lowercase();
        for credential in &self.credential_config {
            for domain in &credential.domains {
                if host_is_subset(&host, &domain.to_ascii_lowercase()) {
                    return &credential.tls_secret;
                }
            }
        }
        ""
    }
}

/// Whether every name matched by `host` is also matched by `pattern`
fn host_is_subset(host: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if host == pattern {
        return true;
    }
    match (host.strip_prefix('*'), pattern.strip_prefix('*')) {
        // wildcard host can only fit a wildcard pattern with a shorter suffix
        (Some(host_suffix), Some(pattern_suffix)) => host_suffix.ends_with(pattern_suffix),
        (None, Some(pattern_suffix)) => host.ends_with(pattern_suffix),
        _ => false,
    }
}

/// Split `namespace/name`; a bare name has an empty namespace
pub fn parse_tls_secret(tls_secret: &str) -> (String, String) {
    let parts: Vec<&str> = tls_secret.split('/').collect();
    match parts.as_slice() {
        [name] => (String::new(), name.to_string()),
        [namespace, name] => (namespace.to_string(), name.to_string()),
        _ => (String::new(), String::new()),
    }
}
