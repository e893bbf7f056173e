//! Knative networking ingress (`networking.internal.knative.dev/v1alpha1`)
//!
//! Knative Serving writes these for every route it exposes. Unlike the
//! Kubernetes Ingress a rule serves several hosts, carries a visibility and
//! splits traffic between revisions by percent.

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "networking.internal.knative.dev",
    version = "v1alpha1",
    kind = "Ingress",
    root = "KnativeIngress",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct KnativeIngressSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tls: Vec<KnativeIngressTls>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<KnativeIngressRule>,

    #[serde(default)]
    pub http_option: HttpOption,
}

/// Plain HTTP behaviour of public hosts
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum HttpOption {
    #[default]
    Enabled,
    Redirected,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Visibility {
    #[default]
    ExternalIP,
    ClusterLocal,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KnativeIngressTls {
    #[serde(default)]
    pub hosts: Vec<String>,

    #[serde(default)]
    pub secret_name: String,

    /// Defaults to the ingress namespace when empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret_namespace: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KnativeIngressRule {
    #[serde(default)]
    pub hosts: Vec<String>,

    #[serde(default)]
    pub visibility: Visibility,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<KnativeHttpIngressRuleValue>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct KnativeHttpIngressRuleValue {
    #[serde(default)]
    pub paths: Vec<KnativeHttpIngressPath>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KnativeHttpIngressPath {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rewrite_host: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, HeaderMatch>,

    #[serde(default)]
    pub splits: Vec<KnativeIngressBackendSplit>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub append_headers: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct HeaderMatch {
    pub exact: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KnativeIngressBackendSplit {
    #[serde(default)]
    pub service_namespace: String,

    #[serde(default)]
    pub service_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_port: Option<IntOrString>,

    #[serde(default)]
    pub percent: i32,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub append_headers: BTreeMap<String, String>,
}

impl KnativeIngressBackendSplit {
    /// Numeric service port; named ports that are not numbers resolve to 0
    pub fn port_number(&self) -> u32 {
        match &self.service_port {
            Some(IntOrString::Int(port)) => u32::try_from(*port).unwrap_or_default(),
            Some(IntOrString::String(port)) => port.parse().unwrap_or_default(),
            None => 0,
        }
    }
}
