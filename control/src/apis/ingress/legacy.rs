//! networking.k8s.io/v1beta1 Ingress
//!
//! Removed from the Kubernetes API in 1.22 but still served by some
//! clusters. Backends name their service with `serviceName`/`servicePort`
//! and the default backend lives in `spec.backend`.

use k8s_openapi::api::core::v1::TypedLocalObjectReference;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "networking.k8s.io",
    version = "v1beta1",
    kind = "Ingress",
    root = "LegacyIngress",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LegacyIngressSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class_name: Option<String>,

    /// Default backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<LegacyIngressBackend>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tls: Vec<LegacyIngressTls>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<LegacyIngressRule>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LegacyIngressBackend {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_port: Option<IntOrString>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<TypedLocalObjectReference>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LegacyIngressTls {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LegacyIngressRule {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<LegacyHttpIngressRuleValue>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct LegacyHttpIngressRuleValue {
    #[serde(default)]
    pub paths: Vec<LegacyHttpIngressPath>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LegacyHttpIngressPath {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,

    /// `Exact`, `Prefix` or `ImplementationSpecific`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_type: Option<String>,

    pub backend: LegacyIngressBackend,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_legacy_shape() {
        let json = serde_json::json!({
            "apiVersion": "networking.k8s.io/v1beta1",
            "kind": "Ingress",
            "metadata": {"name": "echo", "namespace": "default"},
            "spec": {
                "backend": {"serviceName": "fallback", "servicePort": 8080},
                "rules": [{
                    "host": "echo.example.com",
                    "http": {"paths": [{
                        "path": "/api",
                        "backend": {"serviceName": "echo", "servicePort": "http"}
                    }]}
                }]
            }
        });

        let ingress: LegacyIngress = serde_json::from_value(json).unwrap();
        let default_backend = ingress.spec.backend.as_ref().unwrap();
        assert_eq!(default_backend.service_name, "fallback");
        assert_eq!(default_backend.service_port, Some(IntOrString::Int(8080)));

        let path = &ingress.spec.rules[0].http.as_ref().unwrap().paths[0];
        assert_eq!(path.backend.service_port, Some(IntOrString::String("http".into())));
        assert!(path.path_type.is_none(), "pathType is optional in v1beta1");
    }
}
