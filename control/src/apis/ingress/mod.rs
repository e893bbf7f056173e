//! Ingress resource dialects
//!
//! The current `networking.k8s.io/v1` Ingress comes from k8s-openapi. The
//! legacy v1beta1 shape and the Knative ingress are declared here with
//! `kube::CustomResource` so they can be watched and cached the same way.

pub mod knative;
pub mod legacy;

pub use knative::KnativeIngress;
pub use legacy::LegacyIngress;

/// Annotation selecting the ingress class on v1 and legacy resources
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Annotation selecting the ingress class on Knative resources
pub const KNATIVE_INGRESS_CLASS_ANNOTATION: &str = "networking.knative.dev/ingress.class";
