//! PORTTI Control Plane Library
//!
//! Converts Kubernetes ingress resources (networking.k8s.io/v1, the legacy
//! v1beta1 shape and Knative ingresses) into the normalized gateway, virtual
//! service and destination rule objects served to the data plane.

pub mod annotations;
pub mod apis;
pub mod config;
pub mod error;
pub mod ingress;
pub mod sync;

pub use config::{ClusterOptions, ControllerConfig};
pub use error::{PorttiError, Result};
pub use ingress::IngressConfigStore;
