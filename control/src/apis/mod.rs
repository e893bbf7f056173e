//! Kubernetes API integrations
//!
//! Resource types for the ingress dialects, the listers conversion reads
//! from, the watchers that keep them current, and controller metrics.

pub mod ingress;
pub mod listers;
pub mod metrics;
pub mod watch;
