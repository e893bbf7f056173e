//! Ingress conversion pipeline
//!
//! Listed resources are wrapped with their parsed annotations, converted by
//! the adapter of their dialect into per-host gateway and route fragments,
//! merged, ordered, and emitted as configuration objects by [`store`].

pub mod cache;
pub mod dialect;
pub mod events;
pub mod model;
pub mod ordering;
pub mod rule_key;
pub mod secret_tracker;
pub mod store;
pub mod weights;

pub use store::IngressConfigStore;
