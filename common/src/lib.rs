//! PORTTI Common Types
//!
//! The normalized routing configuration model produced by the control plane
//! and consumed by the data plane's discovery layer, plus the small helpers
//! both sides agree on (host hashing, HTTP method vocabulary).

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod networking;
pub mod resource;

pub use networking::*;
pub use resource::{ConfigKind, ConfigMeta, ConfigObject, ConfigSpec};

/// Cluster-local service domain suffix
pub const DEFAULT_DOMAIN_SUFFIX: &str = "svc.cluster.local";

/// HTTP methods accepted by method match rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    GET,
    HEAD,
    POST,
    PUT,
    DELETE,
    CONNECT,
    OPTIONS,
    TRACE,
    PATCH,
}

impl HttpMethod {
    /// Every method, in canonical order
    pub const ALL: [HttpMethod; 9] = [
        HttpMethod::GET,
        HttpMethod::HEAD,
        HttpMethod::POST,
        HttpMethod::PUT,
        HttpMethod::DELETE,
        HttpMethod::CONNECT,
        HttpMethod::OPTIONS,
        HttpMethod::TRACE,
        HttpMethod::PATCH,
    ];

    /// Parse an upper-case method token
    /// Returns None if the token is not a known method
    pub fn parse(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == token)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::GET => "GET",
            HttpMethod::HEAD => "HEAD",
            HttpMethod::POST => "POST",
            HttpMethod::PUT => "PUT",
            HttpMethod::DELETE => "DELETE",
            HttpMethod::CONNECT => "CONNECT",
            HttpMethod::OPTIONS => "OPTIONS",
            HttpMethod::TRACE => "TRACE",
            HttpMethod::PATCH => "PATCH",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// FNV-1a hash function for stable naming
pub const fn fnv1a_hash(bytes: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}

/// Turn a host (possibly a wildcard) into a DNS-label-safe token.
///
/// Output is 16 lowercase hex digits and depends only on the input bytes,
/// so names built from it are identical across passes and processes.
pub fn clean_host(host: &str) -> String {
    format!("{:016x}", fnv1a_hash(host.as_bytes()))
}

/// Join the non-empty parts with "-"
pub fn create_converted_name<S: AsRef<str>>(items: &[S]) -> String {
    items
        .iter()
        .map(AsRef::as_ref)
        .filter(|item| !item.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Fully qualified in-cluster service host: `name.namespace.svc.cluster.local`
pub fn service_fqdn(namespace: &str, name: &str) -> String {
    format!("{}.{}.{}", name, namespace, DEFAULT_DOMAIN_SUFFIX)
}

/// Split a service FQDN back into (name, namespace).
///
/// Hosts without a namespace label return an empty namespace.
pub fn split_service_fqdn(fqdn: &str) -> (String, String) {
    let mut parts = fqdn.split('.');
    let name = parts.next().unwrap_or_default().to_string();
    let namespace = parts.next().unwrap_or_default().to_string();
    (name, namespace)
}
