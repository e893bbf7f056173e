//! Error types for PORTTI control plane

use thiserror::Error;

/// Control plane errors
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PorttiError {
    /// Resource shape is unusable (wrong spec, no rules and no default backend)
    #[error("Invalid ingress {resource}: {reason}")]
    InvalidResource { resource: String, reason: String },

    /// Backend could not be resolved (missing service, unknown port name)
    #[error("Backend resolution error: {0}")]
    BackendResolution(String),

    /// Listing request the store cannot serve
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PorttiError {
    pub fn invalid_resource(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidResource {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedOperation(msg.into())
    }
}

pub type Result<T, E = PorttiError> = std::result::Result<T, E>;
