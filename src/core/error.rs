//! Error taxonomy for configuration, composition, credentials, and state.

use crate::core::types::Urn;
use thiserror::Error;

/// Every failure the stack can surface. The first one aborts the run.
#[derive(Error, Debug)]
pub enum InfraError {
    #[error("missing required configuration key '{0}'")]
    MissingConfig(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("resource '{0}' is already registered")]
    DuplicateResource(Urn),

    #[error("resource '{resource}' depends on unknown resource '{dependency}'")]
    UnknownDependency { resource: Urn, dependency: Urn },

    #[error("dependency cycle detected involving: {0}")]
    Cycle(String),

    #[error("value of '{urn}.{key}' is not known yet")]
    Unresolved { urn: Urn, key: String },

    #[error("attribute '{key}' of '{urn}' has unexpected shape: {reason}")]
    AttributeType { urn: Urn, key: String, reason: String },

    #[error("provider error on {resource}: {message}")]
    Provider { resource: String, message: String },

    #[error("registry credentials could not be decoded: {0}")]
    CredentialDecode(String),

    #[error("state error: {0}")]
    State(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl InfraError {
    /// Shorthand for a provider-side failure on a named resource.
    pub fn provider(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// True when the error only means "known after apply".
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::Unresolved { .. })
    }
}

pub type Result<T> = std::result::Result<T, InfraError>;
