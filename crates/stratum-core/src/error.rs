//! Error types for the Stratum engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::LifecyclePhase;

/// Main error type for Stratum operations.
#[derive(Error, Debug, Clone)]
pub enum StratumError {
    /// Bad input (names, props, configuration values).
    #[error("Validation failed: {message}")]
    Validation { message: String },

    /// A resource handler returned an error.
    #[error("Resource {fqn} failed during {phase}: {message}")]
    HandlerFailed {
        fqn: String,
        phase: LifecyclePhase,
        message: String,
    },

    /// Replacement requested for a resource that owns nested resources.
    #[error("Resource {fqn} has children and cannot be replaced")]
    ReplaceHasChildren { fqn: String },

    /// Replacement requested before the resource ever existed.
    #[error("Resource {fqn} cannot be replaced in create phase")]
    ReplaceInCreatePhase { fqn: String },

    /// A handler broke the lifecycle contract.
    #[error("Contract violation by {fqn}: {message}")]
    ContractViolation { fqn: String, message: String },

    /// A value could not be converted to or from its canonical form.
    #[error("Cannot serialize {path} of {}: {message}", resource_label(.resource))]
    Serialization {
        resource: Option<String>,
        path: String,
        message: String,
    },

    /// Secret encryption or decryption failed.
    #[error("Secret error: {0}")]
    Secret(String),

    /// State store error.
    #[error("State store error: {message}")]
    StateError { message: String },

    /// No provider is registered for a recorded resource type.
    #[error("No provider registered for resource type {type_name}")]
    ProviderNotFound { type_name: String },

    /// Declaration against a scope whose block has already returned.
    #[error("Scope {scope} is sealed and cannot register resource {id}")]
    ScopeSealed { scope: String, id: String },

    /// Ambient declaration made outside any scope.
    #[error("No active scope; declare resources inside App::run or Scope::run")]
    NoActiveScope,

    /// One or more deletions failed during finalize or destroy.
    #[error("Finalize of scope {scope} failed: {}", summarize(.failures))]
    FinalizeFailed {
        scope: String,
        failures: Vec<DeletionFailure>,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// A single deletion that did not complete during finalize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionFailure {
    /// Fully-qualified name of the resource.
    pub fqn: String,

    /// Why the deletion failed.
    pub message: String,
}

impl StratumError {
    /// Returns true if re-running the program (or finalize) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StratumError::HandlerFailed { .. }
                | StratumError::StateError { .. }
                | StratumError::FinalizeFailed { .. }
        )
    }

    /// Returns the fully-qualified resource name if available.
    pub fn fqn(&self) -> Option<&str> {
        match self {
            StratumError::HandlerFailed { fqn, .. }
            | StratumError::ReplaceHasChildren { fqn }
            | StratumError::ReplaceInCreatePhase { fqn }
            | StratumError::ContractViolation { fqn, .. } => Some(fqn),
            StratumError::Serialization { resource, .. } => resource.as_deref(),
            _ => None,
        }
    }

    /// Attach the owning resource to a serialization error.
    pub fn with_resource(self, fqn: &str) -> Self {
        match self {
            StratumError::Serialization {
                resource: None,
                path,
                message,
            } => StratumError::Serialization {
                resource: Some(fqn.to_string()),
                path,
                message,
            },
            other => other,
        }
    }

    /// Shorthand for a state store error.
    pub fn state(message: impl Into<String>) -> Self {
        StratumError::StateError {
            message: message.into(),
        }
    }

    /// Shorthand for a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        StratumError::Validation {
            message: message.into(),
        }
    }
}

fn resource_label(resource: &Option<String>) -> &str {
    resource.as_deref().unwrap_or("<unattached value>")
}

fn summarize(failures: &[DeletionFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.fqn, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Convenience Result type for Stratum operations.
pub type Result<T> = std::result::Result<T, StratumError>;

impl From<serde_json::Error> for StratumError {
    fn from(err: serde_json::Error) -> Self {
        StratumError::Serialization {
            resource: None,
            path: "$".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for StratumError {
    fn from(err: std::io::Error) -> Self {
        StratumError::StateError {
            message: err.to_string(),
        }
    }
}
