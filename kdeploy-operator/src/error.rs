//! Error types for the kdeploy operator.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during operator operations.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Resource not found.
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        /// Resource kind.
        kind: String,
        /// Resource name.
        name: String,
        /// Resource namespace.
        namespace: String,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A watched object failed validation and must be dropped.
    #[error("Validation failed: {0}")]
    ValidationError(String),

    /// An object could not be decoded into its typed representation.
    #[error("Failed to decode {kind}: {reason}")]
    DecodeError {
        /// Expected resource kind.
        kind: String,
        /// Why decoding failed.
        reason: String,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A bounded wait ran out of time.
    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout {
        /// What was being waited for.
        what: String,
        /// How long the wait lasted.
        after: Duration,
    },

    /// The operation was interrupted by shutdown.
    #[error("Operation cancelled")]
    Cancelled,

    /// Resource type registration failed.
    #[error("Resource type registration failed: {0}")]
    RegistrationError(String),
}

/// Result type for operator operations.
pub type OperatorResult<T> = Result<T, OperatorError>;

impl OperatorError {
    /// The object does not exist (API 404 or an explicit lookup miss).
    pub fn is_not_found(&self) -> bool {
        match self {
            OperatorError::NotFound { .. } => true,
            OperatorError::KubeError(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Worth retrying: conflicts, throttling, server-side failures and
    /// transport errors. Never true for validation problems.
    pub fn is_transient(&self) -> bool {
        match self {
            OperatorError::KubeError(kube::Error::Api(resp)) => {
                matches!(resp.code, 409 | 410 | 429) || resp.code >= 500
            }
            OperatorError::KubeError(
                kube::Error::HyperError(_) | kube::Error::Service(_) | kube::Error::ReadEvents(_),
            ) => true,
            OperatorError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// The event carrying this object should be logged and dropped.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            OperatorError::ValidationError(_) | OperatorError::DecodeError { .. }
        )
    }

    /// Shorthand for a [`OperatorError::ValidationError`].
    pub fn validation(msg: impl Into<String>) -> Self {
        OperatorError::ValidationError(msg.into())
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for OperatorError {
    fn from(err: serde_yaml::Error) -> Self {
        OperatorError::SerializationError(err.to_string())
    }
}
