//! Error types for the Tierform engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration and graph resolution, state management, provider calls,
//! the apply engine, and output resolution.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Tierform engine.
#[derive(Debug, Error)]
pub enum TierformError {
    /// Configuration-related errors (fatal before any provider call).
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider control-plane errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Apply engine errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// Output resolution errors.
    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The plan file was not found.
    #[error("Plan file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The plan file could not be parsed.
    #[error("Failed to parse plan: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Plan validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// Duplicate resource identifier.
    #[error("Duplicate resource id: {id}")]
    DuplicateId {
        /// The duplicated identifier.
        id: String,
    },

    /// Unknown resource type tag.
    #[error("Unknown resource type '{type_name}' for resource {id}")]
    UnknownResourceType {
        /// Declaring resource.
        id: String,
        /// The unrecognized type tag.
        type_name: String,
    },

    /// A reference names a resource that is not declared.
    #[error("Resource {from} references undeclared resource {target}")]
    UnknownReference {
        /// Resource (or output) holding the reference.
        from: String,
        /// The missing target.
        target: String,
    },

    /// A reference is malformed or names an attribute the target does not export.
    #[error("Invalid reference in {from}: {message}")]
    InvalidReference {
        /// Resource (or output) holding the reference.
        from: String,
        /// Description of the problem.
        message: String,
    },

    /// Circular dependency detected.
    #[error("Circular dependency detected between: {}", members.join(", "))]
    CircularDependency {
        /// Identifiers participating in the cycle.
        members: Vec<String>,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Local state file could not be written.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the write failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },

    /// A resource status transition violated the lifecycle.
    #[error("Invalid status transition for {resource}: {from} -> {to}")]
    InvalidTransition {
        /// Resource identifier.
        resource: String,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },
}

/// Provider control-plane errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Authentication with the control plane failed.
    #[error("Provider authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the auth failure.
        message: String,
    },

    /// The provider rejected the request (validation, quota, conflict).
    #[error("Provider rejected {resource}: {status} - {message}")]
    Rejected {
        /// Resource the request was for.
        resource: String,
        /// HTTP-like status code.
        status: u16,
        /// Message from the provider.
        message: String,
    },

    /// The handle is unknown to the provider.
    #[error("Resource handle not found: {handle}")]
    NotFound {
        /// Provider handle.
        handle: String,
    },

    /// Rate limited.
    #[error("Provider rate limited, retry after {retry_after_secs} seconds")]
    Throttled {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// Network error.
    #[error("Network error communicating with provider: {message}")]
    Network {
        /// Description of the network error.
        message: String,
    },

    /// Invalid response body.
    #[error("Invalid response from provider: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// The provider reported the asynchronous operation as failed.
    #[error("Provider operation failed for {resource}: {reason}")]
    OperationFailed {
        /// Resource identifier.
        resource: String,
        /// Reason reported by the provider.
        reason: String,
    },
}

/// Apply engine errors.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// Readiness was not reached within the bound.
    #[error("Timeout waiting for {resource} to become {expected_state} after {waited_secs}s")]
    Timeout {
        /// Resource identifier.
        resource: String,
        /// State that was never reached.
        expected_state: String,
        /// Seconds spent waiting.
        waited_secs: u64,
    },

    /// The run was cancelled before the resource completed.
    #[error("Operation on {resource} cancelled")]
    Cancelled {
        /// Resource identifier.
        resource: String,
    },

    /// A dependency failed, so the resource was never attempted.
    #[error("{resource} blocked by failed dependency {dependency}")]
    DependencyFailed {
        /// Resource identifier.
        resource: String,
        /// The failed dependency.
        dependency: String,
    },

    /// A reference could not be resolved when building a create request.
    #[error("Cannot resolve {reference} for {resource}: {reason}")]
    ReferenceResolution {
        /// Resource identifier.
        resource: String,
        /// The reference text.
        reference: String,
        /// Why it could not be resolved.
        reason: String,
    },

    /// The run was aborted.
    #[error("Run aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },
}

/// Output resolution errors.
#[derive(Debug, Error)]
pub enum OutputError {
    /// An output references a resource that never became ready.
    #[error("Output '{output}' references {resource}, which is not ready")]
    UnresolvedReference {
        /// Output name.
        output: String,
        /// Referenced resource.
        resource: String,
    },

    /// The referenced resource is ready but lacks the attribute.
    #[error("Output '{output}' references missing attribute {resource}.{attribute}")]
    MissingAttribute {
        /// Output name.
        output: String,
        /// Referenced resource.
        resource: String,
        /// Missing attribute.
        attribute: String,
    },

    /// No output with this name is declared.
    #[error("No output named '{name}'")]
    UnknownOutput {
        /// Requested name.
        name: String,
    },
}

/// Result type alias for Tierform operations.
pub type Result<T> = std::result::Result<T, TierformError>;

impl TierformError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider(
                ProviderError::Throttled { .. }
                    | ProviderError::Network { .. }
                    | ProviderError::Rejected { status: 500..=599, .. }
            ) | Self::State(StateError::LockFailed { .. })
        )
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Provider(ProviderError::Throttled { retry_after_secs }) => Some(*retry_after_secs),
            Self::Provider(ProviderError::Network { .. } | ProviderError::Rejected { status: 500..=599, .. }) => Some(1),
            Self::State(StateError::LockFailed { .. }) => Some(2),
            _ => None,
        }
    }

    /// Returns true if the error means the provider no longer knows the handle.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Provider(ProviderError::NotFound { .. }))
    }

    /// Returns true if the error is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }

    /// Creates an invalid reference error.
    #[must_use]
    pub fn invalid_reference(from: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidReference {
            from: from.into(),
            message: message.into(),
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a write error with the given message.
    #[must_use]
    pub fn write(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a rejection error.
    #[must_use]
    pub fn rejected(resource: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            resource: resource.into(),
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let throttled = TierformError::Provider(ProviderError::Throttled { retry_after_secs: 7 });
        assert!(throttled.is_retryable());
        assert_eq!(throttled.retry_delay_secs(), Some(7));

        let rejected = TierformError::Provider(ProviderError::rejected("vpc", 400, "bad cidr"));
        assert!(!rejected.is_retryable());
        assert_eq!(rejected.retry_delay_secs(), None);
    }

    #[test]
    fn test_cycle_message_names_members() {
        let err = ConfigError::CircularDependency {
            members: vec![String::from("a"), String::from("b")],
        };
        assert_eq!(err.to_string(), "Circular dependency detected between: a, b");
    }

    #[test]
    fn test_not_found_detection() {
        let err = TierformError::from(ProviderError::NotFound {
            handle: String::from("arn:aws:ec2:vpc/1"),
        });
        assert!(err.is_not_found());
        assert!(!err.is_config());
    }
}
