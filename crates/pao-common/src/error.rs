//! Error types for the performance profile operator
//!
//! Errors are structured with fields to aid debugging in production. The
//! variants map onto how a failure is handled: validation errors go back to
//! the submitter, conflicts and Kubernetes errors are retried, rollout
//! timeouts and configuration errors are reported to the caller.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Stage of a rollout at which a wait gave up
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RolloutStage {
    /// The pool never referenced the generated configuration
    PickUp,
    /// The pool referenced it but the condition never reached the desired status
    Condition,
}

impl std::fmt::Display for RolloutStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RolloutStage::PickUp => write!(f, "pick-up"),
            RolloutStage::Condition => write!(f, "condition"),
        }
    }
}

/// Main error type for operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Malformed or contradictory profile
    #[error("validation error for {profile}{}: {message}", .field.as_ref().map(|f| format!(" at {f}")).unwrap_or_default())]
    Validation {
        /// Name of the profile with invalid configuration
        profile: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.cpu.reserved")
        field: Option<String>,
    },

    /// Concurrent modification that outlived the local retries
    #[error("conflict updating {kind} {name} after {attempts} attempts")]
    Conflict {
        /// Kind of the contended object
        kind: String,
        /// Name of the contended object
        name: String,
        /// Attempts made before giving up
        attempts: u32,
    },

    /// A rollout wait ran out of time
    #[error(
        "timed out after {elapsed:?} waiting for pool {pool} ({stage}): {condition_type} expected {desired}, last observed {}",
        .last_observed.as_deref().unwrap_or("nothing")
    )]
    RolloutTimeout {
        /// Pool being watched
        pool: String,
        /// Stage the wait was in
        stage: RolloutStage,
        /// Condition type (or configuration source) that was awaited
        condition_type: String,
        /// Desired status
        desired: String,
        /// Last value seen before giving up
        last_observed: Option<String>,
        /// Time spent waiting
        elapsed: Duration,
    },

    /// This instance is no longer the leader
    #[error("leadership lost, write-side activity halted")]
    LeadershipLost,

    /// Misconfiguration discovered while running an operation
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of what is misconfigured
        message: String,
    },

    /// A wait was abandoned by its caller
    #[error("{operation} cancelled")]
    Cancelled {
        /// Operation that was cancelled
        operation: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error{}: {message}", .kind.as_ref().map(|k| format!(" for {k}")).unwrap_or_default())]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "lease")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            profile: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with profile context and field path
    pub fn validation_for_field(
        profile: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            profile: profile.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a conflict error
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>, attempts: u32) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
            attempts,
        }
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether the reconciler should retry after this error
    ///
    /// Validation, configuration and serialization errors need a spec or
    /// deployment change. Rollout timeouts are left to the caller.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { .. }
            | Error::Conflict { .. }
            | Error::LeadershipLost
            | Error::Internal { .. } => true,
            Error::Validation { .. }
            | Error::RolloutTimeout { .. }
            | Error::Configuration { .. }
            | Error::Cancelled { .. }
            | Error::Serialization { .. } => false,
        }
    }

    /// Whether this is an HTTP 409 from the API server
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(e)
            } if e.code == 409
        )
    }

    /// Whether this is an HTTP 404 from the API server
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(e)
            } if e.code == 404
        )
    }

    /// Machine-readable reason used in status conditions
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Kube { .. } => "KubernetesError",
            Error::Validation { .. } => "ValidationFailed",
            Error::Conflict { .. } => "ConflictRetriesExhausted",
            Error::RolloutTimeout { .. } => "RolloutTimedOut",
            Error::LeadershipLost => "LeadershipLost",
            Error::Configuration { .. } => "ConfigurationError",
            Error::Cancelled { .. } => "Cancelled",
            Error::Serialization { .. } => "SerializationFailed",
            Error::Internal { .. } => "InternalError",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    #[test]
    fn validation_message_includes_field() {
        let err = Error::validation_for_field("p1", "spec.cpu.reserved", "required");
        let msg = err.to_string();
        assert!(msg.contains("p1"));
        assert!(msg.contains("spec.cpu.reserved"));
        assert!(msg.contains("required"));
    }

    #[test]
    fn validation_message_without_field() {
        let err = Error::validation("bad");
        assert_eq!(err.to_string(), "validation error for unknown: bad");
    }

    #[test]
    fn rollout_timeout_message_names_everything() {
        let err = Error::RolloutTimeout {
            pool: "worker-cnf".to_string(),
            stage: RolloutStage::Condition,
            condition_type: "Updated".to_string(),
            desired: "True".to_string(),
            last_observed: Some("False".to_string()),
            elapsed: Duration::from_secs(120),
        };
        let msg = err.to_string();
        assert!(msg.contains("worker-cnf"));
        assert!(msg.contains("condition"));
        assert!(msg.contains("Updated"));
        assert!(msg.contains("False"));
        assert!(msg.contains("120s"));
    }

    #[test]
    fn retryable_classification() {
        assert!(api_error(500).is_retryable());
        assert!(Error::conflict("MachineConfig", "performance-p1", 3).is_retryable());
        assert!(Error::LeadershipLost.is_retryable());
        assert!(!Error::validation("bad").is_retryable());
        assert!(!Error::configuration("zero nodes").is_retryable());
    }

    #[test]
    fn status_code_helpers() {
        assert!(api_error(409).is_conflict());
        assert!(!api_error(409).is_not_found());
        assert!(api_error(404).is_not_found());
        assert!(!Error::validation("x").is_conflict());
    }

    #[test]
    fn reasons_are_camel_case() {
        assert_eq!(Error::validation("x").reason(), "ValidationFailed");
        assert_eq!(Error::configuration("x").reason(), "ConfigurationError");
    }
}
