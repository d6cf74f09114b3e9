//! Error types for the Dask operator
//!
//! Errors carry the resource and field context needed to debug a failed
//! reconcile from the operator logs alone. `is_retryable` decides whether a
//! controller hands the failure back to the watch queue for backoff, or parks
//! the object until its spec changes.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Dask operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for a DaskCluster or DaskJob spec
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.script")
        field: Option<String>,
    },

    /// A child resource exists under the expected name but is owned by something else
    #[error("ownership mismatch for {kind} {name}: expected owner {expected}, found {found}")]
    OwnershipMismatch {
        /// Kind of the child resource (Deployment, Service, ...)
        kind: String,
        /// Name of the child resource
        name: String,
        /// Owner the operator expected (`<apiVersion>/<kind>/<name>`)
        expected: String,
        /// Owner actually recorded on the resource, or "none"
        found: String,
    },

    /// Serialization or rendering error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being rendered (if known)
        kind: Option<String>,
    },

    /// Remote job script could not be fetched
    #[error("script fetch error for {url}: {message}")]
    ScriptFetch {
        /// URL that was requested
        url: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "observer")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an ownership mismatch error
    pub fn ownership_mismatch(
        kind: impl Into<String>,
        name: impl Into<String>,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        Self::OwnershipMismatch {
            kind: kind.into(),
            name: name.into(),
            expected: expected.into(),
            found: found.into(),
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

    /// Create a script fetch error
    pub fn script_fetch(url: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ScriptFetch {
            url: url.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Only a job script that can never run waits for a spec change.
    /// Kubernetes failures are not told apart: throttling, RBAC gaps and
    /// conflicts can all clear without the parent changing, so they go back
    /// to the queue. Ownership collisions are retried too since the
    /// colliding object may be removed by hand.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { .. } => true,
            Error::Validation { .. } => false,
            Error::OwnershipMismatch { .. } => true,
            Error::Serialization { .. } => true,
            Error::ScriptFetch { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the resource name if this error is associated with a specific resource
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::Validation { resource, .. } => Some(resource),
            Error::OwnershipMismatch { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
