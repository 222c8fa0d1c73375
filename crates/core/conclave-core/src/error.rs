//! Error handling types shared across the Conclave crates.
//!
//! Public boundaries never panic and never leak collaborator error types:
//! every failure is mapped onto one of the kinds below before it crosses a
//! crate boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for Conclave operations
pub type ConclaveResult<T> = std::result::Result<T, ConclaveError>;

/// Classification of a [`ConclaveError`], used where callers need to match
/// on the failure without caring about the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    PermissionDenied,
    Conflict,
    InvalidState,
    Unavailable,
    Timeout,
    ResourceExhausted,
    Internal,
}

/// The error type used at every Conclave public boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConclaveError {
    /// Input failed schema-level validation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Referenced entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The access guard rejected the operation
    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    /// Duplicate vote, duplicate join, or similar collision
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Acting on a closed session, closed vote, or otherwise wrong state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A required collaborator is unreachable and no fallback applies
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Deadline or configured timeout expired
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Concurrency or capacity cap reached
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Unexpected internal failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConclaveError {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a permission denied error carrying the guard's reason verbatim
    pub fn permission_denied(reason: impl Into<String>) -> Self {
        Self::PermissionDenied {
            reason: reason.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create an unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if this is a permission denial
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }

    /// Check if this is a not-found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this is a conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<anyhow::Error> for ConclaveError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for ConclaveError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization error: {err}"))
    }
}
