//! Error taxonomy of the synchronization core.

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// Failure classes the transport must distinguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The session is no longer authorized.
    Unauthorized,
    /// The request never reached the server or timed out.
    Network,
    /// The server rejected the input; never retried.
    Validation,
    /// The server failed to handle a well-formed request.
    Server,
    /// The addressed record does not exist (any more).
    NotFound,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Network => "network",
            ErrorKind::Validation => "validation",
            ErrorKind::Server => "server",
            ErrorKind::NotFound => "not-found",
        }
    }

    /// Whether the transport may retry before reporting a final failure.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Server)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final failure reported by the transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct TransportError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Server, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }
}

/// Errors surfaced by the synchronization core.
///
/// `Clone` because one fetch result is shared by every deduplicated waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("fetch of `{key}` failed: {source}")]
    FetchFailed {
        key: String,
        #[source]
        source: TransportError,
    },
    #[error("mutation {mutation} on `{resource}` failed: {source}")]
    MutationFailed {
        mutation: Uuid,
        resource: &'static str,
        #[source]
        source: TransportError,
    },
    /// Restoring a snapshot only swaps in-memory entries; reaching this is a defect.
    #[error("rollback of mutation {mutation} did not complete: {reason}")]
    RollbackFailed { mutation: Uuid, reason: String },
    #[error("invalid resource key: {reason}")]
    InvalidKey { reason: String },
    #[error("session expired: {message}")]
    AuthExpired { message: String },
}

impl SyncError {
    pub fn invalid_key(reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            reason: reason.into(),
        }
    }

    /// Transport failure class behind this error, if any.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            SyncError::FetchFailed { source, .. } | SyncError::MutationFailed { source, .. } => {
                Some(source.kind)
            }
            SyncError::AuthExpired { .. } => Some(ErrorKind::Unauthorized),
            SyncError::RollbackFailed { .. } | SyncError::InvalidKey { .. } => None,
        }
    }

    /// Message suitable for an inline notification.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::FetchFailed { source, .. } | SyncError::MutationFailed { source, .. } => {
                source.message.clone()
            }
            SyncError::AuthExpired { .. } => "Your session has expired. Sign in again.".to_string(),
            other => other.to_string(),
        }
    }
}
