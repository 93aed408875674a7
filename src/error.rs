//! Errors at the binary boundary.

use thiserror::Error;

use crate::config::LoadError;
use crate::infra::error::InfraError;
use crate::sync::SyncError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Validation(_) | AppError::Sync(SyncError::InvalidKey { .. }) => 2,
            AppError::Sync(SyncError::AuthExpired { .. }) => 3,
            _ => 1,
        }
    }
}
