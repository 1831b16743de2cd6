//! Error types for content loading
//!
//! `LoadError` is what request callbacks receive. Every variant is terminal
//! for the request it is delivered to; nothing is retried automatically.

use thiserror::Error;

use crate::service::ServiceError;

/// Failure delivered to an `on_failed` callback
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("Key is null or empty.")]
    EmptyKey,

    #[error("onLoaded callback is required.")]
    MissingCallback,

    #[error("Invalid ID (null/empty/whitespace).")]
    InvalidId,

    #[error("Exception starting load for '{key}': {reason}")]
    StartFailed { key: String, reason: String },

    #[error("Failed to load '{key}': {reason}")]
    ResolutionFailed { key: String, reason: String },

    #[error("Failed to download dependencies for '{key}': {reason}")]
    DownloadFailed { key: String, reason: String },

    #[error("Load of '{key}' was cancelled by unload")]
    Cancelled { key: String },
}

/// Coarse classification of a `LoadError`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected synchronously, the backend was never called
    InvalidInput,
    /// The backend raised while starting the operation
    BackendStartFailure,
    /// The backend operation finished with a failed status
    BackendResolutionFailure,
    /// The request was dropped by an unload while in flight
    Cancelled,
}

impl LoadError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            LoadError::EmptyKey | LoadError::MissingCallback | LoadError::InvalidId => {
                ErrorKind::InvalidInput
            }
            LoadError::StartFailed { .. } => ErrorKind::BackendStartFailure,
            LoadError::ResolutionFailed { .. } | LoadError::DownloadFailed { .. } => {
                ErrorKind::BackendResolutionFailure
            }
            LoadError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }
}

/// Error raised by a backend that cannot start an operation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct BackendError(pub String);

impl BackendError {
    /// Backend error with a message
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Crate-level errors (construction, configuration, lifecycle)
#[derive(Debug, Error)]
pub enum ContentError {
    #[error("No tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config parse error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),
}

pub type ContentResult<T> = Result<T, ContentError>;
