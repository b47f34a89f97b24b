//! Error types for session management

use parley_runtime::{CompletionError, ModelError};
use thiserror::Error;

use crate::session::SessionId;

/// Session management error type
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Session not found: {0}")]
    NotFound(SessionId),

    #[error("Session {0} already exists")]
    DuplicateSession(SessionId),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Rate limited by provider: {0}")]
    RateLimited(String),

    #[error("Completion failed: {0}")]
    Completion(CompletionError),

    #[error("Logic error: {0}")]
    Invariant(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification the boundary layer turns into a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Caller,
    NotFound,
    Conflict,
    RateLimited,
    Upstream,
    Fatal,
}

impl ContextError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) | Self::Model(_) => ErrorKind::Caller,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::DuplicateSession(_) => ErrorKind::Conflict,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::Completion(_) => ErrorKind::Upstream,
            Self::Invariant(_)
            | Self::Tokenizer(_)
            | Self::Persistence(_)
            | Self::Serialization(_) => ErrorKind::Fatal,
        }
    }

    /// Broken invariant: the operation must abort, never recover.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }

    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant(message.into())
    }
}

impl From<CompletionError> for ContextError {
    fn from(err: CompletionError) -> Self {
        match err {
            CompletionError::RateLimited(message) => Self::RateLimited(message),
            other => Self::Completion(other),
        }
    }
}

/// Result type for session operations
pub type ContextResult<T> = Result<T, ContextError>;
