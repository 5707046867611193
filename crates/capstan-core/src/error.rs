//! Error taxonomy shared by every Capstan crate.
//!
//! Collaborator implementations translate their underlying failures into
//! these kinds so the rollout engine can decide retry behavior from the
//! kind alone (`Unavailable` retries, `InvalidArgument` fails the rollout,
//! `StaleVersion` means another writer advanced the status).

use thiserror::Error;

/// Result type alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the engine and its collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Optimistic-concurrency rejection on a versioned write.
    #[error("stale version: {0}")]
    StaleVersion(String),

    /// Transient failure; the operation may succeed on retry.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Non-retryable, but not fatal to stored data.
    #[error("aborted: {0}")]
    Aborted(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// The human-readable message without the kind prefix.
    ///
    /// Rollout status messages store this bare text.
    pub fn message(&self) -> &str {
        match self {
            Error::InvalidArgument(m)
            | Error::NotFound(m)
            | Error::AlreadyExists(m)
            | Error::FailedPrecondition(m)
            | Error::StaleVersion(m)
            | Error::Unavailable(m)
            | Error::Aborted(m)
            | Error::Internal(m) => m,
        }
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Error::InvalidArgument(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    pub fn is_stale_version(&self) -> bool {
        matches!(self, Error::StaleVersion(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::Unavailable(_))
    }
}
