//! Typed error conditions surfaced to callers.
//!
//! Data corruption and untrusted input never appear here: the repository
//! absorbs both. What remains is either retryable (`ServiceUnavailable`,
//! `MergeInProgress`, timeouts) or a rejected request.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepoError {
    /// Storage not ready or a referenced commit is not known locally yet.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// A merge holds the key; retry the write once it resolves.
    #[error("merge in progress for key {key}")]
    MergeInProgress { key: String },
}

impl RepoError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RepoError::ServiceUnavailable(_) | RepoError::MergeInProgress { .. }
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// Transport failure or missing response; retried on the next tick.
    #[error("sync service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("sync request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("caller is not authorized to sync")]
    Unauthorized,

    #[error("malformed sync payload: {0}")]
    Protocol(String),
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::ServiceUnavailable(_) | SyncError::Timeout(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Protocol(err.to_string())
    }
}
