//! Error types for the conversation crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `SessionError`: Session store operations
//! - `RemoteError`: Calls to the remote conversation store and chat backend
//! - `CacheError`: Local persistence
//! - `ChatError`: What the service surfaces to its caller

use counsel_core::{LocalSessionId, RemoteSessionId};
use std::fmt;

/// Errors from session store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Session not found.
    NotFound { id: LocalSessionId },
    /// The session is already bound to a different remote id.
    RemoteIdAlreadyAssigned {
        id: LocalSessionId,
        existing: RemoteSessionId,
        incoming: RemoteSessionId,
    },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { id } => write!(f, "session not found: {id}"),
            Self::RemoteIdAlreadyAssigned {
                id,
                existing,
                incoming,
            } => write!(
                f,
                "session {id} already bound to remote {existing}, cannot rebind to {incoming}"
            ),
        }
    }
}

impl std::error::Error for SessionError {}

/// Errors from remote collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The backend could not be reached.
    Unavailable { reason: String },
    /// The call did not complete in time.
    Timeout,
    /// The requested resource does not exist.
    NotFound { resource: String },
    /// The backend answered with an error status.
    Rejected { status: u16, reason: String },
    /// The backend answered with something we could not decode.
    InvalidResponse { reason: String },
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { reason } => write!(f, "remote unavailable: {reason}"),
            Self::Timeout => write!(f, "remote call timed out"),
            Self::NotFound { resource } => write!(f, "remote resource not found: {resource}"),
            Self::Rejected { status, reason } => {
                write!(f, "remote rejected request ({status}): {reason}")
            }
            Self::InvalidResponse { reason } => {
                write!(f, "invalid remote response: {reason}")
            }
        }
    }
}

impl std::error::Error for RemoteError {}

/// Errors from the local cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Reading the cache failed.
    ReadFailed { reason: String },
    /// Writing the cache failed.
    WriteFailed { reason: String },
    /// The cached value could not be decoded.
    Corrupt { reason: String },
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFailed { reason } => write!(f, "cache read failed: {reason}"),
            Self::WriteFailed { reason } => write!(f, "cache write failed: {reason}"),
            Self::Corrupt { reason } => write!(f, "cache contents corrupt: {reason}"),
        }
    }
}

impl std::error::Error for CacheError {}

/// Errors surfaced by [`ChatService`](crate::ChatService).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// The query was rejected before any network call.
    Validation { reason: String },
    /// The remote store could not be reached.
    RemoteUnavailable { reason: String },
    /// The chat backend failed to answer; retry with `query`.
    SendFailure { query: String, reason: String },
    /// The session id is stale or was deleted.
    SessionNotFound { id: LocalSessionId },
}

impl ChatError {
    /// Returns true if re-invoking the same operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SendFailure { .. } | Self::RemoteUnavailable { .. })
    }

    /// Returns the original query of a failed send.
    #[must_use]
    pub fn retry_query(&self) -> Option<&str> {
        match self {
            Self::SendFailure { query, .. } => Some(query),
            _ => None,
        }
    }
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation { reason } => write!(f, "invalid query: {reason}"),
            Self::RemoteUnavailable { reason } => write!(f, "remote unavailable: {reason}"),
            Self::SendFailure { reason, .. } => write!(f, "send failed: {reason}"),
            Self::SessionNotFound { id } => write!(f, "session not found: {id}"),
        }
    }
}

impl std::error::Error for ChatError {}

impl From<SessionError> for ChatError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound { id } => Self::SessionNotFound { id },
            other => Self::RemoteUnavailable {
                reason: other.to_string(),
            },
        }
    }
}
