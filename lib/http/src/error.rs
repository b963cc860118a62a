//! Error types for the HTTP client.
//!
//! Setup failures are reported as [`HttpError`]. Failures of individual
//! calls are translated into the conversation engine's
//! [`RemoteError`] so callers can treat every backend alike.

use counsel_conversation::RemoteError;
use reqwest::StatusCode;
use std::fmt;

/// Errors constructing the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    /// The base URL could not be parsed or cannot carry a path.
    InvalidBaseUrl { url: String, reason: String },
    /// The underlying HTTP client could not be built.
    ClientBuild { reason: String },
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidBaseUrl { url, reason } => {
                write!(f, "invalid base URL {url}: {reason}")
            }
            Self::ClientBuild { reason } => write!(f, "failed to build HTTP client: {reason}"),
        }
    }
}

impl std::error::Error for HttpError {}

/// Maps a transport-level failure.
pub(crate) fn transport_error(e: &reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout
    } else if e.is_decode() {
        RemoteError::InvalidResponse {
            reason: e.to_string(),
        }
    } else {
        RemoteError::Unavailable {
            reason: e.to_string(),
        }
    }
}

/// Maps an unsuccessful status.
pub(crate) fn status_error(status: StatusCode, body: String, resource: &str) -> RemoteError {
    if status == StatusCode::NOT_FOUND {
        return RemoteError::NotFound {
            resource: resource.to_string(),
        };
    }
    let reason = if body.trim().is_empty() {
        status
            .canonical_reason()
            .unwrap_or("unknown status")
            .to_string()
    } else {
        body
    };
    RemoteError::Rejected {
        status: status.as_u16(),
        reason,
    }
}
