//! Error types for the credential lifecycle.
//!
//! `SessionError` is what callers of the token manager see. `RefreshFailure`
//! is the cause of a failed renewal; it is `Clone` so the same failure can be
//! handed to every caller waiting on a shared refresh.

use std::time::Duration;

use thiserror::Error;

use crate::api::ApiError;

/// A credential could not be decoded into claims.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Token is not a three-part signed token")]
    Malformed,

    #[error("Token payload is not valid base64url: {0}")]
    Encoding(String),

    #[error("Token payload is not a recognized claim set: {0}")]
    Claims(String),
}

/// Why a renewal did not produce a new credential.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    #[error("renewal rejected by server")]
    Unauthorized,

    #[error("renewal request failed: {0}")]
    Network(String),

    #[error("renewal timed out after {0:?}")]
    Timeout(Duration),

    #[error("renewal returned an unusable credential: {0}")]
    InvalidResponse(String),

    #[error("credential expired before it could be renewed")]
    CredentialExpired,
}

impl From<ApiError> for RefreshFailure {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Unauthorized | ApiError::AccessDenied(_) => RefreshFailure::Unauthorized,
            ApiError::InvalidResponse(msg) => RefreshFailure::InvalidResponse(msg),
            other => RefreshFailure::Network(other.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid credential: {0}")]
    Decode(#[from] DecodeError),

    #[error("Credential has expired")]
    Expired,

    #[error("Not authenticated")]
    NotAuthenticated,

    /// The renewal this caller started failed. Fatal for the session.
    #[error("Credential refresh failed: {0}")]
    RefreshFailed(RefreshFailure),

    /// Delivered to a caller that was waiting on a shared refresh which failed.
    #[error("Waiting request rejected: {0}")]
    QueueRejected(RefreshFailure),

    /// The session was cleared while the caller was waiting on a refresh.
    #[error("Refresh cancelled because the session was cleared")]
    Cancelled,

    /// A request retried once with a renewed credential was still unauthorized.
    #[error("Request still unauthorized after credential refresh")]
    RetryExhausted(#[source] ApiError),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl SessionError {
    /// True when the session can no longer be used and the user must sign in again.
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self,
            SessionError::NotAuthenticated
                | SessionError::RefreshFailed(_)
                | SessionError::QueueRejected(_)
                | SessionError::Cancelled
        )
    }
}
