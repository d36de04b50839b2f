//! # Errors
//!
//! The error taxonomy of the holder engine: session errors (optionally
//! carrying the structured error a remote server returned), enrollment
//! errors, and fatal startup errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identifier::SchemeManagerIdentifier;

/// The structured error body a keyshare or issuance server may return
/// alongside a non-2xx status.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct RemoteError {
    /// HTTP status of the response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    /// Server-defined error name, e.g. `USER_BLOCKED`.
    #[serde(rename = "error", skip_serializing_if = "Option::is_none")]
    pub error_name: Option<String>,

    /// Free-form or numeric payload accompanying the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Classifies a [`SessionError`].
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ErrorType {
    /// The server answered with something the protocol does not allow.
    ServerResponse,
    /// The request referenced a scheme manager unknown to the configuration.
    UnknownSchemeManager,
    /// The transport failed, or the server returned a non-2xx status.
    Transport,
    /// A cryptographic operation (builder, proof, token verification) failed.
    Crypto,
}

/// An error terminating a session. Remote errors keep the server's
/// structured body so callers can dispatch on the error name and status.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{error_type:?}: {message}")]
pub struct SessionError {
    /// The error class.
    pub error_type: ErrorType,
    /// Human-readable description.
    pub message: String,
    /// The server's structured error, when one was returned.
    pub remote_error: Option<RemoteError>,
}

impl SessionError {
    /// A session error without a remote component.
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self { error_type, message: message.into(), remote_error: None }
    }

    /// A transport-class error carrying the server's structured body.
    pub fn remote(remote: RemoteError) -> Self {
        let message = remote
            .error_name
            .clone()
            .unwrap_or_else(|| format!("server returned status {:?}", remote.status));
        Self { error_type: ErrorType::Transport, message, remote_error: Some(remote) }
    }

    /// The HTTP status of the remote error, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        self.remote_error.as_ref().and_then(|r| r.status)
    }

    /// The server-defined error name, if any.
    #[must_use]
    pub fn error_name(&self) -> Option<&str> {
        self.remote_error.as_ref().and_then(|r| r.error_name.as_deref())
    }
}

/// Errors aborting a keyshare server enrollment. Fatal to the enrollment
/// attempt, never to the client.
#[derive(Debug, Error)]
pub enum EnrollmentError {
    /// The PIN does not meet the minimum length.
    #[error("PIN too short, must be at least {minimum} characters")]
    PinTooShort {
        /// The required minimum length.
        minimum: usize,
    },

    /// The scheme manager is not in the configuration.
    #[error("unknown scheme manager {0}")]
    UnknownSchemeManager(SchemeManagerIdentifier),

    /// The scheme manager does not run a keyshare server.
    #[error("scheme manager {0} has no keyshare server")]
    NoKeyshareServer(SchemeManagerIdentifier),

    /// The issuance session for the keyshare login credential failed.
    #[error("keyshare enrollment failed: {0}")]
    Session(String),

    /// The keyshare server rejected the registration.
    #[error(transparent)]
    Transport(#[from] SessionError),

    /// Persistence failed.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Fatal errors while constructing the client.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// More than one distributed scheme is missing its keyshare enrollment;
    /// at most one enrollment may be in flight.
    #[error("too many keyshare servers: {0} unenrolled distributed schemes")]
    TooManyKeyshareServers(usize),

    /// Loading persisted state failed.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_accessors() {
        let err = SessionError::remote(RemoteError {
            status: Some(403),
            error_name: Some("USER_BLOCKED".into()),
            message: Some("600".into()),
        });
        assert_eq!(err.status(), Some(403));
        assert_eq!(err.error_name(), Some("USER_BLOCKED"));
        assert_eq!(err.error_type, ErrorType::Transport);
    }
}
