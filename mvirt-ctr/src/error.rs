//! Error types for mvirt-ctr.

use std::fmt;

use thiserror::Error;

/// Coarse classification of a failure, stable across error sources.
///
/// The API layer maps these onto response codes; sessions publish them as
/// part of their terminal result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A required session channel never attached.
    ConnectTimeout,
    /// The process or transfer could not begin.
    StartFailure,
    /// A migration phase failed after it started.
    PhaseFailure,
    /// The container runtime rejected a call.
    Runtime,
    /// Instance or snapshot absent from the metadata store.
    NotFound,
    /// The caller sent something unusable: a bad name, an unknown action,
    /// a malformed descriptor.
    InvalidArgument,
    /// The target exists already or is in a state that forbids the call.
    Conflict,
    /// Local I/O, store or encoding failure.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::ConnectTimeout => "connect-timeout",
            ErrorKind::StartFailure => "start-failure",
            ErrorKind::PhaseFailure => "phase-failure",
            ErrorKind::Runtime => "runtime-error",
            ErrorKind::NotFound => "not-found",
            ErrorKind::InvalidArgument => "invalid-argument",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Errors returned by mvirt-ctr operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("timed out waiting for channel connections: {0}")]
    ConnectTimeout(String),

    #[error("failed to start: {0}")]
    StartFailure(String),

    #[error("migration {phase} failed: {message}")]
    PhaseFailure { phase: String, message: String },

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConnectTimeout(_) => ErrorKind::ConnectTimeout,
            Error::StartFailure(_) => ErrorKind::StartFailure,
            Error::PhaseFailure { .. } => ErrorKind::PhaseFailure,
            Error::Runtime(_) => ErrorKind::Runtime,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Protocol(_) | Error::Store(_) | Error::Io(_) | Error::Json(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn phase(phase: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::PhaseFailure {
            phase: phase.into(),
            message: message.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Error::Protocol(e.to_string())
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::Io(std::io::Error::from(e))
    }
}

/// Cloneable terminal result of a session, published to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct SessionFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl SessionFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&Error> for SessionFailure {
    fn from(e: &Error) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<SessionFailure> for Error {
    fn from(f: SessionFailure) -> Self {
        match f.kind {
            ErrorKind::ConnectTimeout => Error::ConnectTimeout(f.message),
            ErrorKind::StartFailure => Error::StartFailure(f.message),
            ErrorKind::PhaseFailure => Error::PhaseFailure {
                phase: "session".to_string(),
                message: f.message,
            },
            ErrorKind::Runtime => Error::Runtime(f.message),
            ErrorKind::NotFound => Error::NotFound(f.message),
            ErrorKind::InvalidArgument => Error::InvalidArgument(f.message),
            ErrorKind::Conflict => Error::Conflict(f.message),
            ErrorKind::Internal => Error::Protocol(f.message),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            Error::ConnectTimeout("stderr".into()).kind(),
            ErrorKind::ConnectTimeout
        );
        assert_eq!(Error::phase("handshake", "boom").kind(), ErrorKind::PhaseFailure);
        assert_eq!(
            Error::Io(std::io::Error::other("x")).kind(),
            ErrorKind::Internal
        );
        assert_eq!(
            Error::Protocol("bad frame".into()).kind(),
            ErrorKind::Internal
        );
        assert_eq!(
            Error::InvalidArgument("name".into()).kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(Error::Conflict("exists".into()).kind(), ErrorKind::Conflict);
        assert_eq!(ErrorKind::InvalidArgument.to_string(), "invalid-argument");
        assert_eq!(ErrorKind::Conflict.to_string(), "conflict");
        assert_eq!(ErrorKind::Internal.to_string(), "internal");
    }

    #[test]
    fn test_session_failure_keeps_kind() {
        let err = Error::StartFailure("instance is not running".into());
        let failure = SessionFailure::from(&err);
        assert_eq!(failure.kind, ErrorKind::StartFailure);
        assert!(failure.message.contains("not running"));

        let back: Error = failure.into();
        assert_eq!(back.kind(), ErrorKind::StartFailure);
    }

    #[test]
    fn test_io_not_found() {
        let err = Error::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(err.is_not_found());
        assert!(!Error::Conflict("x".into()).is_not_found());
    }
}
