use std::fmt;

use thiserror::Error;

/// Errors returned by the activity trail.
#[derive(Debug, Error)]
pub enum Error {
    /// The request was rejected before anything was persisted.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A required collaborator was not supplied at construction.
    #[error("not configured: {0} is required")]
    NotConfigured(&'static str),

    /// The access policy refused the request.
    #[error("policy violation: {0}")]
    Violation(#[from] Violation),

    /// The storage backend failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The caller's deadline passed before the operation finished.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl Error {
    /// Returns true for cancellation and deadline errors.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }
}

/// A policy violation with details about what failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct Violation {
    /// The kind of violation that occurred
    pub kind: ViolationKind,
    /// Human-readable message explaining the violation
    pub message: String,
}

impl Violation {
    /// Creates a new violation.
    pub fn new(kind: ViolationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// The kind of policy violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// No actor was supplied
    Unauthenticated,
    /// The actor carries no tenant to scope the request to
    MissingScope,
    /// None of the requested channels is on the allow-list
    ChannelNotAllowed,
    /// Every remaining channel is on the deny-list
    ChannelDenied,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationKind::Unauthenticated => write!(f, "unauthenticated"),
            ViolationKind::MissingScope => write!(f, "missing scope"),
            ViolationKind::ChannelNotAllowed => write!(f, "channel not allowed"),
            ViolationKind::ChannelDenied => write!(f, "channel denied"),
        }
    }
}

/// Error returned by an [`ActivityStore`](crate::store::ActivityStore).
///
/// # Examples
///
/// ```
/// use activity_trail::{StoreError, StoreErrorKind};
///
/// let error = StoreError::with_message(StoreErrorKind::NotFound, "record 42");
/// assert_eq!(error.kind(), StoreErrorKind::NotFound);
/// assert_eq!(error.message(), Some("record 42"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    kind: StoreErrorKind,
    message: Option<String>,
}

impl StoreError {
    /// Creates a new store error with the specified kind.
    pub fn new(kind: StoreErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    /// Creates a new store error with a custom message.
    pub fn with_message(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    /// Returns the error kind.
    pub fn kind(&self) -> StoreErrorKind {
        self.kind
    }

    /// Returns the error message, if any.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(msg) = &self.message {
            write!(f, "store error ({}): {}", self.kind, msg)
        } else {
            write!(f, "store error ({})", self.kind)
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::with_message(StoreErrorKind::Conflict, err.to_string())
            }
            _ => StoreError::with_message(StoreErrorKind::Backend, err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::with_message(StoreErrorKind::Serialization, err.to_string())
    }
}

/// Kind of store error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// No record with the requested identifier exists.
    NotFound,
    /// A record with the same identifier already exists.
    Conflict,
    /// The backend failed to execute the operation.
    Backend,
    /// A payload could not be encoded or decoded.
    Serialization,
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::Conflict => write!(f, "conflict"),
            Self::Backend => write!(f, "backend failure"),
            Self::Serialization => write!(f, "serialization"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display() {
        let error = StoreError::new(StoreErrorKind::NotFound);
        assert_eq!(error.to_string(), "store error (not found)");

        let error = StoreError::with_message(StoreErrorKind::Backend, "disk full");
        assert_eq!(error.to_string(), "store error (backend failure): disk full");
    }

    #[test]
    fn violation_display_includes_kind() {
        let v = Violation::new(ViolationKind::ChannelDenied, "bulk");
        assert_eq!(v.to_string(), "channel denied: bulk");
        let err: Error = v.into();
        assert!(err.to_string().starts_with("policy violation"));
    }

    #[test]
    fn cancellation_errors_are_classified() {
        assert!(Error::Cancelled.is_cancellation());
        assert!(Error::DeadlineExceeded.is_cancellation());
        assert!(!Error::InvalidInput("x".into()).is_cancellation());
    }
}
