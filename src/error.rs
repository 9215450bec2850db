//! Error taxonomy shared by the ledger, the lifetime tracker and the alarm emitter
//!
//! Callers match on [`Error::kind`] rather than on store error strings. Only
//! [`ErrorKind::Storage`] is worth retrying: every write runs inside a single
//! transaction, so a failed call leaves nothing behind.

use thiserror::Error;

/// Substring carried by the triggers that guard `batches_raw`.
pub(crate) const APPEND_ONLY_MARKER: &str = "append-only";

/// Coarse classification of [`Error`], stable across store backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Storage,
    InvariantViolation,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input; the caller must fix it before retrying.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate tombstone or a similar write the store already holds.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("query error: {0}")]
    Query(#[source] diesel::result::Error),

    #[error("connection error: {0}")]
    Connection(String),

    /// Raw-row mutation or a missing tick cursor. Never swallow this.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Query(_) | Error::Connection(_) => ErrorKind::Storage,
            Error::InvariantViolation(_) => ErrorKind::InvariantViolation,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Storage
    }
}

impl From<diesel::result::Error> for Error {
    fn from(e: diesel::result::Error) -> Self {
        match e {
            diesel::result::Error::DatabaseError(_, ref info)
                if info.message().contains(APPEND_ONLY_MARKER) =>
            {
                Error::InvariantViolation(info.message().to_string())
            }
            other => Error::Query(other),
        }
    }
}

impl From<diesel::r2d2::PoolError> for Error {
    fn from(e: diesel::r2d2::PoolError) -> Self {
        Error::Connection(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use diesel::result::{DatabaseErrorKind, Error as DieselError};

    #[test]
    fn test_trigger_abort_maps_to_invariant_violation() {
        let err = Error::from(DieselError::DatabaseError(
            DatabaseErrorKind::Unknown,
            Box::new("UPDATE rejected: batches_raw is append-only".to_string()),
        ));
        assert_eq!(err.kind(), ErrorKind::InvariantViolation);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_other_database_errors_are_storage() {
        let err = Error::from(DieselError::DatabaseError(
            DatabaseErrorKind::Unknown,
            Box::new("database is locked".to_string()),
        ));
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_not_found_is_not_retryable() {
        let err = Error::NotFound("raw measurement 7".into());
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "not found: raw measurement 7");
    }
}
