//! Driver error → domain error translation.
//!
//! All knowledge of SQLSTATE codes lives here. Stores and the transaction manager
//! hand every [`DriverError`] to an [`ErrorTranslator`] and only ever branch on the
//! resulting [`ErrorKind`].

use crate::error::{DriverError, ErrorKind, StoreError};

pub trait ErrorTranslator: Send + Sync {
    /// Classify a failure reported by the executor. Never drops the source.
    fn translate(&self, err: DriverError) -> StoreError;
}

/// SQLSTATE codes reported by PostgreSQL.
pub mod sqlstate {
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const NOT_NULL_VIOLATION: &str = "23502";
    pub const FOREIGN_KEY_VIOLATION: &str = "23503";
    pub const CHECK_VIOLATION: &str = "23514";
    pub const EXCLUSION_VIOLATION: &str = "23P01";
    pub const QUERY_CANCELED: &str = "57014";
}

/// Translator for PostgreSQL error codes
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresTranslator;

impl PostgresTranslator {
    fn classify(code: &str) -> ErrorKind {
        match code {
            sqlstate::UNIQUE_VIOLATION => ErrorKind::RowAlreadyExist,
            sqlstate::NOT_NULL_VIOLATION
            | sqlstate::FOREIGN_KEY_VIOLATION
            | sqlstate::CHECK_VIOLATION
            | sqlstate::EXCLUSION_VIOLATION => ErrorKind::ConstraintViolation,
            sqlstate::QUERY_CANCELED => ErrorKind::Canceled,
            _ => ErrorKind::Storage,
        }
    }
}

impl ErrorTranslator for PostgresTranslator {
    fn translate(&self, err: DriverError) -> StoreError {
        let (kind, message) = match &err {
            DriverError::Database(failure) => (Self::classify(&failure.code), failure.pretty()),
            DriverError::TransactionClosed => (
                ErrorKind::NoTransaction,
                "transaction has already been committed or rolled back".to_string(),
            ),
            DriverError::Canceled(reason) => (ErrorKind::Canceled, reason.clone()),
            other => (ErrorKind::Storage, other.to_string()),
        };
        StoreError::new(kind, message).with_source(err)
    }
}
